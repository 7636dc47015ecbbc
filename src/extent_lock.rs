// vim: tw=80
//! A readers-writer lock that wakes a waiting writer as soon as the last
//! reader drains, for `ZoneFile.extent_mtx`/`extent_cv` (`spec.md` §5, §9
//! "Readers-writer coordination on extents").
//!
//! `std::sync::RwLock` would do, but it makes no promise about writer
//! starvation and gives no hook to observe the "last reader leaves" event
//! the spec calls out explicitly. This is a small hand-rolled primitive in
//! the same spirit as `bfffs-core`'s atomic/Condvar-based synchronization
//! (e.g. `Zone.is_append`): a `Mutex`-guarded state struct plus a `Condvar`,
//! sized to exactly the two access patterns this crate needs (shared reads,
//! exclusive appends/cleaner patches).

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

struct State {
    readers: u32,
    writer_active: bool,
    writer_waiting: u32,
}

pub struct ExtentLock<T> {
    state: Mutex<State>,
    cv: Condvar,
    data: std::cell::UnsafeCell<T>,
}

// Safety: access to `data` is only ever granted through `read()`/`write()`,
// which serialize on `state` exactly like a standard RwLock.
unsafe impl<T: Send> Send for ExtentLock<T> {}
unsafe impl<T: Send> Sync for ExtentLock<T> {}

impl<T> ExtentLock<T> {
    pub fn new(data: T) -> Self {
        ExtentLock {
            state: Mutex::new(State { readers: 0, writer_active: false, writer_waiting: 0 }),
            cv: Condvar::new(),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    /// Acquire shared (reader) access. Blocks while a writer holds or is
    /// waiting for the lock, so that a steady stream of readers can't starve
    /// the cleaner or an append.
    pub fn read(&self) -> ExtentReadGuard<'_, T> {
        let mut guard = self.state.lock().unwrap();
        while guard.writer_active || guard.writer_waiting > 0 {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.readers += 1;
        drop(guard);
        ExtentReadGuard { lock: self }
    }

    /// Acquire exclusive (writer) access. Appends and cleaner patches both
    /// take this, so the two naturally mutually exclude.
    pub fn write(&self) -> ExtentWriteGuard<'_, T> {
        let mut guard = self.state.lock().unwrap();
        guard.writer_waiting += 1;
        while guard.writer_active || guard.readers > 0 {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.writer_waiting -= 1;
        guard.writer_active = true;
        drop(guard);
        ExtentWriteGuard { lock: self }
    }
}

pub struct ExtentReadGuard<'a, T> {
    lock: &'a ExtentLock<T>,
}

impl<'a, T> Deref for ExtentReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for ExtentReadGuard<'a, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.state.lock().unwrap();
        guard.readers -= 1;
        if guard.readers == 0 {
            // Wake pending writers now that the last reader has left.
            self.lock.cv.notify_all();
        }
    }
}

pub struct ExtentWriteGuard<'a, T> {
    lock: &'a ExtentLock<T>,
}

impl<'a, T> Deref for ExtentWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for ExtentWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for ExtentWriteGuard<'a, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.state.lock().unwrap();
        guard.writer_active = false;
        self.lock.cv.notify_all();
    }
}

#[cfg(test)]
mod t {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_run_concurrently() {
        let lock = Arc::new(ExtentLock::new(0u32));
        let g1 = lock.read();
        let g2 = lock.read();
        assert_eq!(*g1, 0);
        assert_eq!(*g2, 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(ExtentLock::new(0u32));
        {
            let mut w = lock.write();
            *w = 42;
        }
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn writer_waits_for_readers_to_drain() {
        let lock = Arc::new(ExtentLock::new(0u32));
        let reader = lock.read();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            let mut w = lock2.write();
            *w += 1;
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(reader);
        handle.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }
}
