use std::sync::{Condvar, Mutex};

/// A single-use completion latch.
///
/// The latch starts closed, is opened exactly once with
/// [`complete()`](Self::complete), and stays open. Waiting on an open latch
/// returns immediately, so the waiter and the completer don't need to agree
/// on ordering.
#[derive(Debug)]
pub(crate) struct Completion {
    lock: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Open the latch, waking all waiters. Must be called at most once.
    pub fn complete(&self) {
        let mut done = self.lock.lock().unwrap();
        debug_assert!(!*done);
        *done = true;
        self.cond.notify_all();
    }

    /// Block until the latch is open.
    pub fn wait(&self) {
        let done = self.lock.lock().unwrap();
        let _done = self.cond.wait_while(done, |done| !*done).unwrap();
    }
}
