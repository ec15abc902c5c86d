use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

struct SafepointState {
    registered: usize,
    stopped: usize,
}

/// Used to bring all threads with heap access to a safepoint so that the
/// stop-the-world phases of a collection can run. Mutators poll cheaply; arming the
/// safepoint parks every polling mutator until disarm.
pub struct GlobalSafepoint {
    armed: AtomicU32,
    state: Mutex<SafepointState>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> GlobalSafepoint {
        GlobalSafepoint {
            armed: AtomicU32::new(0),
            state: Mutex::new(SafepointState {
                registered: 0,
                stopped: 0,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    pub(crate) fn register(&self) {
        self.state.lock().registered += 1;
    }

    pub(crate) fn deregister(&self) {
        self.state.lock().registered -= 1;
    }

    #[inline(always)]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed) != 0
    }

    /// Mutator fast path. Progress of a pause depends on every mutator reaching
    /// this regularly (allocation does it for free).
    #[inline(always)]
    pub fn poll(&self) {
        if self.is_armed() {
            self.poll_slow();
        }
    }

    #[inline(never)]
    #[cold]
    fn poll_slow(&self) {
        let mut state = self.state.lock();
        state.stopped += 1;
        self.cv_stopped.notify_all();
        while self.armed.load(Ordering::Acquire) != 0 {
            self.cv_resume.wait(&mut state);
        }
        state.stopped -= 1;
    }

    pub(crate) fn arm(&self) {
        self.armed.store(1, Ordering::Release);
    }

    pub(crate) fn disarm(&self) {
        let state = self.state.lock();
        self.armed.store(0, Ordering::Release);
        drop(state);
        self.cv_resume.notify_all();
    }

    /// Blocks until every registered mutator is stopped (polling, or inside a
    /// [`StoppedScope`]).
    pub(crate) fn wait_mutators_stopped(&self) {
        let mut state = self.state.lock();
        while state.stopped < state.registered {
            self.cv_stopped.wait(&mut state);
        }
    }

    /// Marks the current thread as stopped for the duration of the scope. Used by a
    /// mutator that triggers and then waits for a collection.
    pub(crate) fn stopped_scope(&self) -> StoppedScope<'_> {
        let mut state = self.state.lock();
        state.stopped += 1;
        self.cv_stopped.notify_all();
        drop(state);
        StoppedScope { safepoint: self }
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StoppedScope<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl<'a> Drop for StoppedScope<'a> {
    fn drop(&mut self) {
        self.safepoint.state.lock().stopped -= 1;
    }
}
