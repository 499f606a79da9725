//! An auto-resetting one-shot event latch.

use parking_lot::{Condvar, Mutex};

/// A barrier that releases all current waiters on [`signal`](Self::signal)
/// and immediately resets, so later waiters block until the next signal.
///
/// Waiters capture the generation before checking their guarded condition
/// and then wait past it, which closes the window where a signal could be
/// missed between the check and the wait.
pub(crate) struct EventLatch {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl EventLatch {
    pub fn new() -> Self {
        EventLatch {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until a signal arrives after the captured generation. Returns
    /// immediately if one already has.
    pub fn wait_past(&self, generation: u64) {
        let mut current = self.generation.lock();
        while *current == generation {
            self.cond.wait(&mut current);
        }
    }

    /// Release all waiters and reset for the next round.
    pub fn signal(&self) {
        let mut current = self.generation.lock();
        *current = current.wrapping_add(1);
        self.cond.notify_all();
    }
}
