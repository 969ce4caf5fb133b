use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Auto-reset event. An activation with no waiter stays set until the next
/// wait consumes it.
#[derive(Debug, Default)]
pub struct Signal {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    /// Drops an activation nobody waited for.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
        *set = false;
    }

    /// Returns whether the signal fired before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            let _ = self.cond.wait_for(&mut set, timeout);
        }
        std::mem::take(&mut *set)
    }
}
