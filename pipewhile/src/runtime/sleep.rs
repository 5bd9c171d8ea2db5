use parking_lot::{Condvar, Mutex};

/// Where idle workers wait for work.
///
/// Every push bumps the epoch. A worker reads the epoch, checks its queues
/// once more, and only then sleeps until the epoch moves, so a push that
/// lands between the check and the wait is never missed.
pub(crate) struct Sleep {
    epoch: Mutex<u64>,
    wake: Condvar,
}

impl Sleep {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub(crate) fn notify_one(&self) {
        *self.epoch.lock() += 1;
        self.wake.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        *self.epoch.lock() += 1;
        self.wake.notify_all();
    }

    /// Sleep until the epoch differs from `seen`.
    pub(crate) fn wait(&self, seen: u64) {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            self.wake.wait(&mut epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_returns_after_notify() {
        let sleep = Arc::new(Sleep::new());
        let seen = sleep.epoch();
        let sleeper = {
            let sleep = Arc::clone(&sleep);
            std::thread::spawn(move || sleep.wait(seen))
        };
        sleep.notify_one();
        sleeper.join().unwrap();
        assert_eq!(sleep.epoch(), seen + 1);
    }

    #[test]
    fn test_stale_epoch_does_not_block() {
        let sleep = Sleep::new();
        let seen = sleep.epoch();
        sleep.notify_all();
        sleep.wait(seen);
    }
}
