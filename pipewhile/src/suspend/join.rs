use parking_lot::Mutex;

use super::TaskHandle;

/// One-shot result slot with a single waiter.
///
/// The waiter must be the only task calling [`wait`](Self::wait).
pub(crate) struct JoinCell<T> {
    slot: Mutex<Option<T>>,
    waiter: TaskHandle,
}

impl<T> JoinCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            waiter: TaskHandle::new(),
        }
    }

    pub(crate) fn complete(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.waiter.resume();
    }

    /// Suspend the caller until a value is available.
    pub(crate) fn wait(&self) -> T {
        loop {
            if let Some(value) = self.slot.lock().take() {
                return value;
            }
            self.waiter.park();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_join_cell_cross_thread() {
        let cell = Arc::new(JoinCell::new());
        let producer = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.complete(42u32))
        };
        assert_eq!(cell.wait(), 42);
        producer.join().unwrap();
        assert!(!cell.is_complete());
    }

    #[test]
    fn test_join_cell_completed_before_wait() {
        let cell = JoinCell::new();
        cell.complete("done");
        assert!(cell.is_complete());
        assert_eq!(cell.wait(), "done");
    }
}
