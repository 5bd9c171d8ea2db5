use std::sync::Arc;

use super::iteration::IterationRecord;
use super::metrics::PipelineMetricsStorage;

/// Fixed-size ring of iteration records, one slot per allowed outstanding
/// iteration.
///
/// Iteration `n` lives in slot `n % size`. By the time the controller
/// creates it, the slot's previous occupant (iteration `n - size`) has
/// finished, because iterations complete in order and at most `size` are
/// outstanding. The old record is re-initialised in place when nothing else
/// still holds it; otherwise the slot gets a fresh record.
pub(crate) struct Ring {
    slots: Vec<Option<Arc<IterationRecord>>>,
}

impl Ring {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
        }
    }

    pub(crate) fn next_record(
        &mut self,
        number: u64,
        metrics: &PipelineMetricsStorage,
    ) -> Arc<IterationRecord> {
        let index = (number % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];

        if let Some(existing) = slot {
            if let Some(record) = Arc::get_mut(existing) {
                record.reset(number);
                PipelineMetricsStorage::bump(&metrics.ring_reuses);
                return Arc::clone(existing);
            }
        }

        let fresh = Arc::new(IterationRecord::new(number));
        *slot = Some(Arc::clone(&fresh));
        PipelineMetricsStorage::bump(&metrics.ring_allocations);
        fresh
    }

    /// Records still occupying a slot.
    pub(crate) fn records(&self) -> impl Iterator<Item = &Arc<IterationRecord>> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreferenced_slot_is_reused() {
        let metrics = PipelineMetricsStorage::default();
        let mut ring = Ring::new(2);
        drop(ring.next_record(0, &metrics));
        drop(ring.next_record(1, &metrics));
        let record = ring.next_record(2, &metrics);
        assert_eq!(record.number(), 2);
        assert_eq!(metrics.ring_allocations.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(metrics.ring_reuses.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn test_referenced_slot_gets_fresh_record() {
        let metrics = PipelineMetricsStorage::default();
        let mut ring = Ring::new(1);
        let first = ring.next_record(0, &metrics);
        let second = ring.next_record(1, &metrics);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.number(), 0);
        assert_eq!(second.number(), 1);
        assert_eq!(ring.records().count(), 1);
    }
}
