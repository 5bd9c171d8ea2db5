//! Accounting laws of the stack pool hierarchy, checked against an
//! allocator that counts every handle it creates and destroys.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pipewhile::{PipeError, PipeResult, PoolOptions, StackAllocator, StackPool};
use proptest::prelude::*;

#[derive(Default)]
struct CountingAllocator {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl CountingAllocator {
    fn live(&self) -> usize {
        let destroyed = self.destroyed.load(Ordering::SeqCst);
        self.created.load(Ordering::SeqCst) - destroyed
    }
}

impl StackAllocator for CountingAllocator {
    type Stack = usize;

    fn allocate(&self, _stack_size: usize) -> PipeResult<usize> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    fn deallocate(&self, _stack: usize) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Hierarchy {
    allocator: Arc<CountingAllocator>,
    root: Arc<StackPool<CountingAllocator>>,
    children: Vec<Arc<StackPool<CountingAllocator>>>,
}

impl Hierarchy {
    fn new(ceiling: usize, root_capacity: usize, child_capacity: usize, children: usize) -> Self {
        let allocator = Arc::new(CountingAllocator::default());
        let root = StackPool::new_root(
            "root",
            Arc::clone(&allocator),
            &PoolOptions {
                capacity: root_capacity,
                allocation_ceiling: Some(ceiling),
                ..PoolOptions::root()
            },
        )
        .unwrap();
        let children = (0..children)
            .map(|i| {
                StackPool::new_child(
                    format!("child-{i}"),
                    &root,
                    &PoolOptions {
                        capacity: child_capacity,
                        ..PoolOptions::worker()
                    },
                )
                .unwrap()
            })
            .collect();
        Self {
            allocator,
            root,
            children,
        }
    }

    fn pools(&self) -> impl Iterator<Item = &Arc<StackPool<CountingAllocator>>> {
        std::iter::once(&self.root).chain(self.children.iter())
    }

    fn total(&self) -> isize {
        self.pools().map(|pool| pool.stats().total).sum()
    }

    fn idle(&self) -> usize {
        self.pools().map(|pool| pool.stats().available).sum()
    }

    /// Live handles equal the summed totals and the idle plus held handles.
    fn check(&self, held: usize) {
        let live = self.allocator.live();
        assert_eq!(self.total(), live as isize, "summed totals drifted");
        assert_eq!(self.idle() + held, live, "a handle went missing");
        for pool in self.pools() {
            let stats = pool.stats();
            assert!(stats.available <= stats.capacity, "{} over capacity", pool.name());
            pool.sanity_check("test").unwrap();
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    Discard,
    Drain(usize, usize),
}

fn op(children: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..children).prop_map(Op::Acquire),
        4 => (0..children).prop_map(Op::Release),
        1 => Just(Op::Discard),
        1 => (0..children, 0..4usize).prop_map(|(c, t)| Op::Drain(c, t)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_random_traffic_conserves_handles(
        ceiling in 2usize..24,
        child_capacity in 1usize..12,
        ops in prop::collection::vec(op(3), 1..200),
    ) {
        let hierarchy = Hierarchy::new(ceiling, 8, child_capacity, 3);
        let mut held: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Acquire(c) => match hierarchy.children[c].acquire() {
                    Ok(stack) => held.push(stack),
                    Err(PipeError::ResourceExhausted(_)) => {
                        // Unforwarded surplus in a child may hide free room.
                        prop_assert!(hierarchy.root.stats().total >= ceiling as isize);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                },
                Op::Release(c) => {
                    if let Some(stack) = held.pop() {
                        hierarchy.children[c].release(stack);
                    }
                }
                Op::Discard => {
                    if let Some(stack) = held.pop() {
                        hierarchy.children[0].discard(stack);
                    }
                }
                Op::Drain(c, target) => hierarchy.children[c].drain(target, None),
            }
            prop_assert!(hierarchy.allocator.live() <= ceiling);
            hierarchy.check(held.len());
        }

        for stack in held.drain(..) {
            hierarchy.children[0].release(stack);
        }
        for child in &hierarchy.children {
            child.destroy();
        }
        hierarchy.root.destroy();
        prop_assert_eq!(hierarchy.allocator.live(), 0);
        prop_assert_eq!(hierarchy.root.stats().total, 0);
    }
}

#[test]
fn test_reuse_creates_nothing_new() {
    let hierarchy = Hierarchy::new(64, 16, 8, 2);
    let first: Vec<_> = (0..6).map(|_| hierarchy.children[0].acquire().unwrap()).collect();
    for stack in first {
        hierarchy.children[0].release(stack);
    }
    let created = hierarchy.allocator.created.load(Ordering::SeqCst);

    for _ in 0..100 {
        let stack = hierarchy.children[0].acquire().unwrap();
        hierarchy.children[0].release(stack);
    }
    assert_eq!(hierarchy.allocator.created.load(Ordering::SeqCst), created);
    hierarchy.check(0);
}

#[test]
fn test_ceiling_bounds_whole_hierarchy() {
    let hierarchy = Hierarchy::new(5, 4, 4, 3);
    let mut held = Vec::new();
    for round in 0..10 {
        if let Ok(stack) = hierarchy.children[round % 3].acquire() {
            held.push(stack);
        }
    }
    assert_eq!(held.len(), 5);
    assert_eq!(hierarchy.allocator.live(), 5);
    assert!(matches!(
        hierarchy.children[1].acquire(),
        Err(PipeError::ResourceExhausted(_))
    ));

    // A handle released in one child is reachable from another only after
    // it moves up; until then the ceiling holds.
    hierarchy.children[0].release(held.pop().unwrap());
    hierarchy.check(held.len());
    assert_eq!(hierarchy.allocator.live(), 5);
}

#[test]
fn test_destroyed_surplus_frees_room_at_root() {
    let hierarchy = Hierarchy::new(4, 4, 2, 2);
    let held: Vec<_> = (0..4).map(|_| hierarchy.children[0].acquire().unwrap()).collect();
    assert!(hierarchy.children[1].acquire().is_err());

    // Child 1 never created anything, so destroying handles leaves it
    // negative until the surplus is forwarded.
    for stack in held {
        hierarchy.children[1].discard(stack);
    }
    assert_eq!(hierarchy.allocator.live(), 0);
    hierarchy.children[1].destroy();
    hierarchy.check(0);

    let again: Vec<_> = (0..4).map(|_| hierarchy.children[0].acquire().unwrap()).collect();
    assert_eq!(again.len(), 4);
}

#[test]
fn test_concurrent_children_respect_ceiling() {
    let hierarchy = Arc::new(Hierarchy::new(16, 8, 4, 4));
    let threads: Vec<_> = (0..4)
        .map(|c| {
            let hierarchy = Arc::clone(&hierarchy);
            std::thread::spawn(move || {
                let child = &hierarchy.children[c];
                for round in 0..2000 {
                    let mut held = Vec::new();
                    for _ in 0..(round % 5) {
                        if let Ok(stack) = child.acquire() {
                            held.push(stack);
                        }
                    }
                    for stack in held {
                        child.release(stack);
                    }
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    hierarchy.check(0);
    assert!(hierarchy.root.stats().high_water <= 16);
}
