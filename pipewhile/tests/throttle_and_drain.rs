//! Throttling, draining, backpressure and error propagation.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pipewhile::{
    ErrorPolicy, Iteration, PipeError, PipeWhile, PoolOptions, Runtime, RuntimeOptions,
};

use common::{Gauge, count_to, runtime};

#[test]
fn test_outstanding_iterations_bounded_by_throttle() {
    let rt = runtime(4);
    for throttle in [1usize, 2, 5, 12] {
        let gauge = Gauge::new();
        let body_gauge = Arc::clone(&gauge);

        let metrics = PipeWhile::new(count_to(60))
            .throttle(throttle)
            .run(rt.handle(), move |it: &mut Iteration| {
                body_gauge.enter();
                it.stage(1)?;
                std::thread::sleep(Duration::from_millis(1));
                it.stage_wait(2)?;
                body_gauge.exit();
                Ok(())
            })
            .unwrap();

        assert!(
            gauge.peak() <= throttle as u64,
            "peak {} over throttle {throttle}",
            gauge.peak()
        );
        assert_eq!(gauge.live(), 0);
        assert!(metrics.max_outstanding <= throttle as u64);
        assert_eq!(metrics.iterations, 60);
        assert_eq!(metrics.iterations_completed, 60);
    }
}

#[test]
fn test_throttle_one_runs_iterations_one_at_a_time() {
    let rt = runtime(4);
    let gauge = Gauge::new();
    let body_gauge = Arc::clone(&gauge);

    let metrics = PipeWhile::new(count_to(20))
        .throttle(1)
        .run(rt.handle(), move |it: &mut Iteration| {
            it.stage(1)?;
            body_gauge.enter();
            std::thread::sleep(Duration::from_millis(1));
            body_gauge.exit();
            Ok(())
        })
        .unwrap();

    assert_eq!(gauge.peak(), 1);
    assert!(metrics.throttle_waits > 0);
}

#[test]
fn test_end_waits_for_every_iteration() {
    let rt = runtime(3);
    let finished = Arc::new(AtomicU64::new(0));
    let body_finished = Arc::clone(&finished);

    let handle = rt
        .begin_pipe_while(Some(4), count_to(25), move |it: &mut Iteration| {
            it.stage(1)?;
            std::thread::sleep(Duration::from_millis(2));
            body_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let metrics = handle.end().unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 25);
    assert_eq!(metrics.iterations_completed, 25);
}

#[test]
fn test_ring_records_are_reused() {
    let rt = runtime(2);
    // Slow serial stage: each iteration is long finished by the time its
    // slot comes round again.
    let metrics = PipeWhile::new(count_to(40))
        .throttle(4)
        .run(rt.handle(), |it: &mut Iteration| {
            std::thread::sleep(Duration::from_millis(1));
            it.stage_wait(1)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(metrics.ring_allocations + metrics.ring_reuses, 40);
    assert!(metrics.ring_reuses > 0);
}

#[test]
fn test_zero_throttle_rejected() {
    let rt = runtime(1);
    let err = PipeWhile::new(count_to(1))
        .throttle(0)
        .run(rt.handle(), |_: &mut Iteration| Ok(()))
        .unwrap_err();
    assert!(matches!(err, PipeError::InvalidUsage(_)));
}

#[test]
fn test_body_error_stops_new_iterations() {
    let rt = runtime(2);
    let started = Arc::new(AtomicU64::new(0));
    let body_started = Arc::clone(&started);

    let err = PipeWhile::new(|| true)
        .throttle(4)
        .run(rt.handle(), move |it: &mut Iteration| {
            body_started.fetch_add(1, Ordering::SeqCst);
            if it.number() == 10 {
                return Err(PipeError::Internal("iteration 10 failed".into()));
            }
            it.stage_wait(1)?;
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err, PipeError::Internal("iteration 10 failed".into()));
    // Iteration 10 never detached, so nothing after it was started.
    assert_eq!(started.load(Ordering::SeqCst), 11);
}

#[test]
fn test_body_panic_surfaces_as_error() {
    let rt = runtime(2);
    let err = rt
        .pipe_while(count_to(8), |it: &mut Iteration| {
            it.stage(1)?;
            if it.number() == 3 {
                panic!("bad record");
            }
            Ok(())
        })
        .unwrap_err();

    match err {
        PipeError::Panicked(message) => assert!(message.contains("bad record")),
        other => panic!("unexpected error: {other:?}"),
    }

    // The runtime is still usable afterwards.
    let metrics = rt.pipe_while(count_to(5), |_: &mut Iteration| Ok(())).unwrap();
    assert_eq!(metrics.iterations, 5);
}

#[test]
fn test_misuse_counts_under_continue_policy() {
    let rt = Runtime::new(
        RuntimeOptions::default()
            .with_workers(2)
            .with_error_policy(ErrorPolicy::Continue),
    )
    .unwrap();

    let metrics = rt
        .pipe_while(count_to(6), |it: &mut Iteration| {
            it.stage(2)?;
            // Rejected, but tolerated by the body.
            assert!(it.stage_wait(1).is_err());
            assert!(it.stage(pipewhile::DONE_STAGE).is_err());
            it.stage_wait(3)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(metrics.iterations, 6);
    assert_eq!(rt.errors_reported(), 12);
    assert!(!rt.handle().errors_exceeded());
}

#[test]
fn test_misuse_stops_loop_under_default_policy() {
    let rt = runtime(2);
    let err = rt
        .pipe_while(|| true, |it: &mut Iteration| {
            it.stage(1)?;
            if it.number() == 2 {
                // Ignored by the body; the policy still stops the loop.
                let _ = it.stage(0);
            }
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, PipeError::InvalidUsage(_)));
    assert!(rt.handle().errors_exceeded());
}

#[test]
fn test_ceiling_turns_into_backpressure() {
    let root = PoolOptions {
        capacity: 4,
        allocation_ceiling: Some(4),
        ..PoolOptions::root()
    };
    let worker = PoolOptions {
        capacity: 4,
        ..PoolOptions::worker()
    };
    let rt = Runtime::new(
        RuntimeOptions::default()
            .with_workers(1)
            .with_root_pool(root)
            .with_worker_pool(worker),
    )
    .unwrap();

    let gauge = Gauge::new();
    let body_gauge = Arc::clone(&gauge);
    let metrics = PipeWhile::new(count_to(40))
        .throttle(16)
        .run(rt.handle(), move |it: &mut Iteration| {
            it.stage(1)?;
            body_gauge.enter();
            std::thread::sleep(Duration::from_millis(1));
            body_gauge.exit();
            Ok(())
        })
        .unwrap();

    assert_eq!(metrics.iterations_completed, 40);
    assert!(metrics.backpressure_waits > 0);
    // One fiber belongs to the controller.
    assert!(gauge.peak() <= 3);
    assert!(rt.metrics().live_fibers() <= 4);
}

fn bounded_runtime(workers: usize, ceiling: usize) -> Runtime {
    let root = PoolOptions {
        capacity: ceiling,
        allocation_ceiling: Some(ceiling),
        ..PoolOptions::root()
    };
    let worker = PoolOptions {
        capacity: ceiling,
        ..PoolOptions::worker()
    };
    Runtime::new(
        RuntimeOptions::default()
            .with_workers(workers)
            .with_root_pool(root)
            .with_worker_pool(worker),
    )
    .unwrap()
}

#[test]
fn test_ceiling_with_many_workers_completes() {
    // Finished iterations leave idle fibers in whichever worker ran them;
    // the controller must still get at them once the root is at its ceiling.
    let rt = bounded_runtime(4, 8);
    let metrics = PipeWhile::new(count_to(200))
        .throttle(4)
        .run(rt.handle(), |it: &mut Iteration| {
            it.stage(1)?;
            std::thread::sleep(Duration::from_millis(1));
            it.stage_wait(2)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(metrics.iterations_completed, 200);
    assert!(rt.metrics().live_fibers() <= 8);
    assert!(rt.root_pool_stats().high_water <= 8);
}

#[test]
fn test_ceiling_below_throttle_with_many_workers() {
    let rt = bounded_runtime(4, 8);
    let gauge = Gauge::new();
    let body_gauge = Arc::clone(&gauge);
    let metrics = PipeWhile::new(count_to(200))
        .throttle(32)
        .run(rt.handle(), move |it: &mut Iteration| {
            it.stage(1)?;
            body_gauge.enter();
            std::thread::sleep(Duration::from_millis(1));
            body_gauge.exit();
            it.stage_wait(2)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(metrics.iterations_completed, 200);
    assert!(metrics.backpressure_waits > 0);
    // One of the eight fibers runs the controller.
    assert!(gauge.peak() <= 7);
    assert!(rt.metrics().live_fibers() <= 8);
    assert!(rt.root_pool_stats().high_water <= 8);
}
