#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pipewhile::{Runtime, RuntimeOptions};

pub fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeOptions::default().with_workers(workers)).unwrap()
}

/// Condition that is true exactly `limit` times.
pub fn count_to(limit: u64) -> impl FnMut() -> bool + Send + 'static {
    let mut calls = 0;
    move || {
        calls += 1;
        calls <= limit
    }
}

/// Tracks the highest value a live counter reached.
#[derive(Default)]
pub struct Gauge {
    live: AtomicU64,
    peak: AtomicU64,
}

impl Gauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}
