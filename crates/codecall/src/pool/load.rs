//! Pool load tracking
//!
//! Lock-free counters read by metrics and load reporting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Fixed number of workers
    pub size: usize,
    /// Idle workers ready to be acquired
    pub available: usize,
    /// Workers currently checked out
    pub borrowed: usize,
    /// Callers waiting for a worker
    pub pending: usize,
    /// Workers created over the pool's lifetime (including the initial set)
    pub created_total: u64,
    /// Workers torn down over the pool's lifetime
    pub destroyed_total: u64,
}

/// Shared counters for one pool
#[derive(Debug)]
pub(crate) struct PoolLoad {
    capacity: usize,
    borrowed: AtomicUsize,
    pending: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl PoolLoad {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            borrowed: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            created: AtomicU64::new(capacity as u64),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Count a caller as waiting until the guard is dropped
    pub(crate) fn waiting(&self) -> WaitingGuard<'_> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        WaitingGuard { load: self }
    }

    pub(crate) fn checked_out(&self) {
        self.borrowed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn checked_in(&self) {
        // Saturate instead of wrapping if bookkeeping ever goes wrong
        let _ = self
            .borrowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub(crate) fn replaced(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retired(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Fraction of the pool checked out (0.0 - 1.0)
    pub(crate) fn load_ratio(&self) -> f64 {
        (self.borrowed() as f64 / self.capacity as f64).min(1.0)
    }

    pub(crate) fn snapshot(&self, available: usize) -> PoolMetrics {
        PoolMetrics {
            size: self.capacity,
            available,
            borrowed: self.borrowed(),
            pending: self.pending(),
            created_total: self.created.load(Ordering::Relaxed),
            destroyed_total: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct WaitingGuard<'a> {
    load: &'a PoolLoad,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.load.pending.fetch_sub(1, Ordering::SeqCst);
    }
}
