// Copyright 2025 the Sylvan Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Evaluation counters.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Work done by one evaluation that reached the backend.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Transition matrices recomputed.
    pub matrix_updates: usize,
    /// Partials combine operations submitted, retry included.
    pub partials_ops: usize,
    /// Mask applications submitted.
    pub masks: usize,
    /// Whether a forced-rescaling retry ran.
    pub retried: bool,
}

/// Receives evaluation events from an engine.
///
/// All methods default to doing nothing.
pub trait MetricsSink: Send {
    /// An evaluation ran to completion.
    fn evaluation(&mut self, stats: &EvaluationStats) {
        let _ = stats;
    }

    /// An evaluation returned the cached value.
    fn cache_hit(&mut self) {}

    /// A non-finite result triggered a rescue attempt.
    fn rescue(&mut self) {}
}

/// Discards every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[derive(Debug, Default)]
struct Counters {
    evaluations: AtomicU64,
    cache_hits: AtomicU64,
    matrix_updates: AtomicU64,
    partials_ops: AtomicU64,
    rescues: AtomicU64,
}

/// Shared atomic counters.
///
/// Clones share the same counters, so one handle can be given to an engine
/// and another kept for reading.
///
/// # Example
///
/// ```
/// use sylvan_pruning::{EvaluationStats, MetricsSink, OperationCounter};
///
/// let counter = OperationCounter::default();
/// let mut sink = counter.clone();
/// sink.evaluation(&EvaluationStats { matrix_updates: 3, partials_ops: 2, ..Default::default() });
/// sink.cache_hit();
/// assert_eq!(counter.evaluations(), 1);
/// assert_eq!(counter.matrix_updates(), 3);
/// assert_eq!(counter.cache_hits(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct OperationCounter {
    inner: Arc<Counters>,
}

impl OperationCounter {
    /// Evaluations that reached the backend.
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    /// Evaluations answered from the cache.
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.inner.cache_hits.load(Ordering::Relaxed)
    }

    /// Transition matrices recomputed.
    #[must_use]
    pub fn matrix_updates(&self) -> u64 {
        self.inner.matrix_updates.load(Ordering::Relaxed)
    }

    /// Partials combine operations submitted.
    #[must_use]
    pub fn partials_ops(&self) -> u64 {
        self.inner.partials_ops.load(Ordering::Relaxed)
    }

    /// Rescue attempts after underflow.
    #[must_use]
    pub fn rescues(&self) -> u64 {
        self.inner.rescues.load(Ordering::Relaxed)
    }
}

impl MetricsSink for OperationCounter {
    fn evaluation(&mut self, stats: &EvaluationStats) {
        self.inner.evaluations.fetch_add(1, Ordering::Relaxed);
        self.inner
            .matrix_updates
            .fetch_add(stats.matrix_updates as u64, Ordering::Relaxed);
        self.inner
            .partials_ops
            .fetch_add(stats.partials_ops as u64, Ordering::Relaxed);
    }

    fn cache_hit(&mut self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn rescue(&mut self) {
        self.inner.rescues.fetch_add(1, Ordering::Relaxed);
    }
}
