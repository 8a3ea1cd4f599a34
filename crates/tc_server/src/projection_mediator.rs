use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tc_buffer::BoundedQueue;
use tc_daq::Projection;
use tc_types::PROJECTION_QUEUE_CAPACITY;

/// Samples raw projections at an operator-chosen stride for the live
/// preview.
///
/// Only frames whose `index % every == phase` pass the filter; accepted
/// frames land on a small queue that drops its oldest element when the
/// preview consumer falls behind.
pub struct ProjectionMediator {
    every: AtomicUsize,
    phase: AtomicUsize,
    projections: BoundedQueue<Projection>,
}

impl Default for ProjectionMediator {
    fn default() -> Self {
        Self::new(PROJECTION_QUEUE_CAPACITY)
    }
}

impl ProjectionMediator {
    pub fn new(capacity: usize) -> Self {
        Self {
            every: AtomicUsize::new(1),
            phase: AtomicUsize::new(0),
            projections: BoundedQueue::new(capacity),
        }
    }

    /// Sample every `every`-th frame, at phase `phase` within the stride.
    pub fn set_filter(&self, every: i64, phase: i64) {
        let every = if every > 0 { every as usize } else { 1 };
        let phase = if phase < 0 {
            0
        } else {
            (phase as usize).min(every - 1)
        };
        self.every.store(every, Ordering::Relaxed);
        self.phase.store(phase, Ordering::Relaxed);
    }

    /// Select which projection index within the stride is previewed.
    pub fn set_id(&self, id: usize) {
        let every = self.every.load(Ordering::Relaxed);
        self.phase.store(id.min(every.saturating_sub(1)), Ordering::Relaxed);
    }

    pub fn emplace(&self, projection: Projection) {
        let every = self.every.load(Ordering::Relaxed);
        let phase = self.phase.load(Ordering::Relaxed);
        if projection.index % every == phase {
            self.projections.push(projection);
        }
    }

    pub fn wait_pop(&self, timeout: Duration) -> Option<Projection> {
        self.projections.wait_pop(timeout)
    }

    pub fn reset(&self) {
        self.projections.reset();
    }
}
