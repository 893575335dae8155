//! Worker pool — one concurrency lane per trigger type.
//!
//! Tick detection hands runs to the pool and returns immediately; a lane at
//! capacity queues the run until a permit frees up. Manual and retry runs
//! never starve the scheduled lane (and vice versa).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::logbook::TriggerType;

/// Execution lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Scheduled,
    Manual,
    Retry,
}

impl Lane {
    const ALL: [Lane; 3] = [Lane::Scheduled, Lane::Manual, Lane::Retry];

    fn index(&self) -> usize {
        match self {
            Lane::Scheduled => 0,
            Lane::Manual => 1,
            Lane::Retry => 2,
        }
    }
}

impl From<TriggerType> for Lane {
    fn from(trigger: TriggerType) -> Self {
        match trigger {
            TriggerType::Scheduled => Lane::Scheduled,
            TriggerType::Manual => Lane::Manual,
            TriggerType::Retry => Lane::Retry,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Scheduled => write!(f, "scheduled"),
            Lane::Manual => write!(f, "manual"),
            Lane::Retry => write!(f, "retry"),
        }
    }
}

/// Per-lane state.
struct LaneState {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    queued: AtomicUsize,
    active: AtomicUsize,
    total_processed: AtomicU64,
}

impl LaneState {
    fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
        }
    }
}

/// Counts a run as finished even if it panics.
struct ActiveGuard(Arc<LaneState>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.total_processed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool {
    lanes: [Arc<LaneState>; 3],
}

impl WorkerPool {
    /// Scheduled and manual lanes get `max_workers` each; retries get half.
    pub fn new(max_workers: usize) -> Self {
        Self::with_limits(max_workers, max_workers, max_workers / 2)
    }

    pub fn with_limits(scheduled: usize, manual: usize, retry: usize) -> Self {
        Self {
            lanes: [
                Arc::new(LaneState::new(scheduled)),
                Arc::new(LaneState::new(manual)),
                Arc::new(LaneState::new(retry)),
            ],
        }
    }

    /// Run `fut` on the lane. Never blocks the caller.
    pub fn spawn<F>(&self, lane: Lane, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let state = self.lanes[lane.index()].clone();
        state.queued.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "📥 Lane[{}] enqueue (queued: {}, active: {})",
            lane,
            state.queued.load(Ordering::SeqCst),
            state.active.load(Ordering::SeqCst)
        );
        tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = state.permits.clone().acquire_owned().await.ok();
            state.queued.fetch_sub(1, Ordering::SeqCst);
            state.active.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(state);
            fut.await
        })
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        Lane::ALL
            .iter()
            .map(|lane| {
                let state = &self.lanes[lane.index()];
                LaneStats {
                    lane: *lane,
                    queued: state.queued.load(Ordering::SeqCst),
                    active: state.active.load(Ordering::SeqCst),
                    max_concurrent: state.max_concurrent,
                    total_processed: state.total_processed.load(Ordering::SeqCst),
                }
            })
            .collect()
    }

    /// Queued plus running across all lanes.
    pub fn total_pending(&self) -> usize {
        self.lanes
            .iter()
            .map(|s| s.queued.load(Ordering::SeqCst) + s.active.load(Ordering::SeqCst))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub total_processed: u64,
}
