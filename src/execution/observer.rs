use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Events emitted while a parallel map runs.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted { num_worker: usize },
    TaskStarted { seq: u64 },
    TaskFinished { seq: u64 },
    TaskFailed { seq: u64, error: String },
    RunFinished {
        elapsed: Duration,
        metrics: ExecutionMetricsSnapshot,
    },
}

/// Observer hook for execution events.
///
/// Task events are emitted from worker threads.
pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Forwards execution events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted { num_worker } => debug!(num_worker, "parallel run started"),
            ExecutionEvent::TaskStarted { seq } => trace!(seq, "task started"),
            ExecutionEvent::TaskFinished { seq } => trace!(seq, "task finished"),
            ExecutionEvent::TaskFailed { seq, error } => warn!(seq, %error, "task failed"),
            ExecutionEvent::RunFinished { elapsed, metrics } => {
                debug!(?elapsed, %metrics, "parallel run finished")
            }
        }
    }
}

/// Real-time counters for parallel runs.
///
/// Workers update these while tasks run; callers can snapshot them at any time.
pub struct ExecutionMetrics {
    run_id: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    elapsed_ns: AtomicU64,

    tasks_submitted: AtomicU64,
    tasks_finished: AtomicU64,
    tasks_failed: AtomicU64,

    active_tasks: AtomicUsize,
    max_active_tasks: AtomicUsize,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            run_id: AtomicU64::new(0),
            started_at: Mutex::new(None),
            elapsed_ns: AtomicU64::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_finished: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            active_tasks: AtomicUsize::new(0),
            max_active_tasks: AtomicUsize::new(0),
        }
    }

    pub fn begin_run(&self) {
        let _ = self.run_id.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());

        self.elapsed_ns.store(0, Ordering::SeqCst);
        self.tasks_submitted.store(0, Ordering::SeqCst);
        self.tasks_finished.store(0, Ordering::SeqCst);
        self.tasks_failed.store(0, Ordering::SeqCst);
        self.active_tasks.store(0, Ordering::SeqCst);
        self.max_active_tasks.store(0, Ordering::SeqCst);
    }

    /// Record the end of the current run; returns its elapsed time.
    pub fn end_run(&self) -> Duration {
        let started = *self.started_at.lock();
        let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
        self.elapsed_ns
            .store(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
        elapsed
    }

    pub fn on_task_submitted(&self) {
        let _ = self.tasks_submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_task_start(&self) {
        let now = self.active_tasks.fetch_add(1, Ordering::SeqCst) + 1;
        update_max_usize(&self.max_active_tasks, now);
    }

    pub fn on_task_end(&self, failed: bool) {
        let _ = self.tasks_finished.fetch_add(1, Ordering::SeqCst);
        if failed {
            let _ = self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.active_tasks.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        let elapsed_ns = self.elapsed_ns.load(Ordering::SeqCst);
        let elapsed = if elapsed_ns > 0 {
            Some(Duration::from_nanos(elapsed_ns))
        } else {
            None
        };

        ExecutionMetricsSnapshot {
            run_id: self.run_id.load(Ordering::SeqCst),
            elapsed,
            tasks_submitted: self.tasks_submitted.load(Ordering::SeqCst),
            tasks_finished: self.tasks_finished.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            max_active_tasks: self.max_active_tasks.load(Ordering::SeqCst),
        }
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionMetrics").field(&self.snapshot()).finish()
    }
}

fn update_max_usize(dst: &AtomicUsize, now: usize) {
    loop {
        let cur = dst.load(Ordering::SeqCst);
        if now <= cur {
            break;
        }
        if dst
            .compare_exchange(cur, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}

/// Immutable snapshot of [`ExecutionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionMetricsSnapshot {
    pub run_id: u64,
    pub elapsed: Option<Duration>,
    pub tasks_submitted: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    pub max_active_tasks: usize,
}

impl fmt::Display for ExecutionMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, tasks={}/{}, failed={}, max_active_tasks={}, elapsed={:?}",
            self.run_id,
            self.tasks_finished,
            self.tasks_submitted,
            self.tasks_failed,
            self.max_active_tasks,
            self.elapsed
        )
    }
}
