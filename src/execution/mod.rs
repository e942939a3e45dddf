//! Parallel execution engine.
//!
//! - [`Parallelism`]: a worker pool (rayon) plus the observer/metrics hooks, carried by a
//!   pipeline's configuration and inherited by its children
//! - [`Parallelism::pmap`]: ordered, pipelined parallel map with bounded lookahead
//! - [`split`]: broadcast one upstream iterator to several independent consumers
//!
//! Element failures never abort a run. An error (or a panic) inside the mapped function turns the
//! element into a [`Value::Absent`] marker carrying the input and the error.

mod observer;

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::utils::Backoff;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::scope::TaskContext;
use crate::types::Value;

pub use observer::{
    ExecutionEvent, ExecutionMetrics, ExecutionMetricsSnapshot, ExecutionObserver, TracingObserver,
};

/// Worker count used by `pmap` when nothing is configured.
pub const DEFAULT_NUM_WORKER: usize = 2;

/// Boxed element iterator handed between stages.
pub type ValueIter = Box<dyn Iterator<Item = Value> + Send>;

/// Fallible per-element function run on workers.
pub type TaskFn = Arc<dyn Fn(Value) -> PipelineResult<Value> + Send + Sync>;

/// Executor backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Thread,
    /// Any other backend name. Selecting one clears the executor.
    Other(String),
}

impl From<&str> for Backend {
    fn from(v: &str) -> Self {
        match v {
            "thread" => Backend::Thread,
            other => Backend::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Thread => f.write_str("thread"),
            Backend::Other(name) => f.write_str(name),
        }
    }
}

/// A sized worker pool with observability hooks.
#[derive(Clone)]
pub struct Parallelism {
    num_worker: usize,
    backend: Backend,
    pool: Arc<ThreadPool>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    metrics: Arc<ExecutionMetrics>,
}

impl Parallelism {
    /// Build a thread-backed pool of `num_worker` threads.
    pub fn new(num_worker: usize) -> PipelineResult<Self> {
        if num_worker == 0 {
            return Err(PipelineError::Executor {
                message: "num_worker must be > 0".to_string(),
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_worker)
            .thread_name(|i| format!("pipeline-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::Executor {
                message: e.to_string(),
            })?;
        debug!(num_worker, "worker pool created");
        Ok(Self {
            num_worker,
            backend: Backend::Thread,
            pool: Arc::new(pool),
            observer: None,
            metrics: Arc::new(ExecutionMetrics::new()),
        })
    }

    /// Attach an observer for execution events.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn num_worker(&self) -> usize {
        self.num_worker
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Handle to the live metrics of this pool's runs.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn observer(&self) -> Option<&Arc<dyn ExecutionObserver>> {
        self.observer.as_ref()
    }

    /// A pool of a different size that keeps this one's observer.
    pub(crate) fn resized(&self, num_worker: usize) -> PipelineResult<Self> {
        let mut p = Self::new(num_worker)?;
        p.observer = self.observer.clone();
        Ok(p)
    }

    /// Run `f` over every element on the pool, yielding results in input order.
    ///
    /// A background producer pulls `input` and submits one task per element. At most
    /// `num_worker` results are queued ahead of the consumer; the producer blocks once the queue
    /// is full. Scope frames active on the calling thread are re-entered by every task.
    pub fn pmap(&self, input: ValueIter, f: TaskFn) -> PMap {
        let (slot_tx, slot_rx) = channel::bounded::<Slot>(self.num_worker);
        let ctx = Arc::new(TaskContext::capture());
        let start = Instant::now();

        self.metrics.begin_run();
        self.emit(&ExecutionEvent::RunStarted {
            num_worker: self.num_worker,
        });

        let pool = Arc::clone(&self.pool);
        let metrics = Arc::clone(&self.metrics);
        let observer = self.observer.clone();
        let spawned = thread::Builder::new()
            .name("pmap-producer".to_string())
            .spawn(move || {
                let mut seq = 0u64;
                for x in input {
                    let (tx, rx) = channel::bounded::<Value>(1);
                    if slot_tx.send(Slot::Task(rx)).is_err() {
                        trace!("pmap consumer dropped, stopping producer");
                        return;
                    }
                    metrics.on_task_submitted();
                    let task = Task {
                        seq,
                        ctx: Arc::clone(&ctx),
                        f: Arc::clone(&f),
                        metrics: Arc::clone(&metrics),
                        observer: observer.clone(),
                    };
                    pool.spawn(move || {
                        let _ = tx.send(task.run(x));
                    });
                    seq += 1;
                }
                let _ = slot_tx.send(Slot::End);
                trace!("pmap producer finished");
            });

        let failed = spawned.err().map(|e| e.to_string());
        if let Some(error) = &failed {
            warn!(%error, "failed to spawn pmap producer");
        }
        PMap {
            slots: slot_rx,
            spawn_error: failed,
            done: false,
            start,
            metrics: Arc::clone(&self.metrics),
            observer: self.observer.clone(),
        }
    }

    /// Run `f` inside the worker pool, so rayon parallel iterators in it use these workers.
    pub(crate) fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    fn emit(&self, event: &ExecutionEvent) {
        if let Some(obs) = &self.observer {
            obs.on_event(event);
        }
    }
}

impl fmt::Debug for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallelism")
            .field("num_worker", &self.num_worker)
            .field("backend", &self.backend)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

enum Slot {
    Task(Receiver<Value>),
    End,
}

struct Task {
    seq: u64,
    ctx: Arc<TaskContext>,
    f: TaskFn,
    metrics: Arc<ExecutionMetrics>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl Task {
    fn run(&self, x: Value) -> Value {
        let _frame = self.ctx.enter();
        self.metrics.on_task_start();
        self.emit(ExecutionEvent::TaskStarted { seq: self.seq });

        let input = x.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.f)(x)));
        let result = match outcome {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };

        match result {
            Ok(v) => {
                self.metrics.on_task_end(false);
                self.emit(ExecutionEvent::TaskFinished { seq: self.seq });
                v
            }
            Err(error) => {
                warn!(seq = self.seq, input = %input, %error, "element failed, continuing");
                self.metrics.on_task_end(true);
                self.emit(ExecutionEvent::TaskFailed {
                    seq: self.seq,
                    error: error.clone(),
                });
                Value::absent(input, error)
            }
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(obs) = &self.observer {
            obs.on_event(&event);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

/// Ordered output of [`Parallelism::pmap`].
pub struct PMap {
    slots: Receiver<Slot>,
    spawn_error: Option<String>,
    done: bool,
    start: Instant,
    metrics: Arc<ExecutionMetrics>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl PMap {
    fn finish(&mut self) {
        self.done = true;
        self.metrics.end_run();
        if let Some(obs) = &self.observer {
            obs.on_event(&ExecutionEvent::RunFinished {
                elapsed: self.start.elapsed(),
                metrics: self.metrics.snapshot(),
            });
        }
    }
}

impl Iterator for PMap {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.done {
            return None;
        }
        if let Some(error) = self.spawn_error.take() {
            self.finish();
            return Some(Value::absent(Value::Null, error));
        }
        match self.slots.recv() {
            Ok(Slot::Task(rx)) => Some(
                rx.recv()
                    .unwrap_or_else(|_| Value::absent(Value::Null, "worker dropped its task")),
            ),
            Ok(Slot::End) | Err(_) => {
                self.finish();
                None
            }
        }
    }
}

/// Broadcast `input` to `count` consumers, each seeing every element in order.
///
/// A background distributor pulls `input` once. Per-branch queues hold `count` elements when
/// `bounded`, otherwise they are unbounded. While every live queue is full the distributor stops
/// pulling upstream; when only some are, elements for the full branches are cached until they have
/// room. A branch that lags behind the others keeps its cache growing.
pub fn split(input: ValueIter, count: usize, bounded: bool) -> Vec<ValueIter> {
    let mut branches = Vec::with_capacity(count);
    let mut receivers = Vec::with_capacity(count);
    for _ in 0..count {
        let (tx, rx) = if bounded {
            channel::bounded(count)
        } else {
            channel::unbounded()
        };
        let alive = Arc::new(AtomicBool::new(true));
        branches.push(Branch {
            tx,
            cache: VecDeque::new(),
            alive: Arc::clone(&alive),
        });
        receivers.push(Box::new(BranchReceiver { rx, alive }) as ValueIter);
    }

    let spawned = thread::Builder::new()
        .name("split-distributor".to_string())
        .spawn(move || distribute(input, branches));
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn split distributor");
    }
    receivers
}

/// Idle wait once spinning has not freed any queue.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

fn pause(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(IDLE_SLEEP);
    } else {
        backoff.snooze();
    }
}

fn distribute(input: ValueIter, branches: Vec<Branch>) {
    let mut branches: Vec<Option<Branch>> = branches.into_iter().map(Some).collect();

    for x in input {
        if !wait_for_room(&mut branches) {
            trace!("all split branches dropped, stopping distributor");
            return;
        }
        for slot in branches.iter_mut() {
            let alive = match slot {
                Some(branch) => branch.offer(x.clone()),
                None => continue,
            };
            if !alive {
                *slot = None;
            }
        }
    }

    // Flush the caches; dropping a sender ends its branch.
    let backoff = Backoff::new();
    loop {
        for slot in branches.iter_mut() {
            let keep = match slot {
                Some(branch) => !branch.is_dropped() && branch.flush() && !branch.cache.is_empty(),
                None => false,
            };
            if !keep {
                *slot = None;
            }
        }
        if branches.iter().all(Option::is_none) {
            break;
        }
        pause(&backoff);
    }
    trace!("split distributor finished");
}

/// Block until some live branch has queue room. Returns `false` once every consumer is gone.
fn wait_for_room(branches: &mut [Option<Branch>]) -> bool {
    let backoff = Backoff::new();
    loop {
        for slot in branches.iter_mut() {
            if slot.as_ref().is_some_and(Branch::is_dropped) {
                *slot = None;
            }
        }
        let mut live = branches.iter().flatten().peekable();
        if live.peek().is_none() {
            return false;
        }
        if !live.all(|b| b.tx.is_full()) {
            return true;
        }
        pause(&backoff);
    }
}

/// Consumer side of a split branch; flags the distributor when dropped.
struct BranchReceiver {
    rx: Receiver<Value>,
    alive: Arc<AtomicBool>,
}

impl Iterator for BranchReceiver {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.rx.recv().ok()
    }
}

impl Drop for BranchReceiver {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

struct Branch {
    tx: Sender<Value>,
    cache: VecDeque<Value>,
    alive: Arc<AtomicBool>,
}

impl Branch {
    fn is_dropped(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }

    /// Queue `x` behind any cached elements. Returns `false` once the consumer is gone.
    fn offer(&mut self, x: Value) -> bool {
        if !self.flush() {
            return false;
        }
        if !self.cache.is_empty() {
            self.cache.push_back(x);
            return true;
        }
        match self.tx.try_send(x) {
            Ok(()) => true,
            Err(TrySendError::Full(x)) => {
                self.cache.push_back(x);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Move cached elements into the queue while it has room.
    fn flush(&mut self) -> bool {
        while let Some(x) = self.cache.pop_front() {
            match self.tx.try_send(x) {
                Ok(()) => {}
                Err(TrySendError::Full(x)) => {
                    self.cache.push_front(x);
                    return true;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{
        Backend, ExecutionEvent, ExecutionObserver, Parallelism, TaskFn, ValueIter, split,
    };
    use crate::error::PipelineError;
    use crate::scope;
    use crate::types::Value;

    fn ints(n: i64) -> ValueIter {
        Box::new((0..n).map(Value::Int64))
    }

    fn add_one() -> TaskFn {
        Arc::new(|v: Value| Ok(Value::Int64(v.as_i64().unwrap_or(0) + 1)))
    }

    #[test]
    fn pmap_preserves_order_under_jitter() {
        let p = Parallelism::new(4).unwrap();
        let f: TaskFn = Arc::new(|v: Value| {
            let x = v.as_i64().unwrap_or(0);
            std::thread::sleep(Duration::from_micros(((x * 7919) % 13) as u64 * 50));
            Ok(Value::Int64(x * 2))
        });
        let out: Vec<Value> = p.pmap(ints(200), f).collect();
        let expected: Vec<Value> = (0..200).map(|x| Value::Int64(x * 2)).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn pmap_runs_on_several_threads() {
        let p = Parallelism::new(4).unwrap();
        let names = Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new()));
        let seen = Arc::clone(&names);
        let f: TaskFn = Arc::new(move |v: Value| {
            seen.lock().insert(std::thread::current().name().map(str::to_string));
            std::thread::sleep(Duration::from_millis(2));
            Ok(v)
        });
        let out: Vec<Value> = p.pmap(ints(64), f).collect();
        assert_eq!(out.len(), 64);
        assert!(names.lock().len() > 1);
    }

    #[test]
    fn pmap_turns_errors_and_panics_into_absent() {
        let p = Parallelism::new(2).unwrap();
        let f: TaskFn = Arc::new(|v: Value| match v.as_i64() {
            Some(2) => Err(PipelineError::execution("two")),
            Some(4) => panic!("four"),
            _ => Ok(v),
        });
        let out: Vec<Value> = p.pmap(ints(6), f).collect();
        assert_eq!(out.len(), 6);
        assert_eq!(out[2].as_absent().unwrap().input, Value::Int64(2));
        assert!(out[2].as_absent().unwrap().error.contains("two"));
        assert!(out[4].as_absent().unwrap().error.contains("four"));
        assert_eq!(out[5], Value::Int64(5));
        assert_eq!(p.metrics().snapshot().tasks_failed, 2);
    }

    #[test]
    fn pmap_workers_see_callers_scope() {
        let p = Parallelism::new(2).unwrap();
        let _g = scope::enter_with([("pmap_test_key", 41)]).unwrap();
        let f: TaskFn = Arc::new(|_v: Value| Ok(scope::get_or("pmap_test_key", Value::Null)));
        let out: Vec<Value> = p.pmap(ints(3), f).collect();
        assert_eq!(out, vec![Value::Int64(41); 3]);
    }

    struct Counting {
        started: AtomicUsize,
        finished_runs: AtomicUsize,
    }

    impl ExecutionObserver for Counting {
        fn on_event(&self, event: &ExecutionEvent) {
            match event {
                ExecutionEvent::TaskStarted { .. } => {
                    self.started.fetch_add(1, Ordering::SeqCst);
                }
                ExecutionEvent::RunFinished { .. } => {
                    self.finished_runs.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn observer_sees_every_task() {
        let obs = Arc::new(Counting {
            started: AtomicUsize::new(0),
            finished_runs: AtomicUsize::new(0),
        });
        let as_trait: Arc<dyn ExecutionObserver> = obs.clone();
        let p = Parallelism::new(3).unwrap().with_observer(as_trait);
        let out: Vec<Value> = p.pmap(ints(30), add_one()).collect();
        assert_eq!(out.len(), 30);
        assert_eq!(obs.started.load(Ordering::SeqCst), 30);
        assert_eq!(obs.finished_runs.load(Ordering::SeqCst), 1);
        let snap = p.metrics().snapshot();
        assert_eq!(snap.tasks_submitted, 30);
        assert!(snap.elapsed.is_some());
    }

    #[test]
    fn zero_workers_is_an_error() {
        assert!(matches!(Parallelism::new(0), Err(PipelineError::Executor { .. })));
    }

    #[test]
    fn backend_names() {
        assert_eq!(Backend::from("thread"), Backend::Thread);
        assert_eq!(Backend::from("ray"), Backend::Other("ray".to_string()));
    }

    #[test]
    fn split_broadcasts_every_element() {
        let branches = split(ints(50), 3, true);
        let handles: Vec<_> = branches
            .into_iter()
            .map(|b| std::thread::spawn(move || b.collect::<Vec<_>>()))
            .collect();
        let expected: Vec<Value> = (0..50).map(Value::Int64).collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    }

    #[test]
    fn split_caches_for_slow_branch() {
        let mut branches = split(ints(20), 2, true);
        let slow = branches.pop().unwrap();
        let fast = branches.pop().unwrap();
        assert_eq!(fast.count(), 20);
        assert_eq!(slow.count(), 20);
    }

    #[test]
    fn split_stops_pulling_while_every_branch_is_full() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let input: ValueIter = Box::new((0..).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Value::Int64(i)
        }));
        let mut branches = split(input, 2, true);
        for b in branches.iter_mut() {
            assert_eq!(b.next(), Some(Value::Int64(0)));
        }
        std::thread::sleep(Duration::from_millis(200));
        // Two queues of two, one cached element per branch, and the element being held.
        let n = pulled.load(Ordering::SeqCst);
        assert!(n <= 6, "pulled {n} elements upstream");
    }

    #[test]
    fn split_distributor_exits_when_all_branches_drop() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let input: ValueIter = Box::new((0..).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Value::Int64(i)
        }));
        drop(split(input, 2, true));
        std::thread::sleep(Duration::from_millis(50));
        let settled = pulled.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pulled.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn dropped_branch_does_not_block_others() {
        let mut branches = split(ints(100), 2, true);
        drop(branches.pop());
        let only = branches.pop().unwrap();
        assert_eq!(only.count(), 100);
    }
}
