//! Bounded thread-pool scheduler with a timer path for delayed work.

use crate::Error;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Prefix for executor metrics.
const METRICS_PREFIX: &str = "executor";

/// How long the timer waits before re-attempting to release a due task into
/// a full ready queue.
const RELEASE_RETRY: Duration = Duration::from_millis(10);

/// Priority assigned to scheduled work.
///
/// High-priority tasks are always dequeued before normal-priority ones;
/// within one priority, tasks run in submission order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
}

type Op = Box<dyn FnOnce() + Send + 'static>;

/// A delayed task waiting in the timer heap.
struct Alarm {
    due: Instant,
    seq: u64,
    op: Op,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest alarm surfaces
        // first, with submission order breaking ties.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

struct Ready {
    state: State,
    high: VecDeque<Op>,
    normal: VecDeque<Op>,
    queued: usize,
}

impl Ready {
    fn push(&mut self, op: Op, priority: Priority) {
        match priority {
            Priority::High => self.high.push_back(op),
            Priority::Normal => self.normal.push_back(op),
        }
        self.queued += 1;
    }

    fn pop(&mut self) -> Option<Op> {
        let op = self.high.pop_front().or_else(|| self.normal.pop_front())?;
        self.queued -= 1;
        Some(op)
    }

    fn clear(&mut self) -> usize {
        let dropped = self.queued;
        self.high.clear();
        self.normal.clear();
        self.queued = 0;
        dropped
    }
}

#[derive(Debug)]
struct Metrics {
    tasks_scheduled: Counter,
    tasks_delayed: Counter,
    tasks_completed: Counter,
    tasks_dropped: Counter,
    tasks_rejected: Counter,
    queue_depth: Gauge,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_scheduled: Counter::default(),
            tasks_delayed: Counter::default(),
            tasks_completed: Counter::default(),
            tasks_dropped: Counter::default(),
            tasks_rejected: Counter::default(),
            queue_depth: Gauge::default(),
        };
        registry.register(
            "tasks_scheduled",
            "Total number of tasks entered into the ready queue",
            metrics.tasks_scheduled.clone(),
        );
        registry.register(
            "tasks_delayed",
            "Total number of tasks entered into the timer heap",
            metrics.tasks_delayed.clone(),
        );
        registry.register(
            "tasks_completed",
            "Total number of tasks run to completion",
            metrics.tasks_completed.clone(),
        );
        registry.register(
            "tasks_dropped",
            "Total number of tasks dropped by cancellation or shutdown",
            metrics.tasks_dropped.clone(),
        );
        registry.register(
            "tasks_rejected",
            "Total number of tasks rejected by backpressure",
            metrics.tasks_rejected.clone(),
        );
        registry.register(
            "queue_depth",
            "Number of tasks currently waiting in the ready queue",
            metrics.queue_depth.clone(),
        );
        metrics
    }
}

/// Configuration for the [Executor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker threads servicing the ready queue.
    pub workers: usize,

    /// Maximum number of tasks that may wait in the ready queue. Submissions
    /// beyond this bound fail with [Error::QueueFull].
    pub queue_capacity: usize,

    /// Whether [Executor::stop] runs already-queued work to completion before
    /// joining the workers. Delayed tasks that are not yet due are always
    /// dropped on stop.
    pub drain_on_stop: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            drain_on_stop: true,
        }
    }
}

/// Handle returned by [Executor::schedule_at] that can cancel the delayed
/// task before the timer releases it to the pool.
pub struct DelayHandle {
    cancelled: Arc<AtomicBool>,
}

impl DelayHandle {
    /// Cancel the delayed task. Idempotent; a no-op once the task has been
    /// released to the pool.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Bounded thread pool plus a timer heap for delayed work.
///
/// Lifecycle: `Created → Running → Stopped` via [Executor::start] and
/// [Executor::stop]; all scheduling fails outside `Running`. Errors inside a
/// task are the task's own responsibility to report through its context,
/// never through the scheduling call.
pub struct Executor {
    cfg: Config,
    ready: Mutex<Ready>,
    work_available: Condvar,
    sleeping: Mutex<BinaryHeap<Alarm>>,
    timer_wakeup: Condvar,
    alarm_seq: AtomicU64,
    shutdown: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    metrics: Metrics,
}

impl Executor {
    /// Create an executor with a private metrics registry.
    pub fn new(cfg: Config) -> Arc<Self> {
        Self::init(cfg, &mut Registry::default())
    }

    /// Create an executor, registering its metrics under the given registry.
    pub fn init(cfg: Config, registry: &mut Registry) -> Arc<Self> {
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));
        Arc::new(Self {
            cfg,
            ready: Mutex::new(Ready {
                state: State::Created,
                high: VecDeque::new(),
                normal: VecDeque::new(),
                queued: 0,
            }),
            work_available: Condvar::new(),
            sleeping: Mutex::new(BinaryHeap::new()),
            timer_wakeup: Condvar::new(),
            alarm_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            metrics,
        })
    }

    /// Spawn the worker pool and the timer thread.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut ready = self.ready.lock().unwrap();
            match ready.state {
                State::Created => ready.state = State::Running,
                State::Running => return Err(Error::AlreadyStarted),
                State::Stopped => return Err(Error::NotRunning),
            }
        }
        let workers = self.cfg.workers.max(1);
        let mut handles = self.handles.lock().unwrap();
        for index in 0..workers {
            let executor = self.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("splitkey-worker-{index}"))
                    .spawn(move || executor.worker_loop())
                    .expect("failed to spawn worker"),
            );
        }
        let executor = self.clone();
        handles.push(
            thread::Builder::new()
                .name("splitkey-timer".into())
                .spawn(move || executor.timer_loop())
                .expect("failed to spawn timer"),
        );
        debug!(workers, "executor started");
        Ok(())
    }

    /// Enqueue a task for immediate execution.
    pub fn schedule<F>(&self, op: F, priority: Priority) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut ready = self.ready.lock().unwrap();
        if ready.state != State::Running {
            return Err(Error::NotRunning);
        }
        if ready.queued >= self.cfg.queue_capacity {
            drop(ready);
            self.metrics.tasks_rejected.inc();
            return Err(Error::QueueFull);
        }
        ready.push(Box::new(op), priority);
        self.metrics.tasks_scheduled.inc();
        self.metrics.queue_depth.set(ready.queued as i64);
        drop(ready);
        self.work_available.notify_one();
        Ok(())
    }

    /// Enqueue a task into the timer heap, to be released to the pool (at
    /// normal priority) once `due` has passed.
    pub fn schedule_at<F>(&self, op: F, due: Instant) -> Result<DelayHandle, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let ready = self.ready.lock().unwrap();
            if ready.state != State::Running {
                return Err(Error::NotRunning);
            }
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut sleeping = self.sleeping.lock().unwrap();
        sleeping.push(Alarm {
            due,
            seq: self.alarm_seq.fetch_add(1, Ordering::Relaxed),
            op: Box::new(op),
            cancelled: cancelled.clone(),
        });
        self.metrics.tasks_delayed.inc();
        drop(sleeping);
        self.timer_wakeup.notify_one();
        Ok(DelayHandle { cancelled })
    }

    /// Stop the executor and join all of its threads.
    ///
    /// Already-queued work is drained or dropped per [Config::drain_on_stop];
    /// delayed tasks that are not yet due are always dropped. Must not be
    /// called from a worker thread.
    pub fn stop(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut ready = self.ready.lock().unwrap();
            if ready.state != State::Running {
                return Err(Error::NotRunning);
            }
            ready.state = State::Stopped;
            if !self.cfg.drain_on_stop {
                let dropped = ready.clear();
                self.metrics.tasks_dropped.inc_by(dropped as u64);
                self.metrics.queue_depth.set(0);
            }
        }
        self.shutdown.store(true, Ordering::Release);
        self.work_available.notify_all();
        {
            let mut sleeping = self.sleeping.lock().unwrap();
            let dropped = sleeping.len() as u64;
            sleeping.clear();
            self.metrics.tasks_dropped.inc_by(dropped);
        }
        self.timer_wakeup.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("executor stopped");
        Ok(())
    }

    fn worker_loop(&self) {
        loop {
            let op = {
                let mut ready = self.ready.lock().unwrap();
                loop {
                    if let Some(op) = ready.pop() {
                        self.metrics.queue_depth.set(ready.queued as i64);
                        break Some(op);
                    }
                    match ready.state {
                        State::Running => ready = self.work_available.wait(ready).unwrap(),
                        _ => break None,
                    }
                }
            };
            let Some(op) = op else {
                return;
            };
            trace!("running task");
            op();
            self.metrics.tasks_completed.inc();
        }
    }

    fn timer_loop(&self) {
        let mut sleeping = self.sleeping.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            while sleeping.peek().is_some_and(|alarm| alarm.due <= now) {
                let alarm = sleeping.pop().unwrap();
                if alarm.cancelled.load(Ordering::Acquire) {
                    self.metrics.tasks_dropped.inc();
                    continue;
                }
                let mut ready = self.ready.lock().unwrap();
                if ready.state != State::Running {
                    self.metrics.tasks_dropped.inc();
                    continue;
                }
                if ready.queued >= self.cfg.queue_capacity {
                    // Backpressure: hold the task in the heap a little longer
                    // rather than bursting past the queue bound.
                    drop(ready);
                    warn!("ready queue full, delaying release of due task");
                    sleeping.push(Alarm {
                        due: now + RELEASE_RETRY,
                        seq: self.alarm_seq.fetch_add(1, Ordering::Relaxed),
                        op: alarm.op,
                        cancelled: alarm.cancelled,
                    });
                    continue;
                }
                ready.push(alarm.op, Priority::Normal);
                self.metrics.tasks_scheduled.inc();
                self.metrics.queue_depth.set(ready.queued as i64);
                drop(ready);
                self.work_available.notify_one();
            }
            let timeout = sleeping
                .peek()
                .map(|alarm| alarm.due.saturating_duration_since(now));
            sleeping = match timeout {
                Some(timeout) => self.timer_wakeup.wait_timeout(sleeping, timeout).unwrap().0,
                None => self.timer_wakeup.wait(sleeping).unwrap(),
            };
        }
    }
}
