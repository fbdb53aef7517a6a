//! Task scheduling.
//!
//! A [`Task`] is a named one-shot closure plus an atomic count of unfinished
//! dependencies. When a task is dropped (normally by the worker that ran it)
//! it decrements the counter of every task that depends on it; that drop is
//! the only way dependencies resolve. The [`TaskQueue`] hands out the first
//! task whose counter is zero.
//!
//! Recurring work (reactor stepping, event pumping, game ticks) is registered
//! as a periodic entry instead of re-queuing itself: each entry has an
//! interval, a cancellation handle and at most one instance in flight.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub type Job = Box<dyn FnOnce() + Send + 'static>;
pub type PeriodicJob = Arc<dyn Fn() + Send + Sync + 'static>;

/// Smallest interval a periodic entry runs at.
pub const MIN_PERIOD: Duration = Duration::from_micros(1);

/// Creation/start/end instants of one task.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimer {
    created: Instant,
    started: Option<Instant>,
    ended: Option<Instant>,
}

impl ExecutionTimer {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            started: None,
            ended: None,
        }
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Time spent queued before a worker picked the task up.
    pub fn wait_duration(&self) -> Option<Duration> {
        self.started.map(|s| s.duration_since(self.created))
    }

    pub fn execution_duration(&self) -> Option<Duration> {
        match (self.started, self.ended) {
            (Some(s), Some(e)) => Some(e.duration_since(s)),
            _ => None,
        }
    }
}

pub struct Task {
    name: String,
    job: Option<Job>,
    dependencies: Arc<AtomicUsize>,
    dependents: Vec<Arc<AtomicUsize>>,
    /// Cleared on drop; set for instances of periodic entries.
    in_flight: Option<Arc<AtomicBool>>,
    timer: ExecutionTimer,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.pending_dependencies())
            .field("dependents", &self.dependents.len())
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            job: Some(Box::new(job)),
            dependencies: Arc::new(AtomicUsize::new(0)),
            dependents: Vec::new(),
            in_flight: None,
            timer: ExecutionTimer::new(),
        }
    }

    /// Makes `self` wait until `other` has been dropped.
    ///
    /// Both tasks must still be unqueued.
    pub fn depend_on(&mut self, other: &mut Task) {
        self.dependencies.fetch_add(1, Ordering::AcqRel);
        other.dependents.push(Arc::clone(&self.dependencies));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_dependencies(&self) -> usize {
        self.dependencies.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.pending_dependencies() == 0
    }

    pub fn timer(&self) -> &ExecutionTimer {
        &self.timer
    }

    /// Runs the closure once. Later calls are no-ops.
    pub fn run(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        self.timer.started = Some(Instant::now());
        job();
        self.timer.ended = Some(Instant::now());
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        for dependent in self.dependents.drain(..) {
            dependent.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(flag) = self.in_flight.take() {
            flag.store(false, Ordering::Release);
        }
    }
}

/// Cancels a periodic entry.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    name: Arc<str>,
    cancelled: Arc<AtomicBool>,
}

impl PeriodicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops future runs. An instance already running finishes normally.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct PeriodicEntry {
    name: Arc<str>,
    interval: Duration,
    next_due: Instant,
    job: PeriodicJob,
    in_flight: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

/// Shared queue of one-shot tasks and periodic entries.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    periodic: Mutex<Vec<PeriodicEntry>>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tasks", &self.task_count())
            .field("periodic", &self.periodic_count())
            .finish()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }

    /// Registers `job` to run every `interval`, first run immediately.
    pub fn add_periodic(
        &self,
        name: impl Into<String>,
        interval: Duration,
        job: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicHandle {
        let name: Arc<str> = Arc::from(name.into());
        let cancelled = Arc::new(AtomicBool::new(false));
        self.periodic.lock().push(PeriodicEntry {
            name: Arc::clone(&name),
            interval: interval.max(MIN_PERIOD),
            next_due: Instant::now(),
            job: Arc::new(job),
            in_flight: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::clone(&cancelled),
        });
        PeriodicHandle { name, cancelled }
    }

    /// Returns a due periodic instance if there is one, otherwise the first
    /// one-shot task whose dependencies are resolved.
    pub fn get_task(&self) -> Option<Task> {
        if let Some(task) = self.next_periodic() {
            return Some(task);
        }

        let mut tasks = self.tasks.lock();
        let index = tasks.iter().position(Task::is_ready)?;
        tasks.remove(index)
    }

    fn next_periodic(&self) -> Option<Task> {
        let mut periodic = self.periodic.lock();
        periodic.retain(|e| !e.cancelled.load(Ordering::Acquire));

        let now = Instant::now();
        let entry = periodic
            .iter_mut()
            .find(|e| e.next_due <= now && !e.in_flight.load(Ordering::Acquire))?;

        entry.in_flight.store(true, Ordering::Release);
        entry.next_due = now + entry.interval;

        let job = Arc::clone(&entry.job);
        let mut task = Task::new(entry.name.to_string(), move || job());
        task.in_flight = Some(Arc::clone(&entry.in_flight));
        Some(task)
    }

    /// Number of queued one-shot tasks, ready or not.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Number of live periodic entries.
    pub fn periodic_count(&self) -> usize {
        self.periodic
            .lock()
            .iter()
            .filter(|e| !e.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Drops every queued task and periodic entry.
    ///
    /// Dropping cascades dependency decrements like a normal completion.
    pub fn clear(&self) {
        let tasks: Vec<Task> = self.tasks.lock().drain(..).collect();
        let periodic: Vec<PeriodicEntry> = self.periodic.lock().drain(..).collect();
        drop(tasks);
        drop(periodic);
    }
}
