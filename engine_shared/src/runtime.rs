//! Runtime context.
//!
//! One [`Runtime`] per process owns the task queue, event queue, dispatcher,
//! socket reactor and worker pool, and is passed to whatever needs them.
//! Starting it registers two periodic entries: the event pump, which drains
//! up to `event_batch` events per run (one instance at a time, so listeners
//! see events in dequeue order), and the reactor step.
//!
//! A [`GameState`] is the unit of game logic: created when entered, ticked at
//! `tick_hz` from the pool, destroyed when replaced or on shutdown.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    event::{Event, EventDispatcher, EventQueue},
    reactor::IoReactor,
    task::{PeriodicHandle, Task, TaskQueue},
    worker::WorkerPool,
};

pub trait GameState: Send + Sync {
    fn name(&self) -> &str;

    /// Registers listeners and periodic work. An error aborts entering the
    /// state.
    fn create(&self, rt: &Runtime) -> anyhow::Result<()>;

    fn destroy(&self, rt: &Runtime);

    fn tick(&self, rt: &Runtime, dt: Duration);
}

struct ActiveState {
    state: Arc<dyn GameState>,
    tick: PeriodicHandle,
}

struct Inner {
    config: EngineConfig,
    tasks: Arc<TaskQueue>,
    events: Arc<EventQueue>,
    dispatcher: EventDispatcher,
    reactor: IoReactor,
    pool: Mutex<Option<WorkerPool>>,
    periodic: Mutex<Vec<PeriodicHandle>>,
    state: Mutex<Option<ActiveState>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().take() {
            pool.stop_all();
        }
    }
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("tasks", &self.inner.tasks)
            .field("events", &self.inner.events.event_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let reactor = IoReactor::new()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tasks: Arc::new(TaskQueue::new()),
                events: Arc::new(EventQueue::new()),
                dispatcher: EventDispatcher::new(),
                reactor,
                pool: Mutex::new(None),
                periodic: Mutex::new(Vec::new()),
                state: Mutex::new(None),
            }),
        })
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Registers the pump and reactor entries and spawns the workers.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut pool = self.inner.pool.lock();
        if pool.is_some() {
            bail!("runtime already started");
        }
        let cfg = &self.inner.config;

        let weak = self.downgrade();
        let batch = cfg.event_batch.max(1);
        self.add_periodic("EventPump", cfg.event_pump_interval(), move || {
            if let Some(rt) = Runtime::upgrade(&weak) {
                rt.pump_events(batch);
            }
        });

        let weak = self.downgrade();
        self.add_periodic("IoStep", cfg.io_step_interval(), move || {
            if let Some(rt) = Runtime::upgrade(&weak) {
                rt.inner.reactor.step();
            }
        });

        let workers = cfg.worker_count();
        *pool = Some(
            WorkerPool::spawn(Arc::clone(&self.inner.tasks), workers, cfg.idle_backoff())
                .context("start worker pool")?,
        );
        info!(workers, tick_hz = cfg.tick_hz, "Runtime started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.pool.lock().is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.inner.tasks
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.inner.events
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn reactor(&self) -> &IoReactor {
        &self.inner.reactor
    }

    pub fn publish(&self, event: Event) {
        self.inner.events.add_event(event);
    }

    pub fn add_task(&self, task: Task) {
        self.inner.tasks.add_task(task);
    }

    /// Adds a periodic entry that is cancelled on shutdown.
    pub fn add_periodic(
        &self,
        name: impl Into<String>,
        interval: Duration,
        job: impl Fn() + Send + Sync + 'static,
    ) -> PeriodicHandle {
        let handle = self.inner.tasks.add_periodic(name, interval, job);
        let mut periodic = self.inner.periodic.lock();
        periodic.retain(|h| !h.is_cancelled());
        periodic.push(handle.clone());
        handle
    }

    /// Dispatches up to `max` queued events, returning how many ran.
    pub fn pump_events(&self, max: usize) -> usize {
        let mut handled = 0;
        while handled < max {
            let Some(event) = self.inner.events.get_event() else {
                break;
            };
            handled += 1;
            if let Err(e) = self.inner.dispatcher.handle_event(&event) {
                warn!(
                    event = %event.sub_type(),
                    error = %format!("{e:#}"),
                    "Event handling failed"
                );
            }
        }
        handled
    }

    /// Destroys the current state (if any), creates `state` and schedules its
    /// tick.
    pub fn enter_state(&self, state: Arc<dyn GameState>) -> anyhow::Result<()> {
        self.leave_state();
        state
            .create(self)
            .with_context(|| format!("create state {}", state.name()))?;

        let weak = self.downgrade();
        let ticked = Arc::clone(&state);
        let last = Mutex::new(Instant::now());
        let tick = self.add_periodic(
            format!("{}Tick", state.name()),
            self.inner.config.tick_interval(),
            move || {
                let Some(rt) = Runtime::upgrade(&weak) else {
                    return;
                };
                let now = Instant::now();
                let dt = now.duration_since(std::mem::replace(&mut *last.lock(), now));
                ticked.tick(&rt, dt);
            },
        );

        info!(state = state.name(), "Entered state");
        *self.inner.state.lock() = Some(ActiveState { state, tick });
        Ok(())
    }

    /// Cancels the current state's tick and destroys it.
    pub fn leave_state(&self) {
        let Some(active) = self.inner.state.lock().take() else {
            return;
        };
        active.tick.cancel();
        active.state.destroy(self);
        info!(state = active.state.name(), "Left state");
    }

    /// Orderly stop: state destroyed, periodic entries cancelled, workers
    /// reaped within the grace period, queues and listeners cleared.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.leave_state();

        for handle in self.inner.periodic.lock().drain(..) {
            handle.cancel();
        }

        let pool = self.inner.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown(self.inner.config.shutdown_grace());
        }

        self.inner.tasks.clear();
        let dropped = self.inner.events.clear();
        if dropped > 0 {
            debug!(dropped, "Discarded undispatched events");
        }
        self.inner.dispatcher.clear_all();
        info!("Runtime stopped");
    }
}
