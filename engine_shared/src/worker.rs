//! Fixed worker pool.
//!
//! Each worker is a named OS thread looping on [`TaskQueue::get_task`]. A hit
//! runs the task and drops it (resolving its dependents); a miss yields and
//! sleeps for the idle backoff. Stopping is cooperative: the per-worker stop
//! flag is checked once per iteration, so a long task delays its worker's exit.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::task::TaskQueue;

/// Per-worker shared state.
#[derive(Debug)]
pub struct WorkerContext {
    index: usize,
    should_stop: AtomicBool,
    executed: AtomicU64,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

struct Worker {
    ctx: Arc<WorkerContext>,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    retired: AtomicU64,
}

impl WorkerPool {
    /// Spawns `count` workers pulling from `queue`.
    pub fn spawn(
        queue: Arc<TaskQueue>,
        count: usize,
        idle_backoff: Duration,
    ) -> anyhow::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let ctx = Arc::new(WorkerContext {
                index,
                should_stop: AtomicBool::new(false),
                executed: AtomicU64::new(0),
            });
            let thread_ctx = Arc::clone(&ctx);
            let thread_queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(&thread_ctx, &thread_queue, idle_backoff))
                .with_context(|| format!("spawn worker {index}"))?;
            workers.push(Worker { ctx, handle });
        }
        info!(workers = count, backoff_us = idle_backoff.as_micros() as u64, "Worker pool started");
        Ok(Self {
            workers: Mutex::new(workers),
            retired: AtomicU64::new(0),
        })
    }

    /// Workers not yet reaped.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks executed across all workers, including reaped ones.
    pub fn executed(&self) -> u64 {
        let live: u64 = self.workers.lock().iter().map(|w| w.ctx.executed()).sum();
        live + self.retired.load(Ordering::Relaxed)
    }

    pub fn stop_all(&self) {
        for worker in self.workers.lock().iter() {
            worker.ctx.stop();
        }
    }

    /// Joins and removes workers whose threads have exited.
    pub fn reap(&self) -> usize {
        let finished: Vec<Worker> = {
            let mut workers = self.workers.lock();
            let (done, running): (Vec<_>, Vec<_>) =
                workers.drain(..).partition(|w| w.handle.is_finished());
            *workers = running;
            done
        };

        for worker in &finished {
            self.retired.fetch_add(worker.ctx.executed(), Ordering::Relaxed);
        }
        let reaped = finished.len();
        for worker in finished {
            let index = worker.ctx.index();
            if worker.handle.join().is_err() {
                error!(worker = index, "Worker thread panicked");
            }
        }
        reaped
    }

    /// Stops every worker and reaps them, waiting at most `grace`.
    ///
    /// Returns `false` if some workers were still busy when the grace period
    /// ran out; those threads are left detached.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.stop_all();
        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.is_empty() {
                info!(executed = self.executed(), "Worker pool stopped");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(remaining = self.len(), "Workers still busy after shutdown grace period");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn worker_loop(ctx: &WorkerContext, queue: &TaskQueue, idle_backoff: Duration) {
    debug!(worker = ctx.index(), "Worker started");
    while !ctx.should_stop() {
        let Some(mut task) = queue.get_task() else {
            thread::yield_now();
            thread::sleep(idle_backoff);
            continue;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!(worker = ctx.index(), task = task.name(), "Task panicked");
        }
        ctx.executed.fetch_add(1, Ordering::Relaxed);

        let timer = task.timer();
        trace!(
            worker = ctx.index(),
            task = task.name(),
            wait_us = timer.wait_duration().map(|d| d.as_micros() as u64),
            exec_us = timer.execution_duration().map(|d| d.as_micros() as u64),
            "Task finished"
        );
        drop(task);
    }
    debug!(worker = ctx.index(), "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;

    fn wait_for(timeout: Duration, f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        f()
    }

    #[test]
    fn pool_drains_bounded_task_set() {
        let queue = Arc::new(TaskQueue::new());
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..200 {
            let done = Arc::clone(&done);
            queue.add_task(Task::new(format!("t{i}"), move || {
                done.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let pool = WorkerPool::spawn(Arc::clone(&queue), 4, Duration::from_micros(50)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::Relaxed) == 200));
        assert!(pool.shutdown(Duration::from_secs(2)));
        assert_eq!(pool.executed(), 200);
    }

    #[test]
    fn dependency_chain_runs_in_order() {
        let queue = Arc::new(TaskQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks: Vec<Task> = (0..10)
            .map(|i| {
                let order = Arc::clone(&order);
                Task::new(format!("step{i}"), move || order.lock().push(i))
            })
            .collect();
        for i in 1..tasks.len() {
            let (before, after) = tasks.split_at_mut(i);
            after[0].depend_on(&mut before[i - 1]);
        }
        // Reverse so readiness, not queue position, decides the order.
        for task in tasks.into_iter().rev() {
            queue.add_task(task);
        }

        let pool = WorkerPool::spawn(Arc::clone(&queue), 3, Duration::from_micros(50)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || order.lock().len() == 10));
        pool.shutdown(Duration::from_secs(2));
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_still_releases_dependents() {
        let queue = Arc::new(TaskQueue::new());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let mut bad = Task::new("bad", || panic!("task failure"));
        let mut after = Task::new("after", move || flag.store(true, Ordering::Release));
        after.depend_on(&mut bad);
        queue.add_task(after);
        queue.add_task(bad);

        let pool = WorkerPool::spawn(Arc::clone(&queue), 2, Duration::from_micros(50)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::Acquire)));
        assert!(pool.shutdown(Duration::from_secs(2)));
    }
}
