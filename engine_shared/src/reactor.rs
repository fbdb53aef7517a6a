//! Socket reactor driven from the task pool.
//!
//! The reactor is a single-threaded tokio runtime with no thread of its own.
//! A recurring task calls [`IoReactor::step`], which polls the I/O driver
//! once without blocking and runs whatever socket tasks became ready. Only one
//! worker drives the runtime at a time; a concurrent `step` is a no-op.

use std::future::Future;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::runtime::{self, EnterGuard, Handle, Runtime};
use tokio::task::JoinHandle;

pub struct IoReactor {
    runtime: Runtime,
    driving: Mutex<()>,
}

impl IoReactor {
    pub fn new() -> anyhow::Result<Self> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build io reactor")?;
        Ok(Self {
            runtime,
            driving: Mutex::new(()),
        })
    }

    /// Advances the reactor by one non-blocking step.
    ///
    /// Returns `false` when another thread is already driving it.
    pub fn step(&self) -> bool {
        let Some(_guard) = self.driving.try_lock() else {
            return false;
        };
        self.runtime.block_on(tokio::task::yield_now());
        true
    }

    /// Spawns a socket task; it makes progress only while the reactor is
    /// stepped.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Drives `future` to completion on the calling thread.
    ///
    /// Must not be called from inside a reactor task.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _guard = self.driving.lock();
        self.runtime.block_on(future)
    }

    /// Makes the reactor current so std sockets can be registered with it.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.runtime.enter()
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }
}
