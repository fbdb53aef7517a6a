//! Helpers shared by the integration tests: tracing setup, bounded waits and
//! self-shutting server/client harnesses on ephemeral ports.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use engine_client::ClientGameState;
use engine_server::ServerGameState;
use engine_shared::{config::EngineConfig, runtime::Runtime};

/// Longest any test waits for a condition.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Polls `f` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    f()
}

/// Fast rates, two workers, ephemeral port.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        port: 0,
        worker_threads: 2,
        tick_hz: 100,
        replicate_hz: 20,
        event_pump_us: 200,
        io_step_us: 200,
        shutdown_grace_ms: 1000,
        ..EngineConfig::default()
    }
}

pub struct TestServer {
    pub rt: Runtime,
    pub state: Arc<ServerGameState>,
}

impl TestServer {
    pub fn start(cfg: EngineConfig) -> anyhow::Result<Self> {
        let rt = Runtime::new(cfg)?;
        rt.start()?;
        let state = ServerGameState::new();
        if let Err(e) = rt.enter_state(state.clone()) {
            rt.shutdown();
            return Err(e);
        }
        Ok(Self { rt, state })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.state.local_addr().context("server not bound")?.port())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.rt.shutdown();
    }
}

pub struct TestClient {
    pub rt: Runtime,
    pub state: Arc<ClientGameState>,
}

impl TestClient {
    pub fn connect(port: u16) -> anyhow::Result<Self> {
        let cfg = EngineConfig {
            port,
            ..test_config()
        };
        let rt = Runtime::new(cfg)?;
        rt.start()?;
        let state = ClientGameState::new();
        if let Err(e) = rt.enter_state(state.clone()) {
            rt.shutdown();
            return Err(e);
        }
        Ok(Self { rt, state })
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.rt.shutdown();
    }
}
