//! Configuration system.
//!
//! Every field has a default, so a JSON file only needs the keys it changes.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_PORT;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Server host: listen address on the server, connect target on the client.
    pub host: String,
    /// TCP port; 0 binds an ephemeral port.
    pub port: u16,
    /// Worker threads; 0 means one per hardware thread.
    pub worker_threads: usize,
    /// Game-state tick rate.
    pub tick_hz: u32,
    /// Server transform replication rate.
    pub replicate_hz: u32,
    /// Worker sleep after finding no ready task.
    pub idle_backoff_us: u64,
    /// Most events dispatched per pump run.
    pub event_batch: usize,
    pub event_pump_us: u64,
    pub io_step_us: u64,
    pub shutdown_grace_ms: u64,
    /// Server only: build the spinning demo scene on start.
    pub demo_scene: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            worker_threads: 0,
            tick_hz: 50,
            replicate_hz: 10,
            idle_backoff_us: 100,
            event_batch: 64,
            event_pump_us: 1000,
            io_step_us: 1000,
            shutdown_grace_ms: 2000,
            demo_scene: true,
        }
    }
}

/// Fewest workers a pool runs with.
pub const MIN_WORKERS: usize = 2;

fn per_second(hz: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / u64::from(hz.max(1)))
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Resolved pool size.
    pub fn worker_count(&self) -> usize {
        let wanted = match self.worker_threads {
            0 => num_cpus::get(),
            n => n,
        };
        wanted.max(MIN_WORKERS)
    }

    pub fn tick_interval(&self) -> Duration {
        per_second(self.tick_hz)
    }

    pub fn replicate_interval(&self) -> Duration {
        per_second(self.replicate_hz)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    pub fn event_pump_interval(&self) -> Duration {
        Duration::from_micros(self.event_pump_us)
    }

    pub fn io_step_interval(&self) -> Duration {
        Duration::from_micros(self.io_step_us)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{ "port": 4000, "tick_hz": 20 }"#).unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.tick_hz, 20);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.event_batch, 64);
        assert!(cfg.demo_scene);
    }

    #[test]
    fn worker_count_has_a_floor() {
        let cfg = EngineConfig {
            worker_threads: 1,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.worker_count(), MIN_WORKERS);
        assert!(EngineConfig::default().worker_count() >= MIN_WORKERS);
    }

    #[test]
    fn intervals_follow_rates() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tick_interval(), Duration::from_millis(20));
        assert_eq!(cfg.replicate_interval(), Duration::from_millis(100));
        let zero = EngineConfig {
            tick_hz: 0,
            ..cfg
        };
        assert_eq!(zero.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        assert!(EngineConfig::from_json_str("{ not json").is_err());
        assert!(EngineConfig::from_json_str(r#"{ "extra": 1 }"#).is_ok());
    }
}
