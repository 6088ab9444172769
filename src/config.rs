//! Bridge configuration: launcher plus pool settings, with environment
//! overrides.
//!
//! # Environment Variables
//!
//! - `SCANBRIDGE_WORKER_PATH` - Exact worker executable
//! - `SCANBRIDGE_RUNNER` - Program that runs the worker (e.g. an emulator)
//! - `SCANBRIDGE_RUNTIME_DIR` - Directory for channel sockets
//! - `SCANBRIDGE_HANDSHAKE_TIMEOUT_MS` - Startup handshake timeout
//! - `SCANBRIDGE_MAX_WORKERS` - Upper bound on live workers
//! - `SCANBRIDGE_WARM_SPARES` - Idle workers kept launched ahead of demand
//! - `SCANBRIDGE_IDLE_TIMEOUT_MS` - Idle time before a worker is swept
//! - `SCANBRIDGE_SWEEP_INTERVAL_MS` - How often idle workers are checked
//!   (default: the idle timeout when only that is set, capped at 60s)

use crate::error::Result;
use crate::paths::RUNTIME_DIR_ENV;
use crate::worker::{LauncherConfig, PoolConfig, WorkerPool};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Everything needed to build a [`WorkerPool`] over real processes.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub launcher: LauncherConfig,
    pub pool: PoolConfig,
}

impl BridgeConfig {
    /// Apply environment variable overrides.
    pub fn with_env_overrides(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Values that do not
    /// parse are logged and ignored.
    pub fn with_env_lookup(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = get("SCANBRIDGE_WORKER_PATH") {
            self.launcher.worker_path = Some(PathBuf::from(path));
        }
        if let Some(runner) = get("SCANBRIDGE_RUNNER") {
            self.launcher.runner = Some(PathBuf::from(runner));
        }
        if let Some(dir) = get(RUNTIME_DIR_ENV) {
            self.launcher.runtime_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parsed::<u64>(&get, "SCANBRIDGE_HANDSHAKE_TIMEOUT_MS") {
            self.launcher.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parsed(&get, "SCANBRIDGE_MAX_WORKERS") {
            self.pool.max_workers = n;
        }
        if let Some(n) = parsed(&get, "SCANBRIDGE_WARM_SPARES") {
            self.pool.warm_spares = n;
        }
        let idle_timeout = parsed::<u64>(&get, "SCANBRIDGE_IDLE_TIMEOUT_MS");
        if let Some(ms) = idle_timeout {
            self.pool.idle_timeout = Duration::from_millis(ms);
        }
        match parsed::<u64>(&get, "SCANBRIDGE_SWEEP_INTERVAL_MS") {
            Some(ms) => self.pool.sweep_interval = Duration::from_millis(ms.max(1)),
            // A short idle timeout is pointless if the sweep only runs every minute
            None if idle_timeout.is_some() => {
                self.pool.sweep_interval = self
                    .pool
                    .sweep_interval
                    .min(self.pool.idle_timeout)
                    .max(Duration::from_millis(1));
            }
            None => {}
        }
        self
    }

    /// Start a pool with this configuration.
    pub fn build_pool(self) -> Result<WorkerPool> {
        WorkerPool::launching(self.launcher, self.pool)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = BridgeConfig::default().with_env_lookup(lookup(&[]));
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.warm_spares, 0);
        assert!(config.launcher.worker_path.is_none());
        assert!(config.launcher.runner.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::default().with_env_lookup(lookup(&[
            ("SCANBRIDGE_WORKER_PATH", "/opt/scanbridge/scanbridge-worker"),
            ("SCANBRIDGE_RUNNER", "/usr/bin/box86"),
            ("SCANBRIDGE_RUNTIME_DIR", "/tmp/sb-run"),
            ("SCANBRIDGE_HANDSHAKE_TIMEOUT_MS", "1500"),
            ("SCANBRIDGE_MAX_WORKERS", "2"),
            ("SCANBRIDGE_WARM_SPARES", "1"),
            ("SCANBRIDGE_IDLE_TIMEOUT_MS", "250"),
        ]));

        assert_eq!(
            config.launcher.worker_path,
            Some(PathBuf::from("/opt/scanbridge/scanbridge-worker"))
        );
        assert_eq!(config.launcher.runner, Some(PathBuf::from("/usr/bin/box86")));
        assert_eq!(config.launcher.runtime_dir, PathBuf::from("/tmp/sb-run"));
        assert_eq!(config.launcher.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.pool.warm_spares, 1);
        assert_eq!(config.pool.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_sweep_interval() {
        let config = BridgeConfig::default().with_env_lookup(lookup(&[
            ("SCANBRIDGE_IDLE_TIMEOUT_MS", "250"),
            ("SCANBRIDGE_SWEEP_INTERVAL_MS", "100"),
        ]));
        assert_eq!(config.pool.sweep_interval, Duration::from_millis(100));

        // A long idle timeout keeps the default interval
        let config = BridgeConfig::default()
            .with_env_lookup(lookup(&[("SCANBRIDGE_IDLE_TIMEOUT_MS", "600000")]));
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let config = BridgeConfig::default().with_env_lookup(lookup(&[
            ("SCANBRIDGE_MAX_WORKERS", "lots"),
            ("SCANBRIDGE_IDLE_TIMEOUT_MS", "-5"),
        ]));
        assert_eq!(config.pool.max_workers, 4);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(60));
    }
}
