//! A launched worker: its process handle plus the bound client.

use super::client::WorkerClient;
use super::pool::PooledWorker;
use super::proc::WorkerProcess;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exclusive handle to one worker process and its channel.
pub struct WorkerContext {
    process: WorkerProcess,
    client: WorkerClient,
    channel_path: PathBuf,
    stop_timeout: Duration,
    launched_at: Instant,
}

impl WorkerContext {
    pub fn new(
        process: WorkerProcess,
        client: WorkerClient,
        channel_path: PathBuf,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            process,
            client,
            channel_path,
            stop_timeout,
            launched_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// The RPC client bound to this worker.
    pub fn client(&mut self) -> &mut WorkerClient {
        &mut self.client
    }

    pub fn channel_path(&self) -> &Path {
        &self.channel_path
    }

    pub fn uptime(&self) -> Duration {
        self.launched_at.elapsed()
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_running()
    }

    /// Ask the worker to stop, then wait for it, escalating to signals.
    pub fn dispose(mut self) {
        let pid = self.pid();
        if self.client.is_usable()
            && let Err(e) = self.client.stop_worker(self.stop_timeout)
        {
            debug!(worker_pid = pid, error = %e, "Stop request failed; terminating");
        }
        match self.process.stop(self.stop_timeout) {
            Ok(reason) => debug!(
                worker_pid = pid,
                uptime_ms = self.uptime().as_millis() as u64,
                %reason,
                "Worker disposed"
            ),
            Err(e) => warn!(worker_pid = pid, error = %e, "Failed to stop worker"),
        }
    }

    /// Kill the worker's process group without asking.
    pub fn kill(mut self) {
        let pid = self.pid();
        // A worker that died mid-call has its own exit status to report
        if let Ok(Some(reason)) = self.process.try_wait() {
            warn!(worker_pid = pid, %reason, "Worker exited during a call");
            return;
        }
        match self.process.kill() {
            Ok(reason) if reason.is_crash() => {
                warn!(worker_pid = pid, %reason, "Worker had crashed")
            }
            Ok(reason) => debug!(worker_pid = pid, %reason, "Worker killed"),
            Err(e) => warn!(worker_pid = pid, error = %e, "Failed to kill worker"),
        }
    }
}

impl PooledWorker for WorkerContext {
    fn id(&self) -> u32 {
        self.pid()
    }

    fn is_reusable(&mut self) -> bool {
        if !self.client.is_usable() {
            return false;
        }
        if self.is_alive() {
            return true;
        }
        if let Some(reason) = self.process.termination_reason() {
            warn!(worker_pid = self.pid(), %reason, "Worker exited while checked out");
        }
        false
    }

    fn dispose(self) {
        WorkerContext::dispose(self)
    }

    fn kill(self) {
        WorkerContext::kill(self)
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        // The worker removes its own socket on a clean exit; a killed one cannot.
        let _ = std::fs::remove_file(&self.channel_path);
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("process", &self.process)
            .field("channel_path", &self.channel_path)
            .finish_non_exhaustive()
    }
}
