//! Worker process launching and the startup handshake.
//!
//! A launch locates `scanbridge-worker`, starts it in its own process group
//! with piped stdin/stdout, waits for the one-line handshake on stdout, then
//! connects to the worker's socket.

use super::client::WorkerClient;
use super::context::WorkerContext;
use super::ipc::LineReader;
use super::pool::Launch;
use super::proc::WorkerProcess;
use super::protocol::{HANDSHAKE_ERROR, HANDSHAKE_READY};
use crate::error::{BridgeError, Result};
use crate::paths::{self, CHANNEL_ID_ENV, RUNTIME_DIR_ENV, WORKER_EXE_NAME};
use nix::errno::Errno;
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::OnceLock;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Configuration for launching worker processes.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Exact worker executable; skips the directory search when set.
    pub worker_path: Option<PathBuf>,
    /// Directories searched for the worker executable, in order.
    pub search_dirs: Vec<PathBuf>,
    /// Program that runs the worker, with the worker path as first argument.
    pub runner: Option<PathBuf>,
    /// Where worker sockets are created.
    pub runtime_dir: PathBuf,
    pub handshake_timeout: Duration,
    /// Read timeout for each call on the channel (None = wait forever).
    pub call_timeout: Option<Duration>,
    /// How long disposal waits for a voluntary exit before signalling.
    pub stop_timeout: Duration,
    /// Extra environment for the worker process.
    pub env: BTreeMap<String, String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            search_dirs: paths::default_search_dirs(),
            runner: None,
            runtime_dir: paths::default_runtime_dir(),
            handshake_timeout: Duration::from_secs(10),
            call_timeout: None,
            stop_timeout: Duration::from_secs(2),
            env: BTreeMap::new(),
        }
    }
}

/// Starts worker processes.
#[derive(Debug)]
pub struct WorkerLauncher {
    config: LauncherConfig,
    resolved: OnceLock<PathBuf>,
}

impl WorkerLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            resolved: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Locate the worker executable. The first successful lookup is cached.
    pub fn worker_path(&self) -> Result<PathBuf> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }
        let path = self.resolve()?;
        Ok(self.resolved.get_or_init(|| path).clone())
    }

    fn resolve(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.worker_path {
            let path = paths::expand_tilde(path);
            if path.is_file() {
                return Ok(path);
            }
            return Err(BridgeError::WorkerNotFound {
                name: WORKER_EXE_NAME.to_string(),
                searched: path.display().to_string(),
            });
        }
        paths::find_executable(&self.config.search_dirs, WORKER_EXE_NAME).ok_or_else(|| {
            BridgeError::WorkerNotFound {
                name: WORKER_EXE_NAME.to_string(),
                searched: self
                    .config
                    .search_dirs
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })
    }

    fn command(&self, exe: &Path, channel_id: &str) -> Command {
        let mut cmd = match &self.config.runner {
            Some(runner) => {
                let mut cmd = Command::new(runner);
                cmd.arg(exe);
                cmd
            }
            None => Command::new(exe),
        };
        cmd.arg(std::process::id().to_string());
        cmd.env(RUNTIME_DIR_ENV, &self.config.runtime_dir);
        cmd.env(CHANNEL_ID_ENV, channel_id);
        cmd.envs(&self.config.env);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker logs go to our stderr

        // Own process group, so disposal can take down anything the worker started
        cmd.process_group(0);
        cmd
    }

    /// Spawn the worker, retrying briefly while the executable is still open
    /// for writing somewhere (freshly installed or copied binaries).
    fn spawn_retrying(&self, exe: &Path, channel_id: &str) -> std::io::Result<Child> {
        let mut attempt = 0;
        loop {
            match self.command(exe, channel_id).spawn() {
                Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < 5 => {
                    attempt += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                result => return result,
            }
        }
    }

    /// Launch a worker and connect to it.
    #[instrument(level = "debug", skip(self))]
    pub fn start(&self) -> Result<WorkerContext> {
        let exe = self.worker_path()?;
        let started = Instant::now();

        std::fs::create_dir_all(&self.config.runtime_dir).map_err(|e| {
            BridgeError::LaunchFailed(format!(
                "cannot create runtime directory {}: {}",
                self.config.runtime_dir.display(),
                e
            ))
        })?;

        // The socket name is ours to pick: with a runner shim the spawned pid
        // need not be the worker's.
        let channel_id = paths::next_channel_id();
        let mut child = self
            .spawn_retrying(&exe, &channel_id)
            .map_err(|e| BridgeError::LaunchFailed(format!("{}: {}", exe.display(), e)))?;
        let stdout = child.stdout.take();
        let mut process = WorkerProcess::from_child(child);
        let pid = process.pid();

        let handshake = match stdout {
            Some(stdout) => read_handshake(stdout, self.config.handshake_timeout),
            None => Err(BridgeError::LaunchFailed(
                "worker stdout was not captured".to_string(),
            )),
        };
        if let Err(e) = handshake {
            let reason = process.kill();
            warn!(worker_pid = pid, error = %e, reason = ?reason.ok(), "Worker failed to start");
            return Err(e);
        }

        let channel_path = paths::channel_path(&self.config.runtime_dir, &channel_id);
        let client = match WorkerClient::connect(&channel_path, pid, self.config.call_timeout) {
            Ok(client) => client,
            Err(e) => {
                let _ = process.kill();
                return Err(e);
            }
        };

        info!(
            worker_pid = pid,
            channel_id = %channel_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker ready"
        );
        Ok(WorkerContext::new(
            process,
            client,
            channel_path,
            self.config.stop_timeout,
        ))
    }
}

impl Launch for WorkerLauncher {
    type Worker = WorkerContext;

    fn start(&self) -> Result<WorkerContext> {
        WorkerLauncher::start(self)
    }
}

/// Interpret the first stdout line of a worker (`None` = EOF).
pub fn parse_handshake(line: Option<&str>) -> Result<()> {
    match line.map(str::trim) {
        Some(HANDSHAKE_READY) => Ok(()),
        Some(HANDSHAKE_ERROR) => Err(BridgeError::HandshakeFailed(
            "worker reported a startup error (see its log)".to_string(),
        )),
        None => Err(BridgeError::HandshakeFailed(
            "worker exited before completing the handshake".to_string(),
        )),
        Some(other) => Err(BridgeError::ProtocolViolation(format!(
            "unexpected handshake line {:?}",
            other
        ))),
    }
}

/// Read the handshake line, giving up after `timeout`.
///
/// The read happens on a helper thread; when the timeout fires the caller kills
/// the worker, which closes the pipe and ends that thread.
fn read_handshake(stdout: ChildStdout, timeout: Duration) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("worker-handshake".to_string())
        .spawn(move || {
            let mut reader = LineReader::new(stdout);
            let line = reader.read_line().map(|l| l.map(str::to_string));
            let _ = tx.send(line);
        })?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(line)) => {
            debug!(line = ?line, "Handshake received");
            parse_handshake(line.as_deref())
        }
        Ok(Err(e)) => Err(BridgeError::HandshakeFailed(format!(
            "failed to read worker stdout: {}",
            e
        ))),
        Err(RecvTimeoutError::Timeout) => Err(BridgeError::HandshakeFailed(format!(
            "no handshake within {}ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(BridgeError::HandshakeFailed(
            "handshake reader exited".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_handshake() {
        assert!(parse_handshake(Some("ready")).is_ok());
        assert!(parse_handshake(Some("ready\r")).is_ok());
        assert!(matches!(
            parse_handshake(Some("error")),
            Err(BridgeError::HandshakeFailed(_))
        ));
        assert!(matches!(
            parse_handshake(None),
            Err(BridgeError::HandshakeFailed(_))
        ));
        assert!(matches!(
            parse_handshake(Some("hello there")),
            Err(BridgeError::ProtocolViolation(m)) if m.contains("hello there")
        ));
    }

    #[test]
    fn test_default_config() {
        let config = LauncherConfig::default();
        assert!(config.worker_path.is_none());
        assert!(config.runner.is_none());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.runtime_dir.ends_with("scanbridge"));
    }

    #[test]
    fn test_worker_not_found_lists_search_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = WorkerLauncher::new(LauncherConfig {
            search_dirs: vec![dir.path().to_path_buf()],
            ..Default::default()
        });
        match launcher.worker_path() {
            Err(BridgeError::WorkerNotFound { name, searched }) => {
                assert_eq!(name, WORKER_EXE_NAME);
                assert!(searched.contains(&dir.path().display().to_string()));
            }
            other => panic!("Expected WorkerNotFound, got {:?}", other),
        }
    }

    /// Write an executable shell script standing in for the worker.
    fn fake_worker(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(WORKER_EXE_NAME);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn launcher_for(dir: &Path, timeout: Duration) -> WorkerLauncher {
        WorkerLauncher::new(LauncherConfig {
            search_dirs: vec![dir.to_path_buf()],
            runtime_dir: dir.join("run"),
            handshake_timeout: timeout,
            ..Default::default()
        })
    }

    #[test]
    fn test_search_finds_and_caches_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_worker(dir.path(), "exit 0");
        let launcher = launcher_for(dir.path(), Duration::from_secs(1));

        assert_eq!(launcher.worker_path().unwrap(), path);
        fs::remove_file(&path).unwrap();
        // Cached after the first lookup
        assert_eq!(launcher.worker_path().unwrap(), path);
    }

    #[test]
    fn test_error_line_fails_handshake() {
        let dir = tempfile::tempdir().unwrap();
        fake_worker(dir.path(), "echo error");
        let launcher = launcher_for(dir.path(), Duration::from_secs(5));
        assert!(matches!(
            launcher.start(),
            Err(BridgeError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_garbage_line_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        fake_worker(dir.path(), "echo 'Loading plugins...'; sleep 5");
        let launcher = launcher_for(dir.path(), Duration::from_secs(5));
        let started = Instant::now();
        assert!(matches!(
            launcher.start(),
            Err(BridgeError::ProtocolViolation(_))
        ));
        // The sleeping child was killed rather than waited for
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_silent_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        fake_worker(dir.path(), "sleep 5");
        let launcher = launcher_for(dir.path(), Duration::from_millis(200));
        let err = launcher.start().unwrap_err();
        assert!(err.to_string().contains("no handshake within 200ms"));
    }

    #[test]
    fn test_ready_without_socket_is_endpoint_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        fake_worker(dir.path(), "echo ready; sleep 5");
        let launcher = launcher_for(dir.path(), Duration::from_secs(5));
        assert!(matches!(
            launcher.start(),
            Err(BridgeError::EndpointNotReady(_))
        ));
    }

    #[test]
    fn test_channel_id_passed_to_worker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("channel.log");
        fake_worker(
            dir.path(),
            &format!("echo \"$SCANBRIDGE_CHANNEL_ID\" > {}; echo error", log.display()),
        );
        let launcher = launcher_for(dir.path(), Duration::from_secs(5));
        assert!(launcher.start().is_err());

        let id = fs::read_to_string(&log).unwrap();
        assert!(id.trim().starts_with(&format!("{}-", std::process::id())));
    }

    #[test]
    fn test_runner_receives_worker_path() {
        let dir = tempfile::tempdir().unwrap();
        let worker = fake_worker(dir.path(), "exit 0");
        let log = dir.path().join("runner.log");
        let runner = dir.path().join("runner.sh");
        fs::write(
            &runner,
            format!("#!/bin/sh\necho \"$1\" > {}\necho error\n", log.display()),
        )
        .unwrap();
        fs::set_permissions(&runner, fs::Permissions::from_mode(0o755)).unwrap();

        let launcher = WorkerLauncher::new(LauncherConfig {
            worker_path: Some(worker.clone()),
            runner: Some(runner),
            runtime_dir: dir.path().join("run"),
            ..Default::default()
        });
        assert!(launcher.start().is_err());
        let logged = fs::read_to_string(&log).unwrap();
        assert_eq!(logged.trim(), worker.display().to_string());
    }
}
