//! Process handle for worker subprocesses.
//!
//! Workers are started as leaders of their own process group, so every signal
//! here goes to the whole group: helper processes a driver may have started
//! die together with the worker.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{BridgeError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::process::{Child, ChildStdin};
use std::time::{Duration, Instant};

/// Handle to a running worker process.
pub struct WorkerProcess {
    pid: Pid,
    /// Held open so the worker sees EOF on stdin when we go away.
    stdin: Option<ChildStdin>,
    /// Set once the process has been reaped.
    exit: Option<TerminationReason>,
}

impl WorkerProcess {
    /// Take over a spawned child. Its stdout must already have been taken by
    /// the caller for the handshake.
    pub fn from_child(mut child: Child) -> Self {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child.stdin.take();
        // Dropping a std Child neither kills nor reaps it; we own both from here.
        drop(child);
        Self {
            pid,
            stdin,
            exit: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// How the process ended, if it has been reaped.
    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.exit.as_ref()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to reap the process. Returns `None` if it is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(analyze_wait_status(status)))),
            Err(Errno::ECHILD) => Ok(Some(self.record(TerminationReason::Unknown))),
            Err(e) => Err(BridgeError::Transport(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => return Ok(self.record(analyze_wait_status(status))),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.record(TerminationReason::Unknown)),
                Err(e) => {
                    return Err(BridgeError::Transport(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Send SIGTERM to the process group.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process group and reap the worker.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Wait up to `timeout` for a voluntary exit, then escalate to SIGTERM and
    /// finally SIGKILL.
    ///
    /// Closing stdin is the first step: an idle worker treats stdin EOF as a
    /// request to exit.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        self.stdin.take();

        if let Some(reason) = self.wait_timeout(timeout)? {
            return Ok(reason);
        }

        self.terminate()?;
        if let Some(reason) = self.wait_timeout(Duration::from_millis(100))? {
            return Ok(reason);
        }

        self.kill()
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(reason) = self.try_wait()? {
                return Ok(Some(reason));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match killpg(self.pid, signal) {
            // Group already gone; waitpid will tell us how.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(BridgeError::Transport(format!(
                "Failed to send {:?} to worker {}: {}",
                signal, self.pid, e
            ))),
        }
    }

    fn record(&mut self, reason: TerminationReason) -> TerminationReason {
        self.exit = Some(reason.clone());
        reason
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.kill();
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid.as_raw())
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn spawn_grouped(program: &str, args: &[&str]) -> WorkerProcess {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("Failed to spawn test process");
        WorkerProcess::from_child(child)
    }

    #[test]
    fn test_stop_closes_stdin_first() {
        // cat exits on its own once stdin is closed
        let mut proc = spawn_grouped("cat", &[]);
        assert!(proc.is_running());

        let reason = proc.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(reason, TerminationReason::Exited(0));
        assert!(!proc.is_running());
    }

    #[test]
    fn test_stop_escalates_to_signals() {
        let mut proc = spawn_grouped("sleep", &["60"]);
        let reason = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGTERM));
    }

    #[test]
    fn test_kill_reaps() {
        let mut proc = spawn_grouped("sleep", &["60"]);
        let reason = proc.kill().unwrap();
        assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
        assert_eq!(proc.termination_reason(), Some(&reason));
        // Second kill is a no-op
        assert_eq!(proc.kill().unwrap(), reason);
    }
}
