//! Parent-liveness watchdog for worker processes.
//!
//! A worker must not outlive the process that launched it. Two independent
//! signals end it: the parent pid disappearing (polled) and the parent's end
//! of the stdin pipe closing.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the watchdog checks the parent pid.
pub const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Whether a process with this pid exists. EPERM still means it exists.
pub fn process_exists(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Watches the parent process and fires a callback once it is gone.
pub struct ParentWatchdog {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ParentWatchdog {
    /// Start polling `parent_pid` every `interval`. `on_orphaned` runs once,
    /// on the watchdog thread, when the parent is no longer alive.
    pub fn start<F>(parent_pid: u32, interval: Duration, on_orphaned: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("parent-watchdog".to_string())
            .spawn(move || {
                tracing::debug!(parent_pid, "Parent watchdog started");
                while !shutdown_clone.load(Ordering::Relaxed) {
                    if !process_exists(parent_pid) {
                        tracing::warn!(parent_pid, "Parent process is gone");
                        on_orphaned();
                        return;
                    }
                    thread::sleep(interval);
                }
            })?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the watchdog.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ParentWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `on_eof` once `input` reaches end of file or fails.
///
/// The thread is detached: it blocks in `read` for the life of the process.
pub fn watch_for_eof<R, F>(mut input: R, on_eof: F) -> std::io::Result<()>
where
    R: Read + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut buf = [0u8; 256];
            loop {
                match input.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            tracing::info!("Parent closed stdin");
            on_eof();
        })?;
    Ok(())
}
