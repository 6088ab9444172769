//! Path utilities: worker executable lookup and channel socket locations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// File name of the worker executable.
pub const WORKER_EXE_NAME: &str = "scanbridge-worker";

/// Environment variable through which the parent tells the worker where to bind.
pub const RUNTIME_DIR_ENV: &str = "SCANBRIDGE_RUNTIME_DIR";

/// Environment variable carrying the channel id the worker binds under.
pub const CHANNEL_ID_ENV: &str = "SCANBRIDGE_CHANNEL_ID";

static LAUNCH_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Directory for per-worker channel sockets.
///
/// Uses `$XDG_RUNTIME_DIR/scanbridge` where available, otherwise
/// `<tmp>/scanbridge`.
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("scanbridge")
}

/// A fresh channel id for the next worker launched by this process.
///
/// Chosen by the host before spawning, so the id stays valid when a runner
/// shim sits between the host and the worker.
pub fn next_channel_id() -> String {
    let n = LAUNCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", std::process::id(), n)
}

/// Socket path for the channel with the given id.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use scanbridge::paths::channel_path;
///
/// let path = channel_path(Path::new("/run/user/1000/scanbridge"), "4242-0");
/// assert_eq!(path, Path::new("/run/user/1000/scanbridge/scanbridge-4242-0.sock"));
/// ```
pub fn channel_path(runtime_dir: &Path, channel_id: &str) -> PathBuf {
    runtime_dir.join(format!("scanbridge-{}.sock", channel_id))
}

/// Default search directories for the worker executable, in order.
///
/// The directory of the running executable comes first, then its parent. The
/// parent covers test harnesses, which run from `target/<profile>/deps` while
/// the worker binary lives in `target/<profile>`.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        dirs.push(dir.to_path_buf());
        if let Some(parent) = dir.parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

/// Return the first `<dir>/<name>` that exists as a file.
pub fn find_executable<P: AsRef<Path>>(dirs: &[P], name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.as_ref().join(name))
        .find(|candidate| candidate.is_file())
}

/// Expands a leading `~` in a path to the user's home directory.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
