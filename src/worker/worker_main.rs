//! Worker process entry point.
//!
//! Runs inside `scanbridge-worker`. Binds the channel socket, announces itself
//! on stdout, then serves requests from the one host connection until asked to
//! stop or until the host goes away.

use super::ipc::split_stream;
use super::protocol::{HANDSHAKE_ERROR, HANDSHAKE_READY, WorkRequest, WorkResponse};
use super::service::{DEFAULT_INLINE_LIMIT, WorkerService};
use super::watchdog::{PARENT_POLL_INTERVAL, ParentWatchdog, watch_for_eof};
use crate::backend::{Backends, VirtualScanner};
use crate::error::DomainError;
use crate::logging::{self, LogConfig};
use crate::paths::{self, CHANNEL_ID_ENV, RUNTIME_DIR_ENV};
use clap::Parser;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Exit code when the parent disappeared.
pub const EXIT_ORPHANED: i32 = 3;

/// Exit code when startup failed before the handshake.
pub const EXIT_STARTUP_FAILED: i32 = 1;

/// Command line of the worker executable.
#[derive(Debug, Parser)]
#[command(name = "scanbridge-worker", about = "Out-of-process scanning worker")]
pub struct WorkerArgs {
    /// Process id of the host that launched this worker
    pub parent_pid: u32,

    /// Directory holding the channel socket
    #[arg(long, env = RUNTIME_DIR_ENV)]
    pub runtime_dir: Option<PathBuf>,

    /// Name of the channel socket chosen by the host (default: own pid)
    #[arg(long, env = CHANNEL_ID_ENV)]
    pub channel_id: Option<String>,

    /// Images larger than this many bytes are staged to disk
    #[arg(long, env = "SCANBRIDGE_INLINE_LIMIT", default_value_t = DEFAULT_INLINE_LIMIT)]
    pub inline_limit: usize,
}

/// Run the worker. Never returns.
pub fn run_worker_main() -> ! {
    // Socket write errors surface as io::Error instead of killing us.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    logging::init(&LogConfig::for_worker().with_env_overrides());

    let args = match WorkerArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            announce(HANDSHAKE_ERROR);
            std::process::exit(EXIT_STARTUP_FAILED);
        }
    };

    match run(args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Worker failed");
            std::process::exit(EXIT_STARTUP_FAILED);
        }
    }
}

fn run(args: WorkerArgs) -> io::Result<()> {
    let pid = std::process::id();
    let runtime_dir = args
        .runtime_dir
        .clone()
        .unwrap_or_else(paths::default_runtime_dir);
    info!(pid, parent_pid = args.parent_pid, "Worker starting");

    let _watchdog = ParentWatchdog::start(args.parent_pid, PARENT_POLL_INTERVAL, || {
        std::process::exit(EXIT_ORPHANED)
    })?;
    watch_for_eof(io::stdin(), || std::process::exit(0))?;

    let channel_id = args.channel_id.clone().unwrap_or_else(|| pid.to_string());
    let socket_path = paths::channel_path(&runtime_dir, &channel_id);
    let listener = match bind_channel(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!(path = %socket_path.display(), error = %e, "Cannot bind channel");
            announce(HANDSHAKE_ERROR);
            return Err(e);
        }
    };

    let scanner = VirtualScanner::from_env();
    let mut service = WorkerService::new(Backends::builtin().with_scanner(scanner))
        .with_inline_limit(args.inline_limit);

    announce(HANDSHAKE_READY);

    let result = listener
        .accept()
        .and_then(|(stream, _)| serve_connection(&mut service, stream));
    let _ = std::fs::remove_file(&socket_path);
    info!("Worker exiting");
    result
}

/// Bind the socket, replacing a stale one left by an earlier worker.
fn bind_channel(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed stale channel socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Write a handshake line to stdout.
fn announce(line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

/// Serve requests on one connection until stop or EOF.
///
/// A line that does not parse gets an `invalid_input` error response and the
/// loop continues.
pub(crate) fn serve_connection(service: &mut WorkerService, stream: UnixStream) -> io::Result<()> {
    let (mut reader, mut writer) = split_stream(stream)?;

    while let Some(line) = reader.read_line()? {
        let request = match WorkRequest::from_line(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Invalid request");
                let err = DomainError::InvalidInput(format!("invalid request: {}", e));
                writer.write_line(&WorkResponse::error(&err).to_line())?;
                continue;
            }
        };

        debug!(op = request.name(), "Request received");
        let (returned, keep_going) = service.handle(request, writer)?;
        writer = returned;
        if !keep_going {
            return Ok(());
        }
    }

    debug!("Host closed the channel");
    Ok(())
}
