//! End-to-end tests against the real `scanbridge-worker` executable.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use scanbridge::BridgeError;
use scanbridge::backend::virtual_scanner::{FEEDER_ID, FLATBED_ID, JAMMED_ID, STEP_DELAY_ENV};
use scanbridge::error::ErrorKind;
use scanbridge::types::{Driver, ImageData, ScanDevice, ScanOptions};
use scanbridge::worker::watchdog::process_exists;
use scanbridge::worker::{
    InProcessWorker, LauncherConfig, PoolConfig, ScanEvent, WorkerApi, WorkerLauncher, WorkerPool,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn launcher_config(runtime: &TempDir) -> LauncherConfig {
    LauncherConfig {
        worker_path: Some(PathBuf::from(env!("CARGO_BIN_EXE_scanbridge-worker"))),
        runtime_dir: runtime.path().to_path_buf(),
        call_timeout: Some(Duration::from_secs(20)),
        ..LauncherConfig::default()
    }
}

fn pool_with(launcher: LauncherConfig, pool: PoolConfig) -> WorkerPool {
    WorkerPool::launching(launcher, pool).unwrap()
}

fn pool(runtime: &TempDir) -> WorkerPool {
    pool_with(launcher_config(runtime), PoolConfig::default())
}

fn options(device: &str) -> ScanOptions {
    let mut options = ScanOptions::for_device(ScanDevice::new(device, "", Driver::Virtual));
    options.dpi = 20;
    options
}

fn wait_until_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_launch_handshake_and_dispose() {
    let runtime = TempDir::new().unwrap();
    let launcher = WorkerLauncher::new(launcher_config(&runtime));

    let context = launcher.start().unwrap();
    let pid = context.pid();
    let socket = context.channel_path().to_path_buf();
    assert!(socket.starts_with(runtime.path()));
    assert!(socket.exists());

    context.dispose();
    assert!(wait_until_gone(pid));
    assert!(!socket.exists());
}

#[test]
fn test_runner_that_forks_the_worker() {
    use std::os::unix::fs::PermissionsExt;

    let runtime = TempDir::new().unwrap();
    let runner = runtime.path().join("runner.sh");
    // Runs the worker as a child instead of exec'ing it
    std::fs::write(&runner, "#!/bin/sh\n\"$@\"\n").unwrap();
    std::fs::set_permissions(&runner, std::fs::Permissions::from_mode(0o755)).unwrap();

    let launcher = WorkerLauncher::new(LauncherConfig {
        runner: Some(runner),
        ..launcher_config(&runtime)
    });
    let mut context = launcher.start().unwrap();
    let devices = context
        .client()
        .get_device_list(&ScanOptions::default())
        .unwrap();
    assert!(devices.iter().any(|d| d.id == FLATBED_ID));

    let pid = context.pid();
    context.dispose();
    assert!(wait_until_gone(pid));
}

#[test]
fn test_sequential_calls_reuse_warm_worker() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);
    let opts = ScanOptions::default();

    let (first_pid, first) = pool
        .with_worker(|ctx| Ok((ctx.pid(), ctx.client().get_device_list(&opts)?)))
        .unwrap();
    let (second_pid, second) = pool
        .with_worker(|ctx| Ok((ctx.pid(), ctx.client().get_device_list(&opts)?)))
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_pid, second_pid);
    assert!(first.iter().any(|d| d.id == FLATBED_ID));

    let stats = pool.stats();
    assert_eq!(stats.launched, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.idle, 1);
}

#[test]
fn test_remote_errors_match_in_process_errors() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);
    let mut local = InProcessWorker::default();

    let mut twain = ScanOptions::default();
    twain.driver = Driver::Twain;
    let cases = [
        twain,
        options("virtual:nonexistent"),
        options(FEEDER_ID).with_max_pages(0),
    ];

    for case in &cases {
        let local_err = local.scan(case, &mut |_| {}).unwrap_err();
        let remote_err = pool
            .with_worker(|ctx| ctx.client().scan(case, &mut |_| {}))
            .unwrap_err();
        assert_eq!(remote_err.as_domain(), local_err.as_domain());
        assert!(remote_err.as_domain().is_some());
    }
    // Domain failures fault the context
    assert_eq!(pool.stats().faulted, cases.len());
}

#[test]
fn test_scan_events_arrive_in_order() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);
    let opts = options(FEEDER_ID).with_max_pages(2);

    let events = pool
        .with_worker(|ctx| {
            let mut events = Vec::new();
            ctx.client().scan(&opts, &mut |e| events.push(e))?;
            Ok(events)
        })
        .unwrap();

    let shape: Vec<&str> = events
        .iter()
        .map(|e| match e {
            ScanEvent::PageStart => "start",
            ScanEvent::Progress { .. } => "progress",
            ScanEvent::Image { .. } => "image",
        })
        .collect();
    let page = ["start", "progress", "progress", "progress", "progress", "image"];
    assert_eq!(shape, [page, page].concat());

    let pages: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Image { image } => Some(image.page),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![1, 2]);

    // The worker went back to the pool
    assert_eq!(pool.stats().idle, 1);
}

#[test]
fn test_jam_keeps_pages_delivered_before_it() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);
    let opts = options(JAMMED_ID);

    let mut images = 0;
    let err = pool
        .with_worker(|ctx| {
            ctx.client().scan(&opts, &mut |e| {
                if matches!(e, ScanEvent::Image { .. }) {
                    images += 1;
                }
            })
        })
        .unwrap_err();

    assert_eq!(images, 1);
    assert_eq!(
        err.as_domain().map(|e| e.kind()),
        Some(ErrorKind::PaperJam)
    );
}

#[test]
fn test_large_pages_are_staged() {
    let runtime = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let pool = pool(&runtime);

    let mut opts = options(FLATBED_ID);
    opts.dpi = 150;

    let (image, thumbnail) = pool
        .with_worker(|ctx| {
            let client = ctx.client();
            client.init(Some(staging.path()))?;
            let mut image = None;
            client.scan(&opts, &mut |e| {
                if let ScanEvent::Image { image: i } = e {
                    image = Some(i);
                }
            })?;
            let image = image.expect("flatbed delivers one page");
            let thumbnail = client.render_thumbnail(&image.data, 32)?;
            Ok((image, thumbnail))
        })
        .unwrap();

    match &image.data {
        ImageData::Staged { path } => {
            assert!(path.starts_with(staging.path()));
            let bytes = std::fs::read(path).unwrap();
            assert!(bytes.starts_with(b"P6"));
        }
        ImageData::Inline { .. } => panic!("expected a staged image"),
    }
    assert!(thumbnail.starts_with(b"P6"));
}

#[test]
fn test_killed_worker_ends_stream_with_error() {
    let runtime = TempDir::new().unwrap();
    let mut launcher = launcher_config(&runtime);
    launcher
        .env
        .insert(STEP_DELAY_ENV.to_string(), "200".to_string());
    let pool = pool_with(launcher, PoolConfig::default());
    let opts = options(FEEDER_ID).with_max_pages(3);

    let started = Instant::now();
    let mut seen = 0;
    let mut worker_pid = 0;
    let result = pool.with_worker(|ctx| {
        worker_pid = ctx.pid();
        let mut stream = ctx.client().scan_stream(&opts)?;
        // First event proves the scan is running
        stream.next().expect("stream has events")?;
        seen += 1;
        kill(Pid::from_raw(worker_pid as i32), Signal::SIGKILL).unwrap();
        for item in stream {
            item?;
            seen += 1;
        }
        Ok(())
    });

    assert!(matches!(result, Err(BridgeError::Transport(_))));
    assert!(seen >= 1);
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(wait_until_gone(worker_pid));

    let stats = pool.stats();
    assert_eq!(stats.faulted, 1);
    assert_eq!(stats.live, 0);
}

#[test]
fn test_failed_call_kills_worker_and_next_call_launches() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);

    let mut first_pid = 0;
    let result: scanbridge::Result<()> = pool.with_worker(|ctx| {
        first_pid = ctx.pid();
        Err(BridgeError::Transport("synthetic failure".to_string()))
    });
    assert!(result.is_err());
    assert!(wait_until_gone(first_pid));

    let second_pid = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(pool.stats().launched, 2);
}

#[test]
fn test_worker_dead_on_return_is_not_pooled() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);

    let first_pid = pool
        .with_worker(|ctx| {
            let pid = ctx.pid();
            kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while ctx.is_alive() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(pid)
        })
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live, 0);

    let second_pid = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(pool.stats().launched, 2);
}

#[test]
fn test_sweep_disposes_idle_worker() {
    let runtime = TempDir::new().unwrap();
    let pool = pool_with(
        launcher_config(&runtime),
        PoolConfig {
            idle_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        },
    );

    let pid = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap();
    assert_eq!(pool.sweep(), 0);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.sweep(), 1);
    assert!(wait_until_gone(pid));

    let stats = pool.stats();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.disposed, 1);
}

#[test]
fn test_shutdown_stops_idle_workers() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);

    let pid = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap();
    pool.shutdown();
    assert!(wait_until_gone(pid));

    let err = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap_err();
    assert!(matches!(err, BridgeError::PoolShutDown));
}

#[test]
fn test_shutdown_does_not_wait_on_frozen_worker() {
    let runtime = TempDir::new().unwrap();
    let launcher = LauncherConfig {
        stop_timeout: Duration::from_millis(200),
        ..launcher_config(&runtime)
    };
    let pool = pool_with(launcher, PoolConfig::default());

    let pid = pool.with_worker(|ctx| Ok(ctx.pid())).unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGSTOP).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        pool.shutdown();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
    assert!(wait_until_gone(pid));
}

#[test]
fn test_other_operations_round_trip() {
    let runtime = TempDir::new().unwrap();
    let pool = pool(&runtime);

    pool.with_worker(|ctx| {
        let client = ctx.client();
        assert!(!client.can_load_mail(None)?);

        let config = client
            .native_device_ui(FEEDER_ID, Default::default())?
            .expect("virtual devices have a config");
        assert_eq!(config.item_name, "Feeder");
        Ok(())
    })
    .unwrap();

    let err = pool
        .with_worker(|ctx| ctx.client().render_pdf(std::path::Path::new("/tmp/x.pdf"), 150.0))
        .unwrap_err();
    assert_eq!(
        err.as_domain().map(|e| e.kind()),
        Some(ErrorKind::NotSupported)
    );
}
