//! Bounded pool of worker processes.
//!
//! Callers borrow a worker for the duration of one operation through
//! [`WorkerPool::with_worker`]. Returned workers are kept warm and reused most
//! recently returned first; a timer thread disposes workers that have sat idle
//! for longer than the idle timeout. A worker whose operation failed is killed
//! rather than returned, since its channel may be left mid-message.

use super::spawn::{LauncherConfig, WorkerLauncher};
use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Something the pool can start workers with.
pub trait Launch: Send + Sync + 'static {
    type Worker: PooledWorker;

    fn start(&self) -> Result<Self::Worker>;
}

/// A worker as seen by the pool.
pub trait PooledWorker: Send + 'static {
    /// Identifier for logs (the process id for real workers).
    fn id(&self) -> u32;

    /// Whether the worker can serve another caller.
    fn is_reusable(&mut self) -> bool;

    /// Graceful shutdown.
    fn dispose(self);

    /// Immediate termination.
    fn kill(self);
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on worker processes alive at once (idle or checked out).
    pub max_workers: usize,
    /// Idle workers kept launched ahead of demand.
    pub warm_spares: usize,
    /// Idle workers returned longer ago than this are disposed by the sweep.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            warm_spares: 0,
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    /// Workers alive, idle or checked out (including launches in flight).
    pub live: usize,
    pub launched: usize,
    pub reused: usize,
    pub disposed: usize,
    pub faulted: usize,
}

struct PoolEntry<W> {
    worker: W,
    returned_at: Instant,
}

struct PoolState<W> {
    /// Most recently returned last.
    idle: Vec<PoolEntry<W>>,
    live: usize,
    spares_pending: usize,
    shut_down: bool,
}

#[derive(Default)]
struct Counters {
    launched: AtomicUsize,
    reused: AtomicUsize,
    disposed: AtomicUsize,
    faulted: AtomicUsize,
}

struct Shared<L: Launch> {
    launcher: L,
    config: PoolConfig,
    state: Mutex<PoolState<L::Worker>>,
    available: Condvar,
    counters: Counters,
}

impl<L: Launch> Shared<L> {
    fn lock(&self) -> MutexGuard<'_, PoolState<L::Worker>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self) -> Result<L::Worker> {
        let worker = self.launcher.start()?;
        self.counters.launched.fetch_add(1, Ordering::Relaxed);
        Ok(worker)
    }

    /// Give back a slot reserved for a worker that no longer exists.
    fn release_slot(&self) {
        let mut state = self.lock();
        state.live -= 1;
        drop(state);
        self.available.notify_one();
    }

    fn dispose(&self, worker: L::Worker) {
        let id = worker.id();
        worker.dispose();
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
        trace!(worker_id = id, "Worker disposed");
    }

    fn give_back(&self, mut worker: L::Worker) {
        if !worker.is_reusable() {
            debug!(worker_id = worker.id(), "Worker not reusable; disposing");
            self.dispose(worker);
            self.release_slot();
            return;
        }

        let mut state = self.lock();
        if state.shut_down {
            state.live -= 1;
            drop(state);
            self.available.notify_all();
            self.dispose(worker);
            return;
        }
        state.idle.push(PoolEntry {
            worker,
            returned_at: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    fn fault(&self, worker: L::Worker, error: &BridgeError) {
        warn!(worker_id = worker.id(), error = %error, "Operation failed; killing worker");
        worker.kill();
        self.counters.faulted.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
    }

    /// Dispose idle workers returned more than `idle_timeout` before `now`.
    fn sweep(&self, now: Instant) -> usize {
        let stale: Vec<L::Worker> = {
            let mut state = self.lock();
            if state.shut_down {
                return 0;
            }
            let timeout = self.config.idle_timeout;
            let (recent, stale): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|entry| now.saturating_duration_since(entry.returned_at) < timeout);
            state.idle = recent;
            state.live -= stale.len();
            stale.into_iter().map(|entry| entry.worker).collect()
        };

        let evicted = stale.len();
        if evicted > 0 {
            self.available.notify_all();
            debug!(evicted, "Evicting idle workers");
        }
        for worker in stale {
            self.dispose(worker);
        }
        evicted
    }
}

/// A worker checked out of the pool.
///
/// Kills the worker if dropped without being released, so a panicking
/// operation cannot leak a pool slot.
struct Lease<'a, L: Launch> {
    shared: &'a Shared<L>,
    worker: Option<L::Worker>,
    fresh: bool,
}

impl<L: Launch> Lease<'_, L> {
    fn worker(&mut self) -> &mut L::Worker {
        // Only `None` after release/fault, both of which consume the lease
        self.worker.as_mut().expect("lease already released")
    }

    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.give_back(worker);
        }
    }

    fn fault(mut self, error: &BridgeError) {
        if let Some(worker) = self.worker.take() {
            self.shared.fault(worker, error);
        }
    }
}

impl<L: Launch> Drop for Lease<'_, L> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill();
            self.shared.counters.faulted.fetch_add(1, Ordering::Relaxed);
            self.shared.release_slot();
        }
    }
}

struct Sweeper {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Pool of worker processes.
pub struct WorkerPool<L: Launch = WorkerLauncher> {
    shared: Arc<Shared<L>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<L: Launch> WorkerPool<L> {
    /// Create a pool and start its sweep timer. No worker is launched until
    /// the first checkout (or warm spare top-up).
    pub fn new(launcher: L, config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            launcher,
            config: PoolConfig {
                max_workers: config.max_workers.max(1),
                ..config
            },
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
                spares_pending: 0,
                shut_down: false,
            }),
            available: Condvar::new(),
            counters: Counters::default(),
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&shared), shared.config.sweep_interval)?;

        info!(
            max_workers = shared.config.max_workers,
            warm_spares = shared.config.warm_spares,
            "Worker pool created"
        );
        let pool = Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        };
        pool.top_up_spares();
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Run `op` against an exclusively borrowed worker.
    ///
    /// Blocks until a worker is available, launching one if the pool has
    /// room. On success the worker goes back to the pool; on failure it is
    /// killed and the error returned. If `op` fails with `EndpointNotReady`
    /// on a freshly launched worker, it is retried once on another fresh one.
    pub fn with_worker<T>(&self, mut op: impl FnMut(&mut L::Worker) -> Result<T>) -> Result<T> {
        let mut retried = false;
        loop {
            let mut lease = match self.checkout() {
                Ok(lease) => lease,
                Err(BridgeError::EndpointNotReady(msg)) if !retried => {
                    warn!(error = %msg, "Fresh worker not listening yet; retrying launch");
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.top_up_spares();

            match op(lease.worker()) {
                Ok(value) => {
                    lease.release();
                    return Ok(value);
                }
                Err(e) => {
                    let retry = lease.fresh
                        && !retried
                        && matches!(e, BridgeError::EndpointNotReady(_));
                    lease.fault(&e);
                    if !retry {
                        return Err(e);
                    }
                    retried = true;
                }
            }
        }
    }

    fn checkout(&self) -> Result<Lease<'_, L>> {
        let shared = &*self.shared;
        let mut state = shared.lock();
        loop {
            if state.shut_down {
                return Err(BridgeError::PoolShutDown);
            }
            if let Some(entry) = state.idle.pop() {
                shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                trace!(worker_id = entry.worker.id(), "Reusing warm worker");
                return Ok(Lease {
                    shared,
                    worker: Some(entry.worker),
                    fresh: false,
                });
            }
            if state.live < shared.config.max_workers {
                state.live += 1;
                break;
            }
            state = shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        match self.launch_in_background() {
            Ok(worker) => Ok(Lease {
                shared,
                worker: Some(worker),
                fresh: true,
            }),
            Err(e) => {
                shared.release_slot();
                Err(e)
            }
        }
    }

    /// Launch on a helper thread and wait for it. The caller's own thread
    /// never runs process startup code.
    fn launch_in_background(&self) -> Result<L::Worker> {
        let shared = Arc::clone(&self.shared);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("scanbridge-launch".to_string())
            .spawn(move || {
                let _ = tx.send(shared.launch());
            })
            .map_err(|e| BridgeError::LaunchFailed(format!("cannot start launch thread: {}", e)))?;

        rx.recv().map_err(|_| {
            BridgeError::LaunchFailed("launch thread exited without a result".to_string())
        })?
    }

    /// Launch idle workers until `warm_spares` are idle or pending, within
    /// `max_workers`.
    fn top_up_spares(&self) {
        let wanted = self.shared.config.warm_spares;
        if wanted == 0 {
            return;
        }

        let mut state = self.shared.lock();
        while !state.shut_down
            && state.idle.len() + state.spares_pending < wanted
            && state.live < self.shared.config.max_workers
        {
            state.live += 1;
            state.spares_pending += 1;

            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("scanbridge-spare".to_string())
                .spawn(move || launch_spare(&shared));
            if let Err(e) = spawned {
                warn!(error = %e, "Cannot start spare launch thread");
                state.live -= 1;
                state.spares_pending -= 1;
                break;
            }
        }
    }

    /// Dispose idle workers older than the idle timeout. Returns how many
    /// were evicted. Also runs on the sweep timer.
    pub fn sweep(&self) -> usize {
        self.shared.sweep(Instant::now())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let counters = &self.shared.counters;
        PoolStats {
            idle: state.idle.len(),
            live: state.live,
            launched: counters.launched.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            disposed: counters.disposed.load(Ordering::Relaxed),
            faulted: counters.faulted.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep timer, fail blocked callers with `PoolShutDown` and
    /// dispose idle workers. Workers still checked out are disposed when they
    /// come back. Idempotent.
    pub fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            drop(sweeper.stop);
            let _ = sweeper.thread.join();
        }

        let idle: Vec<PoolEntry<L::Worker>> = {
            let mut state = self.shared.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.live -= idle.len();
            idle
        };
        self.shared.available.notify_all();

        info!(idle = idle.len(), "Shutting down worker pool");
        for entry in idle {
            self.shared.dispose(entry.worker);
        }
    }
}

impl WorkerPool<WorkerLauncher> {
    /// Pool over real worker processes.
    pub fn launching(launcher: LauncherConfig, pool: PoolConfig) -> Result<Self> {
        WorkerPool::new(WorkerLauncher::new(launcher), pool)
    }
}

impl<L: Launch> Drop for WorkerPool<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn launch_spare<L: Launch>(shared: &Shared<L>) {
    let result = shared.launch();
    let mut state = shared.lock();
    state.spares_pending -= 1;
    match result {
        Ok(worker) if state.shut_down => {
            state.live -= 1;
            drop(state);
            shared.dispose(worker);
        }
        Ok(worker) => {
            trace!(worker_id = worker.id(), "Warm spare ready");
            state.idle.push(PoolEntry {
                worker,
                returned_at: Instant::now(),
            });
            drop(state);
            shared.available.notify_one();
        }
        Err(e) => {
            state.live -= 1;
            drop(state);
            shared.available.notify_one();
            warn!(error = %e, "Failed to launch warm spare");
        }
    }
}

fn spawn_sweeper<L: Launch>(shared: Weak<Shared<L>>, interval: Duration) -> Result<Sweeper> {
    let (stop, stop_rx) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name("scanbridge-sweep".to_string())
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(shared) = shared.upgrade() else { break };
                        shared.sweep(Instant::now());
                    }
                    // Stop requested, or the pool is gone
                    _ => break,
                }
            }
        })?;
    Ok(Sweeper { stop, thread })
}
