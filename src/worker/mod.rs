//! Out-of-process workers: launching, pooling and the remote-call channel.
//!
//! Operations that must not run in the host process (driver calls, native
//! dialogs, mail integration, heavy rendering) run in `scanbridge-worker`
//! child processes. The host borrows one from a [`WorkerPool`] for the length
//! of a call.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────────────┐
//!  │          Host process         │
//!  │  WorkerPool ─► WorkerContext  │
//!  │                 WorkerClient  │
//!  └───────────────┬───────────────┘
//!                  │ unix socket, NDJSON
//!  ┌───────────────▼───────────────┐
//!  │       scanbridge-worker       │
//!  │  serve_connection             │
//!  │   └► WorkerService ─► backend │
//!  │       SequencedWriter ◄─ scan │
//!  │                     callbacks │
//!  └───────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Warm reuse**: idle workers are handed out most-recently-used first
//! - **Fault isolation**: a worker whose call failed is killed, never reused
//! - **Ordered streaming**: scan events cross threads through one queue
//! - **No orphans**: workers watch their parent and exit when it is gone

pub mod api;
pub mod client;
pub mod context;
pub mod ipc;
pub mod pool;
pub mod proc;
pub mod protocol;
pub mod sequenced;
pub mod service;
pub mod signals;
pub mod spawn;
pub mod watchdog;
pub mod worker_main;

pub use api::{InProcessWorker, WorkerApi};
pub use client::{ScanStream, WorkerClient};
pub use context::WorkerContext;
pub use pool::{Launch, PoolConfig, PoolStats, PooledWorker, WorkerPool};
pub use protocol::ScanEvent;
pub use service::WorkerService;
pub use spawn::{LauncherConfig, WorkerLauncher};
pub use worker_main::run_worker_main;
