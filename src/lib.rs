//! scanbridge: run scanner drivers, mail integration and rendering in
//! disposable worker processes.
//!
//! The host borrows a worker from a [`worker::WorkerPool`] and calls it
//! through [`worker::WorkerApi`]. The same trait is implemented in process by
//! [`worker::InProcessWorker`], so callers can choose where an operation runs.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod types;
pub mod worker;

pub use config::BridgeConfig;
pub use error::{BridgeError, DomainError, Result};
