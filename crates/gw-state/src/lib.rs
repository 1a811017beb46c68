//! # gw-state
//!
//! The gateway's view of its worker fleet.
//!
//! This crate provides:
//! - [`Store`], the in-memory registry of models, backends, GPUs, instances
//!   and slots, with find-or-create and delete-by-exclusion operations
//! - [`PlacementPlanner`], which picks GPUs for a new instance from the
//!   latest synchronized snapshot
//! - [`Synchronizer`], which reconciles the store against each worker host
//!   on an interval
//! - [`HttpWorkerClient`], the HTTP implementation of [`gw_core::WorkerApi`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use gw_state::{HttpWorkerClient, Store, SyncConfig, Synchronizer};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::new();
//! store.upsert_backend("worker-a", "http://worker-a:4567".parse()?);
//!
//! let config = SyncConfig::default();
//! let client = HttpWorkerClient::new(config.backend_timeout)?;
//! let sync = Synchronizer::new(store.clone(), Arc::new(client), config);
//!
//! for report in sync.sync_all().await {
//!     println!("{}: available={}", report.backend, report.available);
//! }
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod client;
pub mod config;
pub mod placement;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use client::HttpWorkerClient;
pub use config::SyncConfig;
pub use placement::{select_gpus, PlacementError, PlacementPlanner};
pub use store::{
    Backend, Gpu, GpuDelta, Instance, Slot, SlotClaim, Store, StoreStats, StoreSummary,
};
pub use sync::{SyncMetrics, SyncReport, Synchronizer};

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors that can occur during state operations
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Worker error: {0}")]
    Worker(#[from] gw_core::Error),
}
