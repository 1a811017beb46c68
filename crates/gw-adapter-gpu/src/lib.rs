//! # gw-adapter-gpu
//!
//! GPU discovery and telemetry for worker hosts.
//!
//! This crate provides:
//! - A closed vendor capability table (NVIDIA, AMD, Intel) describing how to
//!   query each vendor's tooling and how to restrict device visibility
//! - PCI enumeration via `lspci -nn` with a configurable blacklist
//! - Parsers for `nvidia-smi`, `rocm-smi` and `intel_gpu_top` output
//! - A [`GpuMonitor`] that refreshes a snapshot on an interval; readers only
//!   ever see the latest snapshot
//! - A mock monitor for development and tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use gw_adapter_gpu::{GpuBackend, GpuMonitor, GpuMonitorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GpuMonitorConfig::new(GpuBackend::System)
//!         .with_polling_interval(std::time::Duration::from_secs(2));
//!
//!     let monitor = GpuMonitor::new(config).await?;
//!     monitor.start_background_monitoring().await;
//!
//!     for gpu in monitor.snapshot().await {
//!         println!("{} #{}: {} MB free", gpu.vendor, gpu.index, gpu.memory_free_mb);
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod config;
pub mod discovery;
pub mod monitor;
pub mod telemetry;
pub mod vendor;

pub mod mock;

// Re-export main types
pub use config::{GpuBackend, GpuMonitorConfig};
pub use discovery::{DiscoveredGpu, PciGpu};
pub use mock::MockGpuMonitor;
pub use monitor::{GpuMonitor, GpuMonitorTrait, SystemGpuMonitor};
pub use telemetry::Telemetry;
pub use vendor::{caps, visibility_env, VendorCaps};

/// Result type for GPU operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU operations
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("GPU not found: {0}")]
    GpuNotFound(String),

    #[error("Vendor tool failed: {0}")]
    CommandFailed(String),

    #[error("Could not parse vendor tool output: {0}")]
    Parse(String),

    #[error("Vendor tool timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
