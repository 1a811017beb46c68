//! # gw-adapter-runtime
//!
//! Runs inference engine processes on a worker host.
//!
//! This crate provides:
//! - [`EngineConfig`] which turns a model definition and a port into an
//!   engine command line
//! - [`ProcessSupervisor`] which spawns one engine in its own process group,
//!   captures its output into a bounded [`LogRing`] and watches for the
//!   readiness marker
//!
//! ## Example
//!
//! ```rust,no_run
//! use gw_adapter_runtime::{EngineConfig, ProcessSupervisor};
//! use gw_core::Model;
//! use std::collections::BTreeMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Model::new("llama-8b").with_files(vec!["llama-8b.gguf".to_string()]);
//!     let config = EngineConfig::default().process_config("llama-8b-1", &model, 8080, BTreeMap::new())?;
//!
//!     let mut engine = ProcessSupervisor::new(config);
//!     engine.start().await?;
//!     println!("loaded: {}", engine.is_loaded());
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod config;
pub mod log;
pub mod process;

pub use config::{EngineConfig, ProcessConfig, DEFAULT_LOG_LINES, READY_MARKER};
pub use log::LogRing;
pub use process::{ProcessStatus, ProcessSupervisor};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while running engine processes
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
