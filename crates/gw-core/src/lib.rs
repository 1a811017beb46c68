//! # gw-core
//!
//! Core types, traits, and utilities for the GPU-aware inference gateway.
//!
//! This crate provides the data structures and interfaces shared by the
//! gateway and the worker host agent:
//!
//! - The model, vendor and instance-state types
//! - The JSON documents exchanged with worker hosts
//! - The [`WorkerApi`] trait used to control worker hosts, with a mock fleet
//! - Layered configuration loading and logging settings
//! - Error handling types

pub mod api;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use api::{
    ErrorBody, GpuRef, GpuReport, GpuSelector, InstanceReport, LaunchRequest, ModelReport,
    WorkerSnapshot,
};
pub use config::{LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use traits::{MockHost, MockWorker, WorkerApi};
pub use types::{GpuVendor, InstanceId, InstanceState, Model};
