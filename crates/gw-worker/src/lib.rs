//! # gw-worker
//!
//! Worker host agent for the inference gateway.
//!
//! One agent runs on every machine with accelerators. It keeps a snapshot of
//! the local GPUs, holds the model catalog the gateway announces, prepares
//! model artifacts in the background and supervises one engine process per
//! instance. Everything is exposed over a small JSON API that the gateway's
//! synchronizer and lifecycle manager drive.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod fetcher;
pub mod instances;
pub mod ports;
pub mod server;

pub use agent::WorkerAgent;
pub use catalog::ModelCatalog;
pub use config::{PortRange, WorkerConfig};
pub use fetcher::{HttpModelFetcher, ModelFetcher};
pub use instances::{InstanceManager, LaunchOutcome};
pub use ports::PortAllocator;
pub use server::WorkerServer;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_core::ErrorBody;

/// Errors raised by the worker agent
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Invalid GPU selection: {0}")]
    InvalidGpu(String),

    #[error("No available ports")]
    NoFreePort,

    #[error("Failed to start instance: {0}")]
    Launch(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("GPU error: {0}")]
    Gpu(#[from] gw_adapter_gpu::GpuError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] gw_adapter_runtime::RuntimeError),

    #[error("Core error: {0}")]
    Core(#[from] gw_core::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            WorkerError::ModelNotFound(_) | WorkerError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            WorkerError::InvalidGpu(_) => StatusCode::BAD_REQUEST,
            WorkerError::NoFreePort => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        (self.to_status_code(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            WorkerError::ModelNotFound("m1".to_string()).to_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WorkerError::InstanceNotFound("m1-1".to_string()).to_status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WorkerError::InvalidGpu("7".to_string()).to_status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(WorkerError::NoFreePort.to_status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            WorkerError::Launch("spawn".to_string()).to_status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WorkerError::NoFreePort.to_string(), "No available ports");
        let error = WorkerError::from(gw_adapter_runtime::RuntimeError::Process("boom".to_string()));
        assert_eq!(error.to_string(), "Runtime error: Process error: boom");
    }
}
