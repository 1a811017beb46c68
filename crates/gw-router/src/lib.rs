//! # gw-router
//!
//! Request admission and streaming proxy for the inference gateway.
//!
//! This crate provides:
//! - The instance lifecycle manager that launches, polls and tears down
//!   engine instances on worker hosts
//! - The slot admission controller that hands out [`SlotLease`]s, launching
//!   new instances when every slot is taken
//! - The request router and streaming proxy that forward a request to the
//!   leased slot and release it when the response body ends or is dropped
//! - The gateway HTTP server and the `gw-router` binary
//!
//! ## Example
//!
//! ```rust,no_run
//! use gw_router::{Gateway, GatewayConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfigBuilder::new()
//!         .http_port(3000)
//!         .backend("worker-a", "http://10.0.0.2:4567".parse()?)
//!         .build();
//!
//!     let gateway = Gateway::new(config)?;
//!     gateway.serve().await?;
//!     Ok(())
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_core::ErrorBody;
use gw_state::{PlacementError, StateError};
use thiserror::Error;

pub mod admission;
pub mod config;
pub mod handler;
pub mod lifecycle;
pub mod proxy;
pub mod router;
pub mod server;

// Re-export main types
pub use admission::{AdmissionController, SlotLease};
pub use config::{BackendConfig, GatewayConfig, GatewayConfigBuilder};
pub use handler::{resolve_model, RequestHandler};
pub use lifecycle::LifecycleManager;
pub use proxy::{ProxyBody, UpstreamProxy};
pub use router::{Gateway, RouterStats};
pub use server::HttpServer;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while serving a request
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    NotFound(String),

    #[error("No available backend: {0}")]
    NoAvailableBackend(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Convert to HTTP status code
    pub fn to_status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::NoAvailableBackend(_) => 503,
            GatewayError::Unavailable(_) => 503,
            GatewayError::InsufficientResources(_) => 503,
            GatewayError::LaunchFailure(_) => 503,
            GatewayError::UpstreamTransport(_) => 500,
            GatewayError::NotImplemented(_) => 501,
            GatewayError::BadRequest(_) => 400,
            GatewayError::Configuration(_) => 500,
            GatewayError::Server(_) => 500,
            GatewayError::State(_) => 500,
            GatewayError::Io(_) => 500,
        }
    }
}

impl From<PlacementError> for GatewayError {
    fn from(error: PlacementError) -> Self {
        match error {
            PlacementError::InsufficientResources { .. } => {
                GatewayError::InsufficientResources(error.to_string())
            }
            PlacementError::UnknownBackend(name) => GatewayError::NoAvailableBackend(name),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.to_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_status_codes() {
        assert_eq!(GatewayError::NotFound("m".to_string()).to_status_code(), 404);
        assert_eq!(GatewayError::NoAvailableBackend("m".to_string()).to_status_code(), 503);
        assert_eq!(GatewayError::Unavailable("m".to_string()).to_status_code(), 503);
        assert_eq!(GatewayError::InsufficientResources("m".to_string()).to_status_code(), 503);
        assert_eq!(GatewayError::LaunchFailure("m".to_string()).to_status_code(), 503);
        assert_eq!(GatewayError::UpstreamTransport("m".to_string()).to_status_code(), 500);
        assert_eq!(GatewayError::NotImplemented("/x".to_string()).to_status_code(), 501);
        assert_eq!(GatewayError::BadRequest("x".to_string()).to_status_code(), 400);
    }

    #[test]
    fn test_placement_error_conversion() {
        let error: GatewayError = PlacementError::InsufficientResources {
            backend: "a".to_string(),
            model: "m".to_string(),
            required_mb: 10,
            available_mb: 5,
        }
        .into();
        assert!(matches!(error, GatewayError::InsufficientResources(_)));

        let error: GatewayError = PlacementError::UnknownBackend("a".to_string()).into();
        assert!(matches!(error, GatewayError::NoAvailableBackend(_)));
    }

    #[tokio::test]
    async fn test_error_renders_json_body() {
        let response = GatewayError::NotFound("Model not found".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "Model not found");
    }
}
