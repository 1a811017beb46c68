//! Gateway configuration

use gw_core::config::load_layered;
use gw_core::{LoggingConfig, Model};
use gw_state::SyncConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "GW_CONFIG";

/// Files tried when [`CONFIG_ENV`] is unset
pub const CONFIG_SEARCH_PATHS: &[&str] = &["gateway.yaml"];

/// Routes forwarded to engine instances unless configured otherwise
pub const DEFAULT_FORWARD_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/chat/completions",
    "/completions",
    "/completion",
    "/embedding",
    "/infill",
    "/tokenize",
    "/detokenize",
];

/// A worker host the gateway may place instances on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: Url,
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind address for the HTTP server
    pub bind_address: String,

    /// HTTP server listen port
    pub http_port: u16,

    /// Seconds between synchronization passes per backend
    pub update_interval_secs: u64,

    /// Seconds a new instance may take to load
    pub instance_timeout_secs: u64,

    /// Seconds allowed for each request to a worker host
    pub backend_timeout_secs: u64,

    /// Milliseconds between readiness polls
    pub poll_interval_ms: u64,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable response compression. Compression buffers, so streamed
    /// tokens arrive late while it is on.
    pub enable_compression: bool,

    /// Maximum request body size in bytes
    pub max_request_size: usize,

    /// Paths forwarded to engine instances
    pub forward_routes: Vec<String>,

    /// Worker hosts in preference order
    pub backends: Vec<BackendConfig>,

    /// Model catalog
    pub models: Vec<Model>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 3000,
            update_interval_secs: 60,
            instance_timeout_secs: 300,
            backend_timeout_secs: 5,
            poll_interval_ms: 1000,
            enable_cors: true,
            enable_compression: false,
            max_request_size: 10 * 1024 * 1024, // 10MB
            forward_routes: DEFAULT_FORWARD_ROUTES.iter().map(|r| r.to_string()).collect(),
            backends: Vec::new(),
            models: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from defaults, the configuration file and the environment.
    ///
    /// An explicit `path` replaces the file lookup.
    pub fn load(path: Option<&Path>) -> gw_core::Result<Self> {
        match path {
            Some(path) => gw_core::config::load_file(path),
            None => load_layered(CONFIG_ENV, CONFIG_SEARCH_PATHS),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.http_port)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_update_interval(self.update_interval())
            .with_backend_timeout(self.backend_timeout())
            .with_launch_grace(self.instance_timeout())
    }

    pub fn is_forward_route(&self, path: &str) -> bool {
        self.forward_routes.iter().any(|route| route == path)
    }
}

/// Builder for GatewayConfig
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Set HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Set bind address
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    /// Set synchronization interval
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval_secs = interval.as_secs();
        self
    }

    /// Set instance load timeout
    pub fn instance_timeout(mut self, timeout: Duration) -> Self {
        self.config.instance_timeout_secs = timeout.as_secs();
        self
    }

    /// Set worker request timeout
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout_secs = timeout.as_secs();
        self
    }

    /// Set readiness poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable CORS
    pub fn enable_cors(mut self, enabled: bool) -> Self {
        self.config.enable_cors = enabled;
        self
    }

    /// Enable or disable compression
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.config.enable_compression = enabled;
        self
    }

    /// Add a backend after those already configured
    pub fn backend(mut self, name: impl Into<String>, url: Url) -> Self {
        self.config.backends.push(BackendConfig {
            name: name.into(),
            url,
        });
        self
    }

    /// Add a model to the catalog
    pub fn model(mut self, model: Model) -> Self {
        self.config.models.push(model);
        self
    }

    /// Build the configuration
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate gateway configuration
pub fn validate_config(config: &GatewayConfig) -> Result<(), String> {
    if config.http_port == 0 {
        return Err("HTTP port must be greater than 0".to_string());
    }

    if config.update_interval_secs == 0 {
        return Err("Update interval must be greater than 0".to_string());
    }

    if config.instance_timeout_secs == 0 {
        return Err("Instance timeout must be greater than 0".to_string());
    }

    if config.backend_timeout_secs == 0 {
        return Err("Backend timeout must be greater than 0".to_string());
    }

    if config.poll_interval_ms == 0 {
        return Err("Poll interval must be greater than 0".to_string());
    }

    if config.max_request_size == 0 {
        return Err("Max request size must be greater than 0".to_string());
    }

    if let Some(route) = config.forward_routes.iter().find(|r| !r.starts_with('/')) {
        return Err(format!("Forward route must start with '/': {}", route));
    }

    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            return Err(format!("Duplicate backend name: {}", backend.name));
        }
        if backend.url.host_str().is_none() {
            return Err(format!("Backend {} URL has no host", backend.name));
        }
    }

    let mut names = HashSet::new();
    for model in &config.models {
        if !names.insert(model.name.as_str()) {
            return Err(format!("Duplicate model name: {}", model.name));
        }
        if model.slots_per_instance == 0 {
            return Err(format!("Model {} must have at least one slot", model.name));
        }
    }

    Ok(())
}
