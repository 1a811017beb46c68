//! Configuration for the worker agent

use crate::{Result, WorkerError};
use gw_adapter_gpu::{GpuBackend, GpuMonitorConfig};
use gw_adapter_runtime::EngineConfig;
use gw_core::config::{load_file, load_layered};
use gw_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "GW_CONFIG";

/// Files tried when [`CONFIG_ENV`] is unset
pub const CONFIG_SEARCH_PATHS: &[&str] = &["worker.yaml"];

/// Inclusive range of ports handed to engine instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(8080, 8099)
    }
}

/// Worker agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address of the control API
    pub bind: String,

    /// Address engine instances listen on
    pub instance_bind: String,

    /// Engine server binary
    pub llama_bin: PathBuf,

    /// Directory holding model artifacts; created at startup
    pub model_dir: PathBuf,

    /// Output lines kept per instance
    pub log_lines: usize,

    /// GPU snapshot refresh interval (seconds)
    pub update_interval_secs: u64,

    /// Ports handed to engine instances
    pub port_range: PortRange,

    /// Grace period before a stopped engine is killed (seconds)
    pub shutdown_timeout_secs: u64,

    /// GPU source: `lspci` or `mock`
    pub gpu_backend: GpuBackend,

    /// Vendor names or device strings to ignore
    pub gpu_blacklist: Vec<String>,

    /// Devices reported by the mock source
    pub mock_gpus: u32,

    /// Layers the engine offloads to the GPU
    pub gpu_layers: u32,

    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4567".to_string(),
            instance_bind: "0.0.0.0".to_string(),
            llama_bin: PathBuf::from("./server"),
            model_dir: PathBuf::from("models"),
            log_lines: 100,
            update_interval_secs: 2,
            port_range: PortRange::default(),
            shutdown_timeout_secs: 10,
            gpu_backend: GpuBackend::System,
            gpu_blacklist: Vec::new(),
            mock_gpus: 2,
            gpu_layers: 99,
            logging: LoggingConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from `path` if given, otherwise from [`CONFIG_ENV`] or the default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => load_file(path)?,
            None => load_layered(CONFIG_ENV, CONFIG_SEARCH_PATHS)?,
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.instance_bind.trim().is_empty() {
            return Err(WorkerError::Configuration("instance_bind must not be empty".to_string()));
        }
        if self.llama_bin.as_os_str().is_empty() {
            return Err(WorkerError::Configuration("llama_bin must not be empty".to_string()));
        }
        if self.log_lines == 0 {
            return Err(WorkerError::Configuration("log_lines must be positive".to_string()));
        }
        if self.update_interval_secs == 0 {
            return Err(WorkerError::Configuration(
                "update_interval_secs must be positive".to_string(),
            ));
        }
        if self.port_range.start == 0 || self.port_range.is_empty() {
            return Err(WorkerError::Configuration(format!(
                "Invalid port range {}..={}",
                self.port_range.start, self.port_range.end
            )));
        }
        self.gpu_monitor_config()
            .validate()
            .map_err(WorkerError::Configuration)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| WorkerError::Configuration(format!("Invalid bind address {}: {}", self.bind, e)))
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            binary: self.llama_bin.clone(),
            model_dir: self.model_dir.clone(),
            bind: self.instance_bind.clone(),
            gpu_layers: self.gpu_layers,
        }
    }

    pub fn gpu_monitor_config(&self) -> GpuMonitorConfig {
        GpuMonitorConfig::new(self.gpu_backend)
            .with_polling_interval(self.update_interval())
            .with_blacklist(self.gpu_blacklist.clone())
            .with_mock_gpus(self.mock_gpus)
    }
}
