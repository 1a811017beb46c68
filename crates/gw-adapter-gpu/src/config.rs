//! GPU monitoring configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// GPU monitoring backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    /// `lspci` enumeration plus vendor command line tools
    #[serde(alias = "lspci")]
    System,
    /// Static devices for development and tests
    Mock,
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuBackend::System => write!(f, "system"),
            GpuBackend::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for GpuBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" | "lspci" => Ok(GpuBackend::System),
            "mock" => Ok(GpuBackend::Mock),
            _ => Err(format!("Unknown GPU backend: {}", s)),
        }
    }
}

/// GPU monitor configuration
#[derive(Debug, Clone)]
pub struct GpuMonitorConfig {
    /// GPU backend to use
    pub backend: GpuBackend,

    /// How often the snapshot is refreshed
    pub polling_interval: Duration,

    /// Upper bound for a single vendor tool invocation
    pub query_timeout: Duration,

    /// Vendor names or `lspci` substrings to ignore, case-insensitive
    pub blacklist: Vec<String>,

    /// Number of devices the mock backend reports
    pub mock_gpu_count: u32,
}

impl Default for GpuMonitorConfig {
    fn default() -> Self {
        Self {
            backend: GpuBackend::System,
            polling_interval: Duration::from_secs(2),
            query_timeout: Duration::from_secs(5),
            blacklist: Vec::new(),
            mock_gpu_count: 2,
        }
    }
}

impl GpuMonitorConfig {
    /// Create a new configuration for the given backend
    pub fn new(backend: GpuBackend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Set polling interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the per-invocation timeout for vendor tools
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the blacklist
    pub fn with_blacklist(mut self, blacklist: Vec<String>) -> Self {
        self.blacklist = blacklist;
        self
    }

    /// Set the number of mock devices
    pub fn with_mock_gpus(mut self, count: u32) -> Self {
        self.mock_gpu_count = count;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.polling_interval.is_zero() {
            return Err("Polling interval must be greater than zero".to_string());
        }

        if self.query_timeout.is_zero() {
            return Err("Query timeout must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GpuMonitorConfig::default();
        assert_eq!(config.backend, GpuBackend::System);
        assert_eq!(config.polling_interval, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = GpuMonitorConfig::new(GpuBackend::Mock)
            .with_polling_interval(Duration::from_millis(50))
            .with_blacklist(vec!["intel".to_string()])
            .with_mock_gpus(3);

        assert_eq!(config.backend, GpuBackend::Mock);
        assert_eq!(config.mock_gpu_count, 3);
        assert_eq!(config.blacklist, vec!["intel"]);
    }

    #[test]
    fn test_config_validation() {
        let config = GpuMonitorConfig::default().with_polling_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("lspci".parse::<GpuBackend>().unwrap(), GpuBackend::System);
        assert_eq!("Mock".parse::<GpuBackend>().unwrap(), GpuBackend::Mock);
        assert!("nvml".parse::<GpuBackend>().is_err());
    }
}
