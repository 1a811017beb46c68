//! Configuration for backend synchronization

use std::time::Duration;

/// How often and how patiently backends are synchronized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Interval between passes for one backend
    pub update_interval: Duration,

    /// Bound on every request to a worker host
    pub backend_timeout: Duration,

    /// How long a launch without a worker answer survives reconciliation
    pub launch_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(60),
            backend_timeout: Duration::from_secs(5),
            launch_grace: Duration::from_secs(300),
        }
    }
}

impl SyncConfig {
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_launch_grace(mut self, grace: Duration) -> Self {
        self.launch_grace = grace;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.update_interval.is_zero() {
            return Err("Update interval must be greater than 0".to_string());
        }
        if self.backend_timeout.is_zero() {
            return Err("Backend timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.update_interval, Duration::from_secs(60));
        assert_eq!(config.backend_timeout, Duration::from_secs(5));
        assert_eq!(config.launch_grace, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = SyncConfig::default().with_update_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
