//! Configuration loading shared by the gateway and worker binaries
//!
//! Both binaries layer their configuration the same way:
//! 1. Compiled-in defaults (lowest)
//! 2. A YAML file, named by an environment variable or found in a default location
//! 3. `GW_` prefixed environment variables, `__` separating nested keys (highest)
//!
//! Command line flags are applied on top by the binaries themselves.

use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides, e.g. `GW_HTTP_PORT` or `GW_LOGGING__LEVEL`
pub const ENV_PREFIX: &str = "GW";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Build an `EnvFilter` directive that applies `level` to the given crates
    pub fn filter_directive(&self, crates: &[&str]) -> String {
        let mut directives: Vec<String> = crates
            .iter()
            .map(|krate| format!("{}={}", krate, self.level))
            .collect();
        directives.push("tower_http=debug".to_string());
        directives.join(",")
    }
}

/// Load a configuration from defaults, an optional file, and the environment.
///
/// When `env_var` is set its file is required; otherwise each of
/// `search_paths` is tried and silently skipped if missing.
pub fn load_layered<T>(env_var: &str, search_paths: &[&str]) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&T::default())?);

    if let Ok(config_path) = std::env::var(env_var) {
        builder = builder.add_source(config::File::with_name(&config_path).required(true));
    } else {
        for path in search_paths {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

/// Load a configuration from defaults overlaid with a specific file
pub fn load_file<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let builder = config::Config::builder()
        .add_source(config::Config::try_from(&T::default())?)
        .add_source(config::File::from(path.as_ref()));

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        port: u16,
        name: String,
        logging: LoggingConfig,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                port: 1,
                name: "default".to_string(),
                logging: LoggingConfig::default(),
            }
        }
    }

    #[test]
    fn test_load_file_overlays_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 4567\nlogging:\n  format: json").unwrap();

        let sample: Sample = load_file(file.path()).unwrap();
        assert_eq!(sample.port, 4567);
        assert_eq!(sample.name, "default");
        assert_eq!(sample.logging.format, LogFormat::Json);
        assert_eq!(sample.logging.level, "info");
    }

    #[test]
    fn test_load_layered_without_files() {
        let sample: Sample =
            load_layered("GW_TEST_CONFIG_UNSET_FOR_TESTS", &["./does-not-exist.yaml"]).unwrap();
        assert_eq!(sample.name, "default");
    }

    #[test]
    fn test_filter_directive() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };
        assert_eq!(
            logging.filter_directive(&["gw_router", "gw_state"]),
            "gw_router=debug,gw_state=debug,tower_http=debug"
        );
    }
}
