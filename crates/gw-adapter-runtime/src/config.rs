//! Process and engine launch configuration

use crate::{Result, RuntimeError};
use gw_core::Model;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Line printed by the engine once the model is loaded and it accepts requests
pub const READY_MARKER: &str = "main: server is listening on";

/// Default number of output lines retained per process
pub const DEFAULT_LOG_LINES: usize = 100;

/// How to run one supervised process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    /// Name used when echoing output to the host log
    pub name: String,

    /// Program to execute
    pub command: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Variables added to the inherited environment
    pub env: BTreeMap<String, String>,

    /// Working directory
    pub working_dir: Option<PathBuf>,

    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout: Duration,

    /// Output lines retained in the ring buffer
    pub log_lines: usize,

    /// Substring that marks the process as loaded
    pub ready_marker: String,
}

impl ProcessConfig {
    /// Create a configuration for `command` with default settings
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            shutdown_timeout: Duration::from_secs(10),
            log_lines: DEFAULT_LOG_LINES,
            ready_marker: READY_MARKER.to_string(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_log_lines(mut self, lines: usize) -> Self {
        self.log_lines = lines;
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = marker.into();
        self
    }

    /// Program followed by its arguments
    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(RuntimeError::Configuration("Command must not be empty".to_string()));
        }
        if self.log_lines == 0 {
            return Err(RuntimeError::Configuration(
                "Log buffer must hold at least one line".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how the inference engine is launched on this host
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Engine server binary
    pub binary: PathBuf,

    /// Directory holding model artifacts
    pub model_dir: PathBuf,

    /// Address engines listen on
    pub bind: String,

    /// GPU layers to offload
    pub gpu_layers: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./server"),
            model_dir: PathBuf::from("models"),
            bind: "0.0.0.0".to_string(),
            gpu_layers: 99,
        }
    }
}

impl EngineConfig {
    /// Path of the artifact handed to the engine
    pub fn model_path(&self, model: &Model) -> Result<PathBuf> {
        let file = model.files.first().ok_or_else(|| {
            RuntimeError::Configuration(format!("Model {} lists no files", model.name))
        })?;
        Ok(self.model_dir.join(file))
    }

    /// Engine arguments for serving `model` on `port`
    ///
    /// The context passed with `-c` covers every slot.
    pub fn engine_args(&self, model: &Model, port: u16) -> Result<Vec<String>> {
        let model_path = self.model_path(model)?;
        let mut args = vec![
            "-m".to_string(),
            path_arg(&model_path),
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "--host".to_string(),
            self.bind.clone(),
            "--port".to_string(),
            port.to_string(),
            "-c".to_string(),
            model.total_context().to_string(),
            "-np".to_string(),
            model.slots_per_instance.to_string(),
        ];
        args.extend(model.launch_args.iter().cloned());
        Ok(args)
    }

    /// Full process configuration for one engine instance
    pub fn process_config(
        &self,
        name: &str,
        model: &Model,
        port: u16,
        env: BTreeMap<String, String>,
    ) -> Result<ProcessConfig> {
        Ok(ProcessConfig::new(name, path_arg(&self.binary))
            .with_args(self.engine_args(model, port)?)
            .with_env(env))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
