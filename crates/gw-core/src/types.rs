//! Core type definitions for the gateway

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an instance record in the gateway store.
///
/// Ids are allocated monotonically and never reused, so a handle to a
/// deleted instance can never alias a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// GPU vendors the gateway knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl GpuVendor {
    /// All vendors, in a fixed order
    pub const ALL: [GpuVendor; 3] = [GpuVendor::Nvidia, GpuVendor::Amd, GpuVendor::Intel];

    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
        }
    }
}

impl std::str::FromStr for GpuVendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nvidia" => Ok(GpuVendor::Nvidia),
            "amd" | "ati" => Ok(GpuVendor::Amd),
            "intel" => Ok(GpuVendor::Intel),
            _ => Err(format!("Unknown GPU vendor: {}", s)),
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named inference workload definition.
///
/// Field aliases accept the short keys used by older model catalogs
/// (`slots`, `est_memory_mb`, `extra_args`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Unique model name, used as the `model` field of requests
    pub name: String,

    /// Concurrent generations one instance can serve
    #[serde(alias = "slots", default = "default_slots")]
    pub slots_per_instance: u32,

    /// Context length per slot
    #[serde(default = "default_context_length")]
    pub context_length: u32,

    /// Accelerator memory an instance needs, in MB
    #[serde(alias = "est_memory_mb", default)]
    pub estimated_memory_mb: u64,

    /// Extra arguments appended to the engine command line
    #[serde(alias = "extra_args", default)]
    pub launch_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Where the model artifacts can be fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Artifact file names; the first one is handed to the engine
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_slots() -> u32 {
    1
}

fn default_context_length() -> u32 {
    4096
}

impl Model {
    /// Create a model with default sizing
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots_per_instance: default_slots(),
            context_length: default_context_length(),
            estimated_memory_mb: 0,
            launch_args: Vec::new(),
            max_output_tokens: None,
            url: None,
            files: Vec::new(),
        }
    }

    /// Set slots per instance
    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots_per_instance = slots;
        self
    }

    /// Set per-slot context length
    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    /// Set estimated accelerator memory
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.estimated_memory_mb = memory_mb;
        self
    }

    /// Set artifact files
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    /// Set extra engine arguments
    pub fn with_launch_args(mut self, args: Vec<String>) -> Self {
        self.launch_args = args;
        self
    }

    /// Total context the engine must allocate for all slots
    pub fn total_context(&self) -> u64 {
        u64::from(self.context_length) * u64::from(self.slots_per_instance)
    }
}

/// Lifecycle state of an instance as seen by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Uninitialized,
    Launching,
    Running,
    Loaded,
    Failed,
    Terminated,
}

impl InstanceState {
    /// Failed and Terminated are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Terminated)
    }

    /// A process exists or is being started for this instance
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            InstanceState::Launching | InstanceState::Running | InstanceState::Loaded
        )
    }

    /// Map the flags a worker reports onto a state
    pub fn from_flags(running: bool, loaded: bool) -> Self {
        match (running, loaded) {
            (true, true) => InstanceState::Loaded,
            (true, false) => InstanceState::Running,
            (false, _) => InstanceState::Uninitialized,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Uninitialized => "uninitialized",
            InstanceState::Launching => "launching",
            InstanceState::Running => "running",
            InstanceState::Loaded => "loaded",
            InstanceState::Failed => "failed",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_parsing() {
        assert_eq!("NVIDIA".parse::<GpuVendor>().unwrap(), GpuVendor::Nvidia);
        assert_eq!("amd".parse::<GpuVendor>().unwrap(), GpuVendor::Amd);
        assert!("matrox".parse::<GpuVendor>().is_err());
        assert_eq!(GpuVendor::Intel.to_string(), "intel");
    }

    #[test]
    fn test_model_aliases() {
        let yaml = "name: m1\nslots: 4\nest_memory_mb: 5000\nextra_args: [\"--flash-attn\"]\nfiles: [m1.gguf]\n";
        let model: Model = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(model.slots_per_instance, 4);
        assert_eq!(model.estimated_memory_mb, 5000);
        assert_eq!(model.launch_args, vec!["--flash-attn"]);
        assert_eq!(model.context_length, 4096);
        assert_eq!(model.total_context(), 4 * 4096);
    }

    #[test]
    fn test_state_from_flags() {
        assert_eq!(InstanceState::from_flags(true, true), InstanceState::Loaded);
        assert_eq!(InstanceState::from_flags(true, false), InstanceState::Running);
        assert_eq!(InstanceState::from_flags(false, true), InstanceState::Uninitialized);
        assert!(InstanceState::Failed.is_terminal());
        assert!(InstanceState::Launching.is_running());
        assert!(!InstanceState::Uninitialized.is_running());
    }
}
