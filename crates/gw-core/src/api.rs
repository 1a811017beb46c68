//! JSON documents exchanged between the gateway and worker hosts

use crate::types::{GpuVendor, Model};
use serde::{Deserialize, Serialize};

/// One accelerator as reported by a worker host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReport {
    pub vendor: GpuVendor,
    /// Index the vendor tooling and visibility variables understand
    pub index: u32,
    #[serde(default)]
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    #[serde(default)]
    pub memory_used_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_draw_w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

impl GpuReport {
    pub fn gpu_ref(&self) -> GpuRef {
        GpuRef {
            vendor: self.vendor,
            index: self.index,
        }
    }
}

/// Vendor-qualified device reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GpuRef {
    pub vendor: GpuVendor,
    pub index: u32,
}

/// Device selector accepted by `POST /instances`.
///
/// A bare index is resolved against the worker's enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuSelector {
    Index(u32),
    Device(GpuRef),
}

impl From<GpuRef> for GpuSelector {
    fn from(gpu: GpuRef) -> Self {
        GpuSelector::Device(gpu)
    }
}

/// A catalog entry on a worker host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    #[serde(flatten)]
    pub model: Model,
    /// Artifacts are present and the model can be launched
    #[serde(default)]
    pub ready: bool,
}

/// Status of one supervised engine process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub slots_in_use: u32,
    pub slots_capacity: u32,
    pub port: u16,
    #[serde(default)]
    pub bind: String,
    pub running: bool,
    pub loaded: bool,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub gpus: Vec<GpuRef>,
}

/// Everything the synchronizer needs from one worker host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    #[serde(default)]
    pub gpus: Vec<GpuReport>,
    #[serde(default)]
    pub models: Vec<ModelReport>,
    #[serde(default)]
    pub instances: Vec<InstanceReport>,
}

/// Body of `POST /instances`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub name: String,
    pub model: String,
    /// Absent means every GPU of the host; an empty list means none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<Vec<GpuSelector>>,
}

/// Error document returned by both HTTP surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
