//! Vendor capability table
//!
//! Every vendor-specific decision (PCI identification, index resolution,
//! telemetry tool invocation and parsing, device visibility environment)
//! is looked up here instead of branching on vendor names elsewhere.

use crate::telemetry::{self, Telemetry};
use crate::Result;
use gw_core::{GpuRef, GpuVendor};
use std::collections::{BTreeMap, HashMap};

/// A vendor tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

/// Optional query mapping PCI bus addresses to vendor-local indices.
///
/// Vendors without one use their enumeration order on the PCI bus.
pub struct IndexMapQuery {
    pub command: fn() -> QueryCommand,
    pub parse: fn(&str) -> HashMap<String, u32>,
}

/// What the gateway knows about driving one vendor's devices
pub struct VendorCaps {
    pub vendor: GpuVendor,

    /// PCI vendor id as printed by `lspci -nn`
    pub pci_vendor_id: &'static str,

    /// Environment variable restricting which devices an engine sees
    pub visibility_var: &'static str,

    /// Renders the device list for `visibility_var`
    pub visibility_value: fn(&[u32]) -> String,

    /// Telemetry query for one device index
    pub telemetry_query: fn(u32) -> QueryCommand,

    /// Parser for the telemetry query output
    pub parse_telemetry: fn(&str) -> Result<Telemetry>,

    /// The telemetry tool never exits on its own; stop at the first full sample
    pub streams_output: bool,

    pub index_map: Option<IndexMapQuery>,
}

fn comma_list(indices: &[u32]) -> String {
    indices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn sycl_filter(indices: &[u32]) -> String {
    format!("gpu:{}", comma_list(indices))
}

fn nvidia_telemetry(index: u32) -> QueryCommand {
    QueryCommand {
        program: "nvidia-smi",
        args: vec![
            "-i".to_string(),
            index.to_string(),
            "--query-gpu=name,memory.total,memory.used,memory.free,power.draw,utilization.gpu,temperature.gpu"
                .to_string(),
            "--format=csv,noheader,nounits".to_string(),
        ],
    }
}

fn nvidia_index_map() -> QueryCommand {
    QueryCommand {
        program: "nvidia-smi",
        args: vec![
            "--query-gpu=index,pci.bus_id".to_string(),
            "--format=csv,noheader".to_string(),
        ],
    }
}

fn amd_telemetry(index: u32) -> QueryCommand {
    QueryCommand {
        program: "rocm-smi",
        args: vec![
            "-d".to_string(),
            index.to_string(),
            "--showmeminfo".to_string(),
            "vram".to_string(),
            "--showpower".to_string(),
            "--showuse".to_string(),
            "--showtemp".to_string(),
            "--showproductname".to_string(),
            "--json".to_string(),
        ],
    }
}

fn intel_telemetry(index: u32) -> QueryCommand {
    QueryCommand {
        program: "intel_gpu_top",
        args: vec![
            "-d".to_string(),
            format!("drm:/dev/dri/card{}", index),
            "-J".to_string(),
            "-s".to_string(),
            "500".to_string(),
        ],
    }
}

static CAPS: [VendorCaps; 3] = [
    VendorCaps {
        vendor: GpuVendor::Nvidia,
        pci_vendor_id: "10de",
        visibility_var: "CUDA_VISIBLE_DEVICES",
        visibility_value: comma_list,
        telemetry_query: nvidia_telemetry,
        parse_telemetry: telemetry::parse_nvidia_smi,
        streams_output: false,
        index_map: Some(IndexMapQuery {
            command: nvidia_index_map,
            parse: telemetry::parse_nvidia_bus_map,
        }),
    },
    VendorCaps {
        vendor: GpuVendor::Amd,
        pci_vendor_id: "1002",
        visibility_var: "HIP_VISIBLE_DEVICES",
        visibility_value: comma_list,
        telemetry_query: amd_telemetry,
        parse_telemetry: telemetry::parse_rocm_smi,
        streams_output: false,
        index_map: None,
    },
    VendorCaps {
        vendor: GpuVendor::Intel,
        pci_vendor_id: "8086",
        visibility_var: "SYCL_DEVICE_FILTER",
        visibility_value: sycl_filter,
        telemetry_query: intel_telemetry,
        parse_telemetry: telemetry::parse_intel_gpu_top,
        streams_output: true,
        index_map: None,
    },
];

/// Capabilities for a vendor
pub fn caps(vendor: GpuVendor) -> &'static VendorCaps {
    match vendor {
        GpuVendor::Nvidia => &CAPS[0],
        GpuVendor::Amd => &CAPS[1],
        GpuVendor::Intel => &CAPS[2],
    }
}

/// Identify a vendor from its PCI vendor id
pub fn vendor_for_pci_id(pci_vendor_id: &str) -> Option<GpuVendor> {
    CAPS.iter()
        .find(|c| c.pci_vendor_id.eq_ignore_ascii_case(pci_vendor_id))
        .map(|c| c.vendor)
}

/// Environment restricting an engine to `gpus`.
///
/// Devices are grouped by vendor so a mixed set yields one variable per
/// vendor. An empty set yields no variables.
pub fn visibility_env(gpus: &[GpuRef]) -> BTreeMap<String, String> {
    let mut by_vendor: BTreeMap<GpuVendor, Vec<u32>> = BTreeMap::new();
    for gpu in gpus {
        by_vendor.entry(gpu.vendor).or_default().push(gpu.index);
    }

    by_vendor
        .into_iter()
        .map(|(vendor, indices)| {
            let caps = caps(vendor);
            (caps.visibility_var.to_string(), (caps.visibility_value)(&indices))
        })
        .collect()
}
