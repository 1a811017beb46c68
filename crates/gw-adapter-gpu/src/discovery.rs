//! GPU discovery from the PCI bus

use crate::vendor::{self, caps};
use crate::Result;
use gw_core::{GpuRef, GpuVendor};
use std::collections::HashMap;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A display controller line from `lspci -nn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciGpu {
    /// Short bus address, e.g. `01:00.0`
    pub bus: String,
    pub vendor: GpuVendor,
    pub name: String,
    pub device_id: String,
}

/// A device with its vendor-local index resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredGpu {
    pub gpu: GpuRef,
    pub name: String,
    pub bus: String,
}

/// Find `[vvvv:dddd]` and return its position and the two ids
fn find_pci_ids(description: &str) -> Option<(usize, &str, &str)> {
    description
        .match_indices('[')
        .filter_map(|(pos, _)| {
            let candidate = description.get(pos + 1..pos + 10)?;
            let (vendor_id, device_id) = candidate.split_once(':')?;
            let closes = description.get(pos + 10..pos + 11) == Some("]");
            let hex = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit());
            (closes && hex(vendor_id) && hex(device_id)).then_some((pos, vendor_id, device_id))
        })
        .last()
}

/// Parse `lspci -nn` output, keeping VGA and 3D controllers of known vendors.
///
/// Entries match the blacklist when a blacklist item equals the vendor name or
/// occurs anywhere in the line, case-insensitively.
pub fn parse_lspci(output: &str, blacklist: &[String]) -> Vec<PciGpu> {
    let blacklist: Vec<String> = blacklist.iter().map(|b| b.to_lowercase()).collect();

    output
        .lines()
        .filter_map(|line| {
            let (bus, rest) = line.trim().split_once(' ')?;
            let (class, description) = rest.split_once("]: ")?;
            let class_lower = class.to_lowercase();
            if !class_lower.contains("vga") && !class_lower.contains("3d") {
                return None;
            }

            let (ids_pos, vendor_id, device_id) = find_pci_ids(description)?;
            let vendor = vendor::vendor_for_pci_id(vendor_id)?;

            let line_lower = line.to_lowercase();
            if blacklist
                .iter()
                .any(|b| b == vendor.as_str() || line_lower.contains(b.as_str()))
            {
                debug!(bus, %vendor, "Skipping blacklisted GPU");
                return None;
            }

            Some(PciGpu {
                bus: bus.to_lowercase(),
                vendor,
                name: description[..ids_pos].trim().to_string(),
                device_id: device_id.to_lowercase(),
            })
        })
        .collect()
}

/// Resolve vendor-local indices.
///
/// A vendor with a bus map uses it; devices missing from the map, and
/// vendors without one, are numbered in bus order per vendor.
pub fn assign_indices(
    devices: Vec<PciGpu>,
    bus_maps: &HashMap<GpuVendor, HashMap<String, u32>>,
) -> Vec<DiscoveredGpu> {
    let mut ordinals: HashMap<GpuVendor, u32> = HashMap::new();

    devices
        .into_iter()
        .map(|device| {
            let ordinal = ordinals.entry(device.vendor).or_insert(0);
            let index = bus_maps
                .get(&device.vendor)
                .and_then(|map| map.get(&device.bus))
                .copied()
                .unwrap_or(*ordinal);
            *ordinal += 1;

            DiscoveredGpu {
                gpu: GpuRef {
                    vendor: device.vendor,
                    index,
                },
                name: device.name,
                bus: device.bus,
            }
        })
        .collect()
}

/// Run a command and capture stdout, bounded by `limit`
pub(crate) async fn run_capture(program: &str, args: &[String], limit: Duration) -> Result<String> {
    let output = tokio::time::timeout(
        limit,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| crate::GpuError::Timeout(program.to_string()))??;

    if !output.status.success() {
        return Err(crate::GpuError::CommandFailed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Enumerate GPUs on this host
pub async fn discover(blacklist: &[String], limit: Duration) -> Result<Vec<DiscoveredGpu>> {
    let lspci = run_capture("lspci", &["-nn".to_string()], limit).await?;
    let devices = parse_lspci(&lspci, blacklist);

    let mut bus_maps = HashMap::new();
    for vendor in GpuVendor::ALL {
        if !devices.iter().any(|d| d.vendor == vendor) {
            continue;
        }
        let Some(index_map) = &caps(vendor).index_map else {
            continue;
        };
        let query = (index_map.command)();
        match run_capture(query.program, &query.args, limit).await {
            Ok(output) => {
                bus_maps.insert(vendor, (index_map.parse)(&output));
            }
            Err(e) => warn!(%vendor, "Could not resolve device indices, using bus order: {}", e),
        }
    }

    let gpus = assign_indices(devices, &bus_maps);
    for gpu in &gpus {
        info!(vendor = %gpu.gpu.vendor, index = gpu.gpu.index, bus = %gpu.bus, "Found GPU: {}", gpu.name);
    }
    Ok(gpus)
}
