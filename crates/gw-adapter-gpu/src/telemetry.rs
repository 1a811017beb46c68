//! Normalized telemetry and the vendor tool output parsers

use crate::{GpuError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// One normalized reading for a device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub name: Option<String>,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub power_draw_w: Option<f64>,
    pub utilization_pct: Option<f64>,
    pub temperature_c: Option<f64>,
}

impl Telemetry {
    fn from_total_used(total_mb: u64, used_mb: u64) -> Self {
        Self {
            memory_total_mb: total_mb,
            memory_used_mb: used_mb,
            memory_free_mb: total_mb.saturating_sub(used_mb),
            ..Default::default()
        }
    }
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// `nvidia-smi` reports `[N/A]` or `[Not Supported]` for missing fields
fn optional_number(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.starts_with('[') {
        return None;
    }
    field.parse().ok()
}

/// Parse `nvidia-smi --query-gpu=name,memory.total,memory.used,memory.free,power.draw,utilization.gpu,temperature.gpu --format=csv,noheader,nounits`
pub fn parse_nvidia_smi(output: &str) -> Result<Telemetry> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| GpuError::Parse("empty nvidia-smi output".to_string()))?;

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return Err(GpuError::Parse(format!(
            "expected 7 nvidia-smi fields, got {}: {}",
            fields.len(),
            line
        )));
    }

    let memory = |i: usize| -> Result<u64> {
        optional_number(fields[i])
            .map(|v| v as u64)
            .ok_or_else(|| GpuError::Parse(format!("bad memory field '{}'", fields[i])))
    };

    let total = memory(1)?;
    let used = memory(2)?;
    let free = optional_number(fields[3])
        .map(|v| v as u64)
        .unwrap_or_else(|| total.saturating_sub(used));

    Ok(Telemetry {
        name: Some(fields[0].to_string()),
        memory_total_mb: total,
        memory_used_mb: used,
        memory_free_mb: free,
        power_draw_w: optional_number(fields[4]),
        utilization_pct: optional_number(fields[5]),
        temperature_c: optional_number(fields[6]),
    })
}

/// Parse `nvidia-smi --query-gpu=index,pci.bus_id --format=csv,noheader`
/// into a map from short bus address (`01:00.0`) to device index
pub fn parse_nvidia_bus_map(output: &str) -> HashMap<String, u32> {
    output
        .lines()
        .filter_map(|line| {
            let (index, bus_id) = line.split_once(',')?;
            let index = index.trim().parse().ok()?;
            Some((short_bus_id(bus_id.trim()), index))
        })
        .collect()
}

/// `00000000:01:00.0` -> `01:00.0`; already short ids pass through lowercased
pub fn short_bus_id(bus_id: &str) -> String {
    let lower = bus_id.to_lowercase();
    let parts: Vec<&str> = lower.split(':').collect();
    if parts.len() >= 3 {
        parts[parts.len() - 2..].join(":")
    } else {
        lower
    }
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `rocm-smi --showmeminfo vram --showpower --showuse --showtemp --json`.
///
/// The document is keyed by card (`card0`); memory is reported in bytes.
pub fn parse_rocm_smi(output: &str) -> Result<Telemetry> {
    let document: Value = serde_json::from_str(output.trim())?;
    let card = document
        .as_object()
        .and_then(|cards| {
            cards
                .iter()
                .find(|(key, _)| key.starts_with("card"))
                .map(|(_, value)| value)
        })
        .and_then(Value::as_object)
        .ok_or_else(|| GpuError::Parse("no card entry in rocm-smi output".to_string()))?;

    let find = |pred: &dyn Fn(&str) -> bool| {
        card.iter()
            .find(|(key, _)| pred(key))
            .and_then(|(_, value)| number_value(value))
    };

    let total = find(&|k| k.starts_with("VRAM Total Memory"))
        .ok_or_else(|| GpuError::Parse("missing VRAM total".to_string()))?;
    let used = find(&|k| k.starts_with("VRAM Total Used Memory")).unwrap_or(0.0);

    let mut telemetry =
        Telemetry::from_total_used((total / BYTES_PER_MB) as u64, (used / BYTES_PER_MB) as u64);
    telemetry.name = card
        .get("Card series")
        .and_then(Value::as_str)
        .map(str::to_string);
    telemetry.power_draw_w = find(&|k| k.contains("Power") && k.ends_with("(W)"));
    telemetry.utilization_pct = find(&|k| k == "GPU use (%)");
    telemetry.temperature_c = find(&|k| k.starts_with("Temperature") && k.contains("edge"));
    Ok(telemetry)
}

/// Parse one sample of `intel_gpu_top -J`.
///
/// The tool streams an unterminated JSON array, so only the first complete
/// object is considered. It does not report device memory; the reading keeps
/// memory at zero.
pub fn parse_intel_gpu_top(output: &str) -> Result<Telemetry> {
    let trimmed = output.trim_start().trim_start_matches('[');
    let sample = serde_json::Deserializer::from_str(trimmed)
        .into_iter::<Value>()
        .next()
        .ok_or_else(|| GpuError::Parse("empty intel_gpu_top output".to_string()))??;

    let power = sample
        .get("power")
        .and_then(|p| p.get("GPU").or_else(|| p.get("gpu")))
        .and_then(number_value);

    let utilization = sample
        .get("engines")
        .and_then(Value::as_object)
        .map(|engines| {
            engines
                .values()
                .filter_map(|e| e.get("busy").and_then(number_value))
                .fold(0.0_f64, f64::max)
        });

    Ok(Telemetry {
        power_draw_w: power,
        utilization_pct: utilization,
        ..Default::default()
    })
}
