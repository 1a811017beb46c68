//! GPU monitoring implementation

use crate::config::{GpuBackend, GpuMonitorConfig};
use crate::discovery::{self, DiscoveredGpu};
use crate::telemetry::Telemetry;
use crate::vendor::{caps, VendorCaps};
use crate::{GpuError, Result};

use async_trait::async_trait;
use gw_core::{GpuRef, GpuReport};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Trait defining the interface for GPU monitors
#[async_trait]
pub trait GpuMonitorTrait: Send + Sync {
    /// Devices this monitor reports on, in enumeration order
    async fn discover_gpus(&self) -> Result<Vec<GpuRef>>;

    /// Current reading for one device
    async fn get_gpu_metrics(&self, gpu: GpuRef) -> Result<GpuReport>;

    /// Current readings for every device
    async fn get_all_metrics(&self) -> Result<Vec<GpuReport>> {
        let mut reports = Vec::new();
        for gpu in self.discover_gpus().await? {
            reports.push(self.get_gpu_metrics(gpu).await?);
        }
        Ok(reports)
    }
}

/// Monitor backed by `lspci` and the vendor command line tools
pub struct SystemGpuMonitor {
    devices: Vec<DiscoveredGpu>,
    query_timeout: Duration,
}

impl SystemGpuMonitor {
    /// Enumerate devices once; telemetry is queried on every refresh
    pub async fn new(config: &GpuMonitorConfig) -> Result<Self> {
        let devices = discovery::discover(&config.blacklist, config.query_timeout).await?;
        info!("Discovered {} GPUs", devices.len());
        Ok(Self {
            devices,
            query_timeout: config.query_timeout,
        })
    }

    async fn query(&self, caps: &VendorCaps, index: u32) -> Result<Telemetry> {
        let query = (caps.telemetry_query)(index);
        if !caps.streams_output {
            let output = discovery::run_capture(query.program, &query.args, self.query_timeout).await?;
            return (caps.parse_telemetry)(&output);
        }

        // Read until the first complete sample parses, then drop the child
        let mut child = Command::new(query.program)
            .args(&query.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GpuError::CommandFailed(format!("{} has no stdout", query.program)))?;

        let sample = async {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    return (caps.parse_telemetry)(&String::from_utf8_lossy(&buffer));
                }
                buffer.extend_from_slice(&chunk[..n]);
                if let Ok(telemetry) = (caps.parse_telemetry)(&String::from_utf8_lossy(&buffer)) {
                    return Ok(telemetry);
                }
            }
        };

        tokio::time::timeout(self.query_timeout, sample)
            .await
            .map_err(|_| GpuError::Timeout(query.program.to_string()))?
    }
}

#[async_trait]
impl GpuMonitorTrait for SystemGpuMonitor {
    async fn discover_gpus(&self) -> Result<Vec<GpuRef>> {
        Ok(self.devices.iter().map(|d| d.gpu).collect())
    }

    async fn get_gpu_metrics(&self, gpu: GpuRef) -> Result<GpuReport> {
        let device = self
            .devices
            .iter()
            .find(|d| d.gpu == gpu)
            .ok_or_else(|| GpuError::GpuNotFound(format!("{} #{}", gpu.vendor, gpu.index)))?;

        let telemetry = self.query(caps(gpu.vendor), gpu.index).await?;
        Ok(GpuReport {
            vendor: gpu.vendor,
            index: gpu.index,
            name: telemetry.name.unwrap_or_else(|| device.name.clone()),
            memory_total_mb: telemetry.memory_total_mb,
            memory_free_mb: telemetry.memory_free_mb,
            memory_used_mb: telemetry.memory_used_mb,
            power_draw_w: telemetry.power_draw_w,
            utilization_pct: telemetry.utilization_pct,
            temperature_c: telemetry.temperature_c,
        })
    }

    /// A device whose tool fails is still reported, with zeroed readings
    async fn get_all_metrics(&self) -> Result<Vec<GpuReport>> {
        let mut reports = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            match self.get_gpu_metrics(device.gpu).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(vendor = %device.gpu.vendor, index = device.gpu.index, "GPU telemetry failed: {}", e);
                    reports.push(GpuReport {
                        vendor: device.gpu.vendor,
                        index: device.gpu.index,
                        name: device.name.clone(),
                        memory_total_mb: 0,
                        memory_free_mb: 0,
                        memory_used_mb: 0,
                        power_draw_w: None,
                        utilization_pct: None,
                        temperature_c: None,
                    });
                }
            }
        }
        Ok(reports)
    }
}

/// GPU monitor that keeps the latest snapshot of a backend-specific source
pub struct GpuMonitor {
    inner: Arc<dyn GpuMonitorTrait>,
    config: GpuMonitorConfig,
    snapshot: Arc<RwLock<Vec<GpuReport>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GpuMonitor {
    /// Create a new GPU monitor and take a first snapshot
    pub async fn new(config: GpuMonitorConfig) -> Result<Self> {
        info!("Creating GPU monitor for backend: {}", config.backend);

        config.validate().map_err(GpuError::Configuration)?;

        let inner: Arc<dyn GpuMonitorTrait> = match config.backend {
            GpuBackend::System => Arc::new(SystemGpuMonitor::new(&config).await?),
            GpuBackend::Mock => Arc::new(crate::mock::MockGpuMonitor::new(config.mock_gpu_count)),
        };

        let monitor = Self::with_source(config, inner);
        monitor.refresh().await?;
        Ok(monitor)
    }

    /// Wrap an existing source
    pub fn with_source(config: GpuMonitorConfig, inner: Arc<dyn GpuMonitorTrait>) -> Self {
        Self {
            inner,
            config,
            snapshot: Arc::new(RwLock::new(Vec::new())),
            task: Mutex::new(None),
        }
    }

    /// Replace the snapshot with fresh readings
    pub async fn refresh(&self) -> Result<usize> {
        let reports = self.inner.get_all_metrics().await?;
        let count = reports.len();
        *self.snapshot.write().await = reports;
        Ok(count)
    }

    /// Latest readings
    pub async fn snapshot(&self) -> Vec<GpuReport> {
        self.snapshot.read().await.clone()
    }

    /// Resolve a device reference against the latest snapshot
    pub async fn find(&self, gpu: GpuRef) -> Option<GpuReport> {
        self.snapshot
            .read()
            .await
            .iter()
            .find(|g| g.gpu_ref() == gpu)
            .cloned()
    }

    /// Start the periodic refresh loop; a second call is a no-op
    pub async fn start_background_monitoring(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        info!("Starting background GPU monitoring every {:?}", self.config.polling_interval);

        let inner = Arc::clone(&self.inner);
        let snapshot = Arc::clone(&self.snapshot);
        let period = self.config.polling_interval;

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match inner.get_all_metrics().await {
                    Ok(reports) => {
                        debug!("Refreshed {} GPU readings", reports.len());
                        *snapshot.write().await = reports;
                    }
                    Err(e) => warn!("GPU refresh failed: {}", e),
                }
            }
        }));
    }

    /// Stop the periodic refresh loop
    pub async fn stop_background_monitoring(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            info!("Stopping background GPU monitoring");
            handle.abort();
        }
    }

    pub fn config(&self) -> &GpuMonitorConfig {
        &self.config
    }
}

impl Drop for GpuMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
