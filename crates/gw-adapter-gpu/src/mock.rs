//! Mock GPU monitor for development and testing

use crate::monitor::GpuMonitorTrait;
use crate::{GpuError, Result};

use async_trait::async_trait;
use gw_core::{GpuRef, GpuReport, GpuVendor};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Mock GPU monitor reporting static NVIDIA devices
pub struct MockGpuMonitor {
    gpus: Arc<RwLock<Vec<GpuReport>>>,
}

impl MockGpuMonitor {
    /// Create `count` devices with 24 GB each, 1 GB in use
    pub fn new(count: u32) -> Self {
        let gpus = (0..count).map(create_mock_gpu).collect();
        Self::with_gpus(gpus)
    }

    /// Report exactly these devices
    pub fn with_gpus(gpus: Vec<GpuReport>) -> Self {
        Self {
            gpus: Arc::new(RwLock::new(gpus)),
        }
    }

    /// Change the free memory a device reports
    pub async fn set_free_memory(&self, index: u32, free_mb: u64) {
        let mut gpus = self.gpus.write().await;
        if let Some(gpu) = gpus.iter_mut().find(|g| g.index == index) {
            gpu.memory_free_mb = free_mb;
            gpu.memory_used_mb = gpu.memory_total_mb.saturating_sub(free_mb);
        }
    }
}

#[async_trait]
impl GpuMonitorTrait for MockGpuMonitor {
    async fn discover_gpus(&self) -> Result<Vec<GpuRef>> {
        let gpus = self.gpus.read().await;
        let refs: Vec<GpuRef> = gpus.iter().map(GpuReport::gpu_ref).collect();
        debug!("Discovered {} mock GPUs", refs.len());
        Ok(refs)
    }

    async fn get_gpu_metrics(&self, gpu: GpuRef) -> Result<GpuReport> {
        self.gpus
            .read()
            .await
            .iter()
            .find(|g| g.gpu_ref() == gpu)
            .cloned()
            .ok_or_else(|| GpuError::GpuNotFound(format!("{} #{}", gpu.vendor, gpu.index)))
    }

    async fn get_all_metrics(&self) -> Result<Vec<GpuReport>> {
        Ok(self.gpus.read().await.clone())
    }
}

/// Create one mock device
pub fn create_mock_gpu(index: u32) -> GpuReport {
    GpuReport {
        vendor: GpuVendor::Nvidia,
        index,
        name: format!("Mock GPU {}", index),
        memory_total_mb: 24576,
        memory_free_mb: 23552,
        memory_used_mb: 1024,
        power_draw_w: Some(30.0 + f64::from(index) * 5.0),
        utilization_pct: Some(0.0),
        temperature_c: Some(40.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gpu_discovery() {
        let monitor = MockGpuMonitor::new(2);
        let gpus = monitor.discover_gpus().await.unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].index, 1);
    }

    #[tokio::test]
    async fn test_mock_gpu_metrics() {
        let monitor = MockGpuMonitor::new(1);
        let gpu = GpuRef {
            vendor: GpuVendor::Nvidia,
            index: 0,
        };
        let report = monitor.get_gpu_metrics(gpu).await.unwrap();
        assert_eq!(report.name, "Mock GPU 0");
        assert_eq!(report.memory_free_mb, 23552);

        monitor.set_free_memory(0, 100).await;
        let report = monitor.get_gpu_metrics(gpu).await.unwrap();
        assert_eq!(report.memory_free_mb, 100);
        assert_eq!(report.memory_used_mb, 24476);
    }

    #[tokio::test]
    async fn test_mock_gpu_not_found() {
        let monitor = MockGpuMonitor::new(1);
        let result = monitor
            .get_gpu_metrics(GpuRef {
                vendor: GpuVendor::Amd,
                index: 0,
            })
            .await;
        assert!(matches!(result, Err(GpuError::GpuNotFound(_))));
    }
}
