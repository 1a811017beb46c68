//! Engine instances supervised on this host

use crate::catalog::ModelCatalog;
use crate::config::{PortRange, WorkerConfig};
use crate::ports::PortAllocator;
use crate::{Result, WorkerError};
use gw_adapter_gpu::{visibility_env, GpuMonitor};
use gw_adapter_runtime::{EngineConfig, ProcessSupervisor};
use gw_core::{GpuRef, GpuSelector, InstanceReport, LaunchRequest, Model};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One engine process and what it was launched with
struct ManagedInstance {
    model: Model,
    port: u16,
    gpus: Vec<GpuRef>,
    supervisor: ProcessSupervisor,
}

impl ManagedInstance {
    fn report(&self, name: &str, bind: &str) -> InstanceReport {
        let status = self.supervisor.status();
        InstanceReport {
            name: name.to_string(),
            model: self.model.name.clone(),
            // slots are accounted by the gateway
            slots_in_use: 0,
            slots_capacity: self.model.slots_per_instance,
            port: self.port,
            bind: bind.to_string(),
            running: status.running,
            loaded: status.loaded,
            command: status.command,
            gpus: self.gpus.clone(),
        }
    }
}

struct InstanceTable {
    instances: BTreeMap<String, ManagedInstance>,
    ports: PortAllocator,
}

/// Result of `POST /instances`
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    /// A new engine was spawned
    Created(InstanceReport),
    /// The name was already known; a stopped engine was started again
    Existing(InstanceReport),
}

impl LaunchOutcome {
    pub fn report(&self) -> &InstanceReport {
        match self {
            LaunchOutcome::Created(report) | LaunchOutcome::Existing(report) => report,
        }
    }
}

/// Owns every engine process on this host, keyed by instance name
pub struct InstanceManager {
    engine: EngineConfig,
    catalog: Arc<ModelCatalog>,
    gpus: Arc<GpuMonitor>,
    shutdown_timeout: Duration,
    log_lines: usize,
    table: Mutex<InstanceTable>,
}

impl InstanceManager {
    pub fn new(config: &WorkerConfig, catalog: Arc<ModelCatalog>, gpus: Arc<GpuMonitor>) -> Self {
        Self::with_engine(
            config.engine_config(),
            config.port_range,
            catalog,
            gpus,
        )
        .with_process_limits(config.shutdown_timeout(), config.log_lines)
    }

    pub fn with_engine(
        engine: EngineConfig,
        ports: PortRange,
        catalog: Arc<ModelCatalog>,
        gpus: Arc<GpuMonitor>,
    ) -> Self {
        Self {
            engine,
            catalog,
            gpus,
            shutdown_timeout: Duration::from_secs(10),
            log_lines: gw_adapter_runtime::DEFAULT_LOG_LINES,
            table: Mutex::new(InstanceTable {
                instances: BTreeMap::new(),
                ports: PortAllocator::new(ports),
            }),
        }
    }

    pub fn with_process_limits(mut self, shutdown_timeout: Duration, log_lines: usize) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self.log_lines = log_lines;
        self
    }

    /// Start an engine for `request`.
    ///
    /// A known name is never launched twice: a running instance reports its
    /// status and a stopped one is restarted on the same port.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutcome> {
        let mut table = self.table.lock().await;

        if let Some(existing) = table.instances.get_mut(&request.name) {
            if !existing.supervisor.is_running() {
                info!(instance = %request.name, "Restarting stopped instance");
                existing.supervisor.restart().await.map_err(|e| {
                    WorkerError::Launch(format!("{}: {}", request.name, e))
                })?;
            }
            return Ok(LaunchOutcome::Existing(
                existing.report(&request.name, &self.engine.bind),
            ));
        }

        let model = self
            .catalog
            .get(&request.model)
            .await
            .ok_or_else(|| WorkerError::ModelNotFound(request.model.clone()))?;
        let gpus = self.resolve_gpus(request.gpus.as_deref()).await?;
        let port = table.ports.allocate().ok_or(WorkerError::NoFreePort)?;

        let mut engine = self.engine.clone();
        if gpus.is_empty() {
            engine.gpu_layers = 0;
        }
        let process = match engine.process_config(&request.name, &model, port, visibility_env(&gpus)) {
            Ok(process) => process
                .with_shutdown_timeout(self.shutdown_timeout)
                .with_log_lines(self.log_lines),
            Err(e) => {
                table.ports.release(port);
                return Err(WorkerError::Launch(format!("{}: {}", request.name, e)));
            }
        };

        let mut supervisor = ProcessSupervisor::new(process);
        if let Err(e) = supervisor.start().await {
            table.ports.release(port);
            warn!(instance = %request.name, error = %e, "Engine failed to start");
            return Err(WorkerError::Launch(format!("{}: {}", request.name, e)));
        }

        info!(
            instance = %request.name,
            model = %model.name,
            port,
            gpus = gpus.len(),
            "Instance started"
        );

        let instance = ManagedInstance {
            model,
            port,
            gpus,
            supervisor,
        };
        let report = instance.report(&request.name, &self.engine.bind);
        table.instances.insert(request.name.clone(), instance);
        Ok(LaunchOutcome::Created(report))
    }

    /// Turn selectors into devices of the latest GPU snapshot.
    ///
    /// An index selects by enumeration order. `None` means every GPU and an
    /// empty list means a CPU-only engine.
    async fn resolve_gpus(&self, selectors: Option<&[GpuSelector]>) -> Result<Vec<GpuRef>> {
        let snapshot = self.gpus.snapshot().await;
        let Some(selectors) = selectors else {
            return Ok(snapshot.iter().map(|g| g.gpu_ref()).collect());
        };

        let mut resolved: Vec<GpuRef> = Vec::with_capacity(selectors.len());
        for selector in selectors {
            let gpu = match selector {
                GpuSelector::Index(index) => usize::try_from(*index)
                    .ok()
                    .and_then(|i| snapshot.get(i))
                    .map(|g| g.gpu_ref())
                    .ok_or_else(|| WorkerError::InvalidGpu(format!("no GPU with index {}", index)))?,
                GpuSelector::Device(gpu) => snapshot
                    .iter()
                    .map(|g| g.gpu_ref())
                    .find(|g| g == gpu)
                    .ok_or_else(|| {
                        WorkerError::InvalidGpu(format!("no {} GPU with index {}", gpu.vendor, gpu.index))
                    })?,
            };
            if !resolved.contains(&gpu) {
                resolved.push(gpu);
            }
        }
        Ok(resolved)
    }

    pub async fn status(&self, name: &str) -> Result<InstanceReport> {
        let table = self.table.lock().await;
        table
            .instances
            .get(name)
            .map(|i| i.report(name, &self.engine.bind))
            .ok_or_else(|| WorkerError::InstanceNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<InstanceReport> {
        let table = self.table.lock().await;
        table
            .instances
            .iter()
            .map(|(name, i)| i.report(name, &self.engine.bind))
            .collect()
    }

    pub async fn logs(&self, name: &str) -> Result<Vec<String>> {
        let table = self.table.lock().await;
        let instance = table
            .instances
            .get(name)
            .ok_or_else(|| WorkerError::InstanceNotFound(name.to_string()))?;
        Ok(instance.supervisor.logs().await)
    }

    /// Stop an instance and forget it. Its port is reused only after the
    /// process has exited.
    pub async fn terminate(&self, name: &str) -> Result<()> {
        let instance = self
            .table
            .lock()
            .await
            .instances
            .remove(name)
            .ok_or_else(|| WorkerError::InstanceNotFound(name.to_string()))?;

        self.stop_and_release(name, instance).await;
        Ok(())
    }

    /// Stop every instance
    pub async fn stop_all(&self) {
        let instances = std::mem::take(&mut self.table.lock().await.instances);
        if !instances.is_empty() {
            info!("Stopping {} instances", instances.len());
        }
        for (name, instance) in instances {
            self.stop_and_release(&name, instance).await;
        }
    }

    async fn stop_and_release(&self, name: &str, mut instance: ManagedInstance) {
        if let Err(e) = instance.supervisor.stop().await {
            warn!(instance = %name, error = %e, "Failed to stop instance cleanly");
        }
        self.table.lock().await.ports.release(instance.port);
        info!(instance = %name, port = instance.port, "Instance stopped");
    }

    pub async fn ports_in_use(&self) -> usize {
        self.table.lock().await.ports.in_use()
    }
}
