//! Instance lifecycle: launch, readiness polling and teardown

use crate::{GatewayError, Result};
use gw_core::{GpuSelector, InstanceId, InstanceState, LaunchRequest, Model, WorkerApi};
use gw_state::{Gpu, Instance, Store};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

/// Drives instances through `Launching → Running → Loaded` on worker hosts.
///
/// The manager is the only writer of an instance's state and port. It never
/// retries on its own; callers decide whether to try again.
#[derive(Clone)]
pub struct LifecycleManager {
    store: Store,
    worker: Arc<dyn WorkerApi>,
    poll_interval: Duration,
    names: Arc<Mutex<NameState>>,
}

#[derive(Default)]
struct NameState {
    second: u64,
    count: u32,
}

/// Marks the instance `Failed` if dropped while armed, which is what happens
/// when the future driving a launch is cancelled mid-request
struct LaunchGuard<'a> {
    store: &'a Store,
    id: InstanceId,
    armed: bool,
}

impl<'a> LaunchGuard<'a> {
    fn new(store: &'a Store, id: InstanceId) -> Self {
        Self {
            store,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(id = %self.id, "Launch abandoned before the worker answered");
            self.store.set_instance_state(self.id, InstanceState::Failed);
        }
    }
}

impl LifecycleManager {
    pub fn new(store: Store, worker: Arc<dyn WorkerApi>, poll_interval: Duration) -> Self {
        Self {
            store,
            worker,
            poll_interval,
            names: Arc::new(Mutex::new(NameState::default())),
        }
    }

    /// `{model}-{unix_seconds}`, suffixed when several share a second
    fn instance_name(&self, model: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if names.second == now {
            names.count += 1;
        } else {
            names.second = now;
            names.count = 0;
        }

        match names.count {
            0 => format!("{}-{}", model, now),
            n => format!("{}-{}-{}", model, now, n),
        }
    }

    fn backend_url(&self, backend: &str) -> Result<Url> {
        self.store
            .backend(backend)
            .map(|b| b.base_url)
            .ok_or_else(|| GatewayError::NoAvailableBackend(backend.to_string()))
    }

    /// Record a new instance on `backend` and launch it there
    pub async fn create(&self, backend: &str, model: &Model, gpus: &[Gpu]) -> Result<InstanceId> {
        let name = self.instance_name(&model.name);
        let gpu_refs = gpus.iter().map(Gpu::gpu_ref).collect();
        let id = self.store.insert_instance(backend, model, &name, gpu_refs);

        info!(backend = %backend, instance = %name, gpus = gpus.len(), "Creating instance");
        self.launch(id).await?;
        Ok(id)
    }

    /// POST the launch request for an existing record
    async fn launch(&self, id: InstanceId) -> Result<()> {
        let instance = self
            .store
            .instance(id)
            .ok_or_else(|| GatewayError::LaunchFailure(format!("instance {} vanished", id)))?;
        let base_url = self.backend_url(&instance.backend)?;

        self.store.set_instance_state(id, InstanceState::Launching);
        let guard = LaunchGuard::new(&self.store, id);

        // An empty list asks the worker for a CPU-only engine
        let request = LaunchRequest {
            name: instance.name.clone(),
            model: instance.model.clone(),
            gpus: Some(instance.gpus.iter().copied().map(GpuSelector::from).collect()),
        };

        let report = match self.worker.launch_instance(&base_url, &request).await {
            Ok(report) if report.port != 0 => report,
            Ok(_) => {
                guard.disarm();
                self.store.set_instance_state(id, InstanceState::Failed);
                warn!(instance = %instance.name, "Worker accepted launch without a port");
                return Err(GatewayError::LaunchFailure(format!(
                    "{}: no port assigned",
                    instance.name
                )));
            }
            Err(e) => {
                guard.disarm();
                self.store.set_instance_state(id, InstanceState::Failed);
                warn!(instance = %instance.name, error = %e, "Launch rejected");
                return Err(GatewayError::LaunchFailure(format!("{}: {}", instance.name, e)));
            }
        };

        self.store.set_instance_port(id, report.port);
        self.store.set_instance_state(id, InstanceState::Running);
        guard.disarm();
        info!(instance = %instance.name, port = report.port, "Instance running");
        Ok(())
    }

    /// Poll the worker until the instance reports loaded or `timeout` elapses
    pub async fn wait_loaded(&self, id: InstanceId, timeout: Duration) -> bool {
        let poll_ms = self.poll_interval.as_millis().max(1);
        let iterations = timeout.as_millis().div_ceil(poll_ms).max(1);

        for attempt in 0..iterations {
            let Some(instance) = self.store.instance(id) else {
                return false;
            };
            match instance.state {
                InstanceState::Loaded => return true,
                InstanceState::Failed | InstanceState::Terminated => return false,
                _ => {}
            }

            let Some(backend) = self.store.backend(&instance.backend) else {
                return false;
            };

            match self.worker.instance_status(&backend.base_url, &instance.name).await {
                Ok(report) if report.loaded => {
                    self.store.set_instance_state(id, InstanceState::Loaded);
                    info!(instance = %instance.name, polls = attempt + 1, "Instance loaded");
                    return true;
                }
                Ok(report) if !report.running => {
                    self.store.set_instance_state(id, InstanceState::Uninitialized);
                    warn!(instance = %instance.name, "Instance exited while loading");
                    return false;
                }
                Ok(_) => {}
                Err(e) if e.is_transport() => {
                    debug!(instance = %instance.name, error = %e, "Status poll failed")
                }
                Err(e) => {
                    self.store.set_instance_state(id, InstanceState::Failed);
                    warn!(instance = %instance.name, error = %e, "Worker no longer reports instance");
                    return false;
                }
            }

            if attempt + 1 < iterations {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        warn!(%id, ?timeout, "Instance did not load in time");
        false
    }

    /// Make sure an existing instance can take requests, relaunching it if
    /// its process exited
    pub async fn ensure_loaded(&self, id: InstanceId, timeout: Duration) -> bool {
        let Some(instance) = self.store.instance(id) else {
            return false;
        };
        let available = self
            .store
            .backend(&instance.backend)
            .is_some_and(|b| b.available);

        if !available || instance.state.is_terminal() {
            return false;
        }

        match instance.state {
            InstanceState::Loaded => true,
            InstanceState::Uninitialized => {
                info!(instance = %instance.name, "Relaunching instance");
                if self.launch(id).await.is_err() {
                    return false;
                }
                self.wait_loaded(id, timeout).await
            }
            _ => self.wait_loaded(id, timeout).await,
        }
    }

    /// Stop an instance on its worker and forget it locally
    pub async fn shutdown(&self, id: InstanceId) -> Option<Instance> {
        let instance = self.store.instance(id)?;
        self.store.set_instance_state(id, InstanceState::Terminated);

        match self.backend_url(&instance.backend) {
            Ok(base_url) => {
                if let Err(e) = self.worker.terminate_instance(&base_url, &instance.name).await {
                    warn!(instance = %instance.name, error = %e, "Terminate failed");
                }
            }
            Err(e) => warn!(instance = %instance.name, error = %e, "Terminate skipped"),
        }

        info!(instance = %instance.name, "Instance shut down");
        self.store.remove_instance(id)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::{GpuReport, GpuVendor, MockHost, MockWorker};
    use gw_state::{SyncConfig, Synchronizer};

    fn gpu(index: u32, free: u64) -> GpuReport {
        GpuReport {
            vendor: GpuVendor::Nvidia,
            index,
            name: format!("GPU {}", index),
            memory_total_mb: 24576,
            memory_free_mb: free,
            memory_used_mb: 24576 - free,
            power_draw_w: None,
            utilization_pct: None,
            temperature_c: None,
        }
    }

    async fn setup(host: MockHost) -> (Store, MockWorker, LifecycleManager, Url) {
        let store = Store::new();
        let model = Model::new("m1").with_slots(2).with_memory_mb(1000);
        store.upsert_model(model);
        let url = Url::parse("http://worker-a:4567").unwrap();
        store.upsert_backend("a", url.clone());

        let worker = MockWorker::new();
        worker.add_host(&url, host).await;

        let sync = Synchronizer::new(store.clone(), Arc::new(worker.clone()), SyncConfig::default());
        sync.sync_backend("a").await.unwrap();

        let manager = LifecycleManager::new(
            store.clone(),
            Arc::new(worker.clone()),
            Duration::from_millis(5),
        );
        (store, worker, manager, url)
    }

    fn host() -> MockHost {
        MockHost::new(vec![Model::new("m1").with_slots(2)]).with_gpus(vec![gpu(0, 20000)])
    }

    #[tokio::test]
    async fn test_create_records_port_and_running() {
        let (store, worker, manager, url) = setup(host()).await;
        let model = store.model("m1").unwrap();
        let gpus = store.gpus_for("a");

        let id = manager.create("a", &model, &gpus).await.unwrap();
        let instance = store.instance(id).unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.port, Some(8080));
        assert_eq!(instance.gpus, vec![gpus[0].gpu_ref()]);
        assert!(instance.name.starts_with("m1-"));

        let host = worker.host(&url).await.unwrap();
        assert_eq!(host.launches, 1);
        assert!(host.instances.contains_key(&instance.name));
    }

    #[tokio::test]
    async fn test_rejected_launch_marks_failed() {
        let mut host = host();
        host.reject_launch = true;
        let (store, _worker, manager, _url) = setup(host).await;
        let model = store.model("m1").unwrap();

        let result = manager.create("a", &model, &[]).await;
        assert!(matches!(result, Err(GatewayError::LaunchFailure(_))));

        let instances = store.instances_for("a", "m1");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Failed);
        assert!(!manager.wait_loaded(instances[0].id, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_loaded_polls_until_loaded() {
        let mut host = host();
        host.load_after_polls = 3;
        let (store, _worker, manager, _url) = setup(host).await;
        let model = store.model("m1").unwrap();

        let id = manager.create("a", &model, &[]).await.unwrap();
        assert!(manager.wait_loaded(id, Duration::from_secs(1)).await);
        assert_eq!(store.instance(id).unwrap().state, InstanceState::Loaded);

        // already loaded: no further I/O needed
        assert!(manager.wait_loaded(id, Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_loaded_times_out() {
        let mut host = host();
        host.load_after_polls = 1000;
        let (store, _worker, manager, _url) = setup(host).await;
        let model = store.model("m1").unwrap();

        let id = manager.create("a", &model, &[]).await.unwrap();
        assert!(!manager.wait_loaded(id, Duration::from_millis(30)).await);
        assert_eq!(store.instance(id).unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_cancelled_launch_marks_failed() {
        let mut host = host();
        host.launch_delay = Duration::from_secs(5);
        let (store, _worker, manager, _url) = setup(host).await;
        let model = store.model("m1").unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(20), manager.create("a", &model, &[])).await;
        assert!(result.is_err());

        let instances = store.instances_for("a", "m1");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Failed);
        assert_eq!(instances[0].port, None);
    }

    #[tokio::test]
    async fn test_instance_unknown_to_worker_fails_fast() {
        let mut host = host();
        host.load_after_polls = 1000;
        let (store, worker, manager, url) = setup(host).await;
        let model = store.model("m1").unwrap();

        let id = manager.create("a", &model, &[]).await.unwrap();
        let name = store.instance(id).unwrap().name;
        worker
            .update_host(&url, |h| {
                h.instances.remove(&name);
            })
            .await;

        let started = std::time::Instant::now();
        assert!(!manager.wait_loaded(id, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.instance(id).unwrap().state, InstanceState::Failed);
    }

    #[tokio::test]
    async fn test_cpu_only_plan_launches_without_gpus() {
        let (store, worker, manager, url) = setup(host()).await;
        let model = Model::new("m1").with_slots(2).with_memory_mb(0);
        store.upsert_model(model.clone());

        let gpus = gw_state::PlacementPlanner::new(store.clone())
            .plan("a", &model)
            .unwrap();
        assert!(gpus.is_empty());

        let id = manager.create("a", &model, &gpus).await.unwrap();
        let name = store.instance(id).unwrap().name;
        let host = worker.host(&url).await.unwrap();
        assert!(!host.gpus.is_empty());
        assert!(host.instances[&name].gpus.is_empty());
    }

    #[tokio::test]
    async fn test_wait_loaded_missing_instance() {
        let (_store, _worker, manager, _url) = setup(host()).await;
        assert!(!manager.wait_loaded(InstanceId::new(999), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_ensure_loaded_paths() {
        let (store, worker, manager, url) = setup(host()).await;
        let model = store.model("m1").unwrap();
        let timeout = Duration::from_millis(100);

        let id = manager.create("a", &model, &[]).await.unwrap();
        assert!(manager.ensure_loaded(id, timeout).await);

        // Loaded and available answers without talking to the worker
        worker.update_host(&url, |h| h.reachable = false).await;
        assert!(manager.ensure_loaded(id, timeout).await);

        // process exited: relaunched under the same name
        worker.update_host(&url, |h| h.reachable = true).await;
        store.set_instance_state(id, InstanceState::Uninitialized);
        assert!(manager.ensure_loaded(id, timeout).await);
        assert_eq!(worker.host(&url).await.unwrap().launches, 2);
        assert_eq!(store.instance(id).unwrap().state, InstanceState::Loaded);

        store.mark_backend_unavailable("a");
        assert!(!manager.ensure_loaded(id, timeout).await);
    }

    #[tokio::test]
    async fn test_ensure_loaded_terminal_state() {
        let (store, _worker, manager, _url) = setup(host()).await;
        let model = store.model("m1").unwrap();
        let id = manager.create("a", &model, &[]).await.unwrap();

        store.set_instance_state(id, InstanceState::Failed);
        assert!(!manager.ensure_loaded(id, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_shutdown_removes_record() {
        let (store, worker, manager, url) = setup(host()).await;
        let model = store.model("m1").unwrap();
        let id = manager.create("a", &model, &[]).await.unwrap();

        let removed = manager.shutdown(id).await.unwrap();
        assert_eq!(removed.state, InstanceState::Terminated);
        assert!(store.instance(id).is_none());
        assert!(worker.host(&url).await.unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_with_unreachable_worker() {
        let (store, worker, manager, url) = setup(host()).await;
        let model = store.model("m1").unwrap();
        let id = manager.create("a", &model, &[]).await.unwrap();

        worker.update_host(&url, |h| h.reachable = false).await;
        assert!(manager.shutdown(id).await.is_some());
        assert!(store.instance(id).is_none());
    }

    #[test]
    fn test_instance_names_unique_within_second() {
        let store = Store::new();
        let manager =
            LifecycleManager::new(store, Arc::new(MockWorker::new()), Duration::from_secs(1));
        let names: std::collections::HashSet<String> =
            (0..5).map(|_| manager.instance_name("m1")).collect();
        assert_eq!(names.len(), 5);
    }
}
