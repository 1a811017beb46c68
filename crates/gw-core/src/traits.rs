//! Core traits for gateway components
//!
//! [`WorkerApi`] is the control surface the gateway uses to talk to worker
//! hosts. The HTTP implementation lives in `gw-state`; [`MockWorker`] is an
//! in-memory fleet used by tests and local development.

use crate::api::{GpuReport, GpuSelector, InstanceReport, LaunchRequest, ModelReport, WorkerSnapshot};
use crate::types::Model;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

/// Remote control of a worker host
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Fetch the `{gpus, models, instances}` snapshot
    async fn snapshot(&self, base_url: &Url) -> Result<WorkerSnapshot>;

    /// Push the model catalog so the worker can prepare artifacts
    async fn announce_models(&self, base_url: &Url, models: &[Model]) -> Result<()>;

    /// Start an engine process; the returned report carries its port
    async fn launch_instance(&self, base_url: &Url, request: &LaunchRequest) -> Result<InstanceReport>;

    /// Current status of one instance
    async fn instance_status(&self, base_url: &Url, name: &str) -> Result<InstanceReport>;

    /// Stop an instance and forget it
    async fn terminate_instance(&self, base_url: &Url, name: &str) -> Result<()>;
}

/// Mock implementations for testing and development

/// One simulated worker host
#[derive(Debug, Clone)]
pub struct MockHost {
    pub reachable: bool,
    pub gpus: Vec<GpuReport>,
    pub models: Vec<ModelReport>,
    pub instances: BTreeMap<String, InstanceReport>,
    /// Status polls an instance answers with `loaded=false` before loading
    pub load_after_polls: u32,
    /// Launches answer 500 while set
    pub reject_launch: bool,
    /// How long a launch takes to answer
    pub launch_delay: Duration,
    pub launches: u32,
    pub announcements: u32,
    next_port: u16,
    port_pool: VecDeque<u16>,
    polls: HashMap<String, u32>,
}

impl MockHost {
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            reachable: true,
            gpus: Vec::new(),
            models: models
                .into_iter()
                .map(|model| ModelReport { model, ready: true })
                .collect(),
            instances: BTreeMap::new(),
            load_after_polls: 0,
            reject_launch: false,
            launch_delay: Duration::ZERO,
            launches: 0,
            announcements: 0,
            next_port: 8080,
            port_pool: VecDeque::new(),
            polls: HashMap::new(),
        }
    }

    pub fn with_gpus(mut self, gpus: Vec<GpuReport>) -> Self {
        self.gpus = gpus;
        self
    }

    /// Hand out these ports first, in order, before counting up from 8080
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.port_pool.extend(ports);
        self
    }

    fn allocate_port(&mut self) -> u16 {
        if let Some(port) = self.port_pool.pop_front() {
            return port;
        }
        let port = self.next_port;
        self.next_port += 1;
        port
    }
}

/// In-memory fleet of worker hosts keyed by base URL
#[derive(Clone, Default)]
pub struct MockWorker {
    hosts: Arc<Mutex<HashMap<String, MockHost>>>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host(&self, base_url: &Url, host: MockHost) {
        self.hosts.lock().await.insert(key(base_url), host);
    }

    /// Mutate a host in place
    pub async fn update_host<F>(&self, base_url: &Url, f: F)
    where
        F: FnOnce(&mut MockHost),
    {
        if let Some(host) = self.hosts.lock().await.get_mut(&key(base_url)) {
            f(host);
        }
    }

    /// Copy of a host's current state
    pub async fn host(&self, base_url: &Url) -> Option<MockHost> {
        self.hosts.lock().await.get(&key(base_url)).cloned()
    }
}

fn key(base_url: &Url) -> String {
    base_url.as_str().trim_end_matches('/').to_string()
}

fn unreachable(base_url: &Url) -> Error {
    Error::transport(format!("connection refused: {}", base_url))
}

#[async_trait]
impl WorkerApi for MockWorker {
    async fn snapshot(&self, base_url: &Url) -> Result<WorkerSnapshot> {
        let hosts = self.hosts.lock().await;
        let host = hosts
            .get(&key(base_url))
            .filter(|h| h.reachable)
            .ok_or_else(|| unreachable(base_url))?;

        Ok(WorkerSnapshot {
            gpus: host.gpus.clone(),
            models: host.models.clone(),
            instances: host.instances.values().cloned().collect(),
        })
    }

    async fn announce_models(&self, base_url: &Url, _models: &[Model]) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        let host = hosts
            .get_mut(&key(base_url))
            .filter(|h| h.reachable)
            .ok_or_else(|| unreachable(base_url))?;
        host.announcements += 1;
        Ok(())
    }

    async fn launch_instance(&self, base_url: &Url, request: &LaunchRequest) -> Result<InstanceReport> {
        let delay = self
            .hosts
            .lock()
            .await
            .get(&key(base_url))
            .map(|h| h.launch_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut hosts = self.hosts.lock().await;
        let host = hosts
            .get_mut(&key(base_url))
            .filter(|h| h.reachable)
            .ok_or_else(|| unreachable(base_url))?;

        host.launches += 1;
        if host.reject_launch {
            return Err(Error::rejected(500, "failed to start instance"));
        }

        let model = host
            .models
            .iter()
            .find(|m| m.model.name == request.model)
            .map(|m| m.model.clone())
            .ok_or_else(|| Error::rejected(404, format!("model not found: {}", request.model)))?;

        let gpus = match &request.gpus {
            None => host.gpus.iter().map(|g| g.gpu_ref()).collect(),
            Some(selectors) => selectors
                .iter()
                .filter_map(|selector| match selector {
                    GpuSelector::Device(gpu) => Some(*gpu),
                    GpuSelector::Index(index) => host
                        .gpus
                        .iter()
                        .find(|g| g.index == *index)
                        .map(|g| g.gpu_ref()),
                })
                .collect(),
        };

        let port = host.allocate_port();

        let report = InstanceReport {
            name: request.name.clone(),
            model: model.name.clone(),
            slots_in_use: 0,
            slots_capacity: model.slots_per_instance,
            port,
            bind: "127.0.0.1".to_string(),
            running: true,
            loaded: host.load_after_polls == 0,
            command: vec!["mock-engine".to_string()],
            gpus,
        };
        host.polls.insert(request.name.clone(), 0);
        host.instances.insert(request.name.clone(), report.clone());
        Ok(report)
    }

    async fn instance_status(&self, base_url: &Url, name: &str) -> Result<InstanceReport> {
        let mut hosts = self.hosts.lock().await;
        let host = hosts
            .get_mut(&key(base_url))
            .filter(|h| h.reachable)
            .ok_or_else(|| unreachable(base_url))?;

        let polls = host.polls.entry(name.to_string()).or_insert(0);
        *polls += 1;
        let loaded_now = *polls >= host.load_after_polls;

        let report = host
            .instances
            .get_mut(name)
            .ok_or_else(|| Error::rejected(404, format!("instance not found: {}", name)))?;
        if report.running && loaded_now {
            report.loaded = true;
        }
        Ok(report.clone())
    }

    async fn terminate_instance(&self, base_url: &Url, name: &str) -> Result<()> {
        let mut hosts = self.hosts.lock().await;
        let host = hosts
            .get_mut(&key(base_url))
            .filter(|h| h.reachable)
            .ok_or_else(|| unreachable(base_url))?;

        host.polls.remove(name);
        host.instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::rejected(404, format!("instance not found: {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://worker-a:4567").unwrap()
    }

    #[tokio::test]
    async fn test_mock_worker_launch_and_poll() {
        let worker = MockWorker::new();
        let mut host = MockHost::new(vec![Model::new("m1").with_slots(2)]);
        host.load_after_polls = 2;
        worker.add_host(&url(), host).await;

        let request = LaunchRequest {
            name: "m1-1".to_string(),
            model: "m1".to_string(),
            gpus: Some(vec![]),
        };
        let report = worker.launch_instance(&url(), &request).await.unwrap();
        assert_eq!(report.port, 8080);
        assert_eq!(report.slots_capacity, 2);
        assert!(!report.loaded);

        assert!(!worker.instance_status(&url(), "m1-1").await.unwrap().loaded);
        assert!(worker.instance_status(&url(), "m1-1").await.unwrap().loaded);

        worker.terminate_instance(&url(), "m1-1").await.unwrap();
        assert!(worker.instance_status(&url(), "m1-1").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_worker_ports_and_gpu_defaults() {
        let worker = MockWorker::new();
        let gpu = GpuReport {
            vendor: crate::GpuVendor::Nvidia,
            index: 0,
            name: "GPU 0".to_string(),
            memory_total_mb: 8192,
            memory_free_mb: 8192,
            memory_used_mb: 0,
            power_draw_w: None,
            utilization_pct: None,
            temperature_c: None,
        };
        let host = MockHost::new(vec![Model::new("m1")])
            .with_gpus(vec![gpu])
            .with_ports([9100]);
        worker.add_host(&url(), host).await;

        let all = LaunchRequest {
            name: "m1-1".to_string(),
            model: "m1".to_string(),
            gpus: None,
        };
        let report = worker.launch_instance(&url(), &all).await.unwrap();
        assert_eq!(report.port, 9100);
        assert_eq!(report.gpus.len(), 1);

        let none = LaunchRequest {
            name: "m1-2".to_string(),
            gpus: Some(vec![]),
            ..all
        };
        let report = worker.launch_instance(&url(), &none).await.unwrap();
        assert_eq!(report.port, 8080);
        assert!(report.gpus.is_empty());
    }

    #[tokio::test]
    async fn test_mock_worker_unreachable() {
        let worker = MockWorker::new();
        worker.add_host(&url(), MockHost::new(vec![])).await;
        worker.update_host(&url(), |h| h.reachable = false).await;

        let err = worker.snapshot(&url()).await.unwrap_err();
        assert!(err.is_transport());

        let unknown = Url::parse("http://nowhere:1").unwrap();
        assert!(worker.snapshot(&unknown).await.is_err());
    }
}
