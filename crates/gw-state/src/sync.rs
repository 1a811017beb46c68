//! Backend synchronization
//!
//! Each pass fetches a worker's `{gpus, models, instances}` snapshot and
//! reconciles the store against it. Passes for one backend never overlap;
//! passes for different backends run independently.

use crate::config::SyncConfig;
use crate::store::{GpuDelta, Store};
use crate::{Result, StateError};
use dashmap::DashMap;
use futures::future::join_all;
use gw_core::WorkerApi;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one pass over one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub backend: String,
    pub available: bool,
    pub became_available: bool,
    pub became_unavailable: bool,
    pub gpus: GpuDelta,
    pub instances_seen: usize,
    pub instances_removed: usize,
}

/// Synchronization metrics
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub passes: AtomicU64,
    pub failures: AtomicU64,
    pub announcements: AtomicU64,
}

/// Keeps the store in line with the worker fleet
#[derive(Clone)]
pub struct Synchronizer {
    store: Store,
    worker: Arc<dyn WorkerApi>,
    config: SyncConfig,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    running: Arc<RwLock<bool>>,
    metrics: Arc<SyncMetrics>,
}

impl Synchronizer {
    pub fn new(store: Store, worker: Arc<dyn WorkerApi>, config: SyncConfig) -> Self {
        Self {
            store,
            worker,
            config,
            locks: Arc::new(DashMap::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
            metrics: Arc::new(SyncMetrics::default()),
        }
    }

    fn lock_for(&self, backend: &str) -> Arc<Mutex<()>> {
        self.locks.entry(backend.to_string()).or_default().clone()
    }

    /// Run one reconciliation pass for `backend`.
    ///
    /// An unreachable worker is not an error: the backend is marked
    /// unavailable and, if it was available, its instances are dropped.
    pub async fn sync_backend(&self, backend: &str) -> Result<SyncReport> {
        let lock = self.lock_for(backend);
        let _guard = lock.lock().await;

        let base_url = self
            .store
            .backend(backend)
            .ok_or_else(|| StateError::UnknownBackend(backend.to_string()))?
            .base_url;

        self.metrics.passes.fetch_add(1, Ordering::Relaxed);
        let observed_at = Instant::now();

        let snapshot = match self.worker.snapshot(&base_url).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %backend, "Sync failed: {}", e);

                let was_available = self.store.mark_backend_unavailable(backend);
                let instances_removed = if was_available {
                    let removed = self.store.remove_backend_instances(backend);
                    warn!(
                        backend = %backend,
                        "Backend became unavailable, dropped {} instance(s)", removed
                    );
                    removed
                } else {
                    0
                };

                return Ok(SyncReport {
                    backend: backend.to_string(),
                    available: false,
                    became_unavailable: was_available,
                    instances_removed,
                    ..SyncReport::default()
                });
            }
        };

        let advertised: BTreeSet<String> = snapshot
            .models
            .iter()
            .map(|m| m.model.name.clone())
            .collect();
        let ready: BTreeSet<String> = snapshot
            .models
            .iter()
            .filter(|m| m.ready)
            .map(|m| m.model.name.clone())
            .collect();

        let gpus = self.store.reconcile_gpus(backend, &snapshot.gpus);

        let mut keep = HashSet::new();
        for report in &snapshot.instances {
            if self.store.model(&report.model).is_none() {
                debug!(
                    backend = %backend,
                    instance = %report.name,
                    "Ignoring instance of unconfigured model {}", report.model
                );
                continue;
            }
            keep.insert(self.store.upsert_instance_by_port(backend, report, observed_at));
        }
        let instances_removed = self
            .store
            .remove_instances_except(backend, &keep, observed_at, self.config.launch_grace);

        let was_available = self.store.mark_backend_seen(backend, advertised, ready)?;
        if !was_available {
            info!(backend = %backend, "Backend available");
            self.announce(backend, &base_url).await;
        }

        debug!(
            backend = %backend,
            gpus_created = gpus.created,
            gpus_updated = gpus.updated,
            gpus_removed = gpus.removed,
            instances = keep.len(),
            instances_removed,
            "Sync pass complete"
        );

        Ok(SyncReport {
            backend: backend.to_string(),
            available: true,
            became_available: !was_available,
            became_unavailable: false,
            gpus,
            instances_seen: keep.len(),
            instances_removed,
        })
    }

    /// Push the model catalog to a backend that just came up
    async fn announce(&self, backend: &str, base_url: &url::Url) {
        let models = self.store.models();
        match self.worker.announce_models(base_url, &models).await {
            Ok(()) => {
                self.metrics.announcements.fetch_add(1, Ordering::Relaxed);
                info!(backend = %backend, "Announced {} model(s)", models.len());
            }
            Err(e) => warn!(backend = %backend, "Failed to announce models: {}", e),
        }
    }

    /// One pass over every backend, concurrently
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let names: Vec<String> = self.store.backends().into_iter().map(|b| b.name).collect();
        let passes = names.iter().map(|name| self.sync_backend(name));
        join_all(passes)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(report) => Some(report),
                Err(e) => {
                    error!("Sync pass failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Start one interval task per registered backend
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        info!(
            "Starting synchronizer with {:?} interval",
            self.config.update_interval
        );

        let mut tasks = self.tasks.lock().await;
        for backend in self.store.backends() {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(this.config.update_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately; startup already synced
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    if !*this.running.read().await {
                        break;
                    }
                    if let Err(e) = this.sync_backend(&backend.name).await {
                        error!(backend = %backend.name, "Sync pass failed: {}", e);
                    }
                }
            }));
        }
    }

    /// Stop every interval task
    pub async fn stop(&self) {
        *self.running.write().await = false;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Synchronizer stopped");
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}
