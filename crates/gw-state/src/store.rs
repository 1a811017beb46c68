//! In-memory registry of models, backends, GPUs and instances
//!
//! Every table is a `DashMap` behind an `Arc`, so a [`Store`] is cheap to
//! clone and is shared by the synchronizer, lifecycle manager, admission
//! controller and router. Writes follow one rule per field: backends and GPUs
//! are written by synchronization, instance state and port by the lifecycle
//! manager, slot occupancy by admission.

use crate::{Result, StateError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gw_core::{GpuRef, GpuReport, InstanceId, InstanceReport, InstanceState, Model};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// A worker host the gateway can place instances on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Backend {
    pub name: String,
    pub base_url: Url,
    pub available: bool,
    pub last_seen: Option<DateTime<Utc>>,
    /// Models the worker lists in its catalog
    pub advertised_models: BTreeSet<String>,
    /// Advertised models whose artifacts are present on the worker
    pub ready_models: BTreeSet<String>,
    /// Position in configuration order
    pub order: usize,
}

impl Backend {
    /// Host part of the base URL, used to reach instance ports
    pub fn host(&self) -> Option<&str> {
        self.base_url.host_str()
    }

    pub fn advertises(&self, model: &str) -> bool {
        self.advertised_models.contains(model)
    }
}

/// An accelerator on one backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gpu {
    pub backend: String,
    /// Position in the worker's report
    pub enumeration: usize,
    #[serde(flatten)]
    pub report: GpuReport,
}

impl Gpu {
    pub fn gpu_ref(&self) -> GpuRef {
        self.report.gpu_ref()
    }

    pub fn memory_free_mb(&self) -> u64 {
        self.report.memory_free_mb
    }
}

/// One concurrent generation slot of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub slot_number: u32,
    pub occupied: bool,
    /// Bumped on every claim
    pub generation: u64,
}

/// Proof of a successful slot claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotClaim {
    pub instance_id: InstanceId,
    pub slot_number: u32,
    pub generation: u64,
}

/// One engine process on a backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instance {
    pub id: InstanceId,
    pub backend: String,
    pub model: String,
    pub name: String,
    pub port: Option<u16>,
    pub gpus: Vec<GpuRef>,
    pub state: InstanceState,
    pub slots: Vec<Slot>,
    #[serde(skip)]
    pub updated_at: Instant,
}

impl Instance {
    pub fn slots_capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slots_in_use(&self) -> u32 {
        self.slots.iter().filter(|s| s.occupied).count() as u32
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| !s.occupied)
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}

fn empty_slots(capacity: u32) -> Vec<Slot> {
    (0..capacity)
        .map(|slot_number| Slot {
            slot_number,
            occupied: false,
            generation: 0,
        })
        .collect()
}

/// Result of replacing a backend's GPU set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GpuDelta {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Store statistics
#[derive(Debug, Default)]
pub struct StoreStats {
    pub slot_claims: AtomicU64,
    pub slot_releases: AtomicU64,
    pub stale_releases: AtomicU64,
    pub instances_created: AtomicU64,
    pub instances_removed: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`] plus table sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub models: usize,
    pub backends: usize,
    pub available_backends: usize,
    pub gpus: usize,
    pub instances: usize,
    pub slots_in_use: u64,
    pub slot_claims: u64,
    pub slot_releases: u64,
    pub stale_releases: u64,
    pub instances_created: u64,
    pub instances_removed: u64,
}

/// In-memory registry shared by every gateway component
#[derive(Debug, Clone, Default)]
pub struct Store {
    models: Arc<DashMap<String, Model>>,
    backends: Arc<DashMap<String, Backend>>,
    gpus: Arc<DashMap<(String, GpuRef), Gpu>>,
    instances: Arc<DashMap<InstanceId, Instance>>,
    next_instance_id: Arc<AtomicU64>,
    next_backend_order: Arc<AtomicUsize>,
    stats: Arc<StoreStats>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // Models

    /// Insert or replace a model by name. Returns true when it was new.
    pub fn upsert_model(&self, model: Model) -> bool {
        self.models.insert(model.name.clone(), model).is_none()
    }

    pub fn model(&self, name: &str) -> Option<Model> {
        self.models.get(name).map(|m| m.clone())
    }

    /// All models ordered by name
    pub fn models(&self) -> Vec<Model> {
        let mut models: Vec<Model> = self.models.iter().map(|m| m.value().clone()).collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    // Backends

    /// Register a backend, or update its URL if the name is known.
    /// New backends start unavailable until their first sync.
    pub fn upsert_backend(&self, name: &str, base_url: Url) -> bool {
        if let Some(mut backend) = self.backends.get_mut(name) {
            backend.base_url = base_url;
            return false;
        }
        let order = self.next_backend_order.fetch_add(1, Ordering::SeqCst);
        self.backends.insert(
            name.to_string(),
            Backend {
                name: name.to_string(),
                base_url,
                available: false,
                last_seen: None,
                advertised_models: BTreeSet::new(),
                ready_models: BTreeSet::new(),
                order,
            },
        );
        info!(backend = %name, "Registered backend");
        true
    }

    pub fn backend(&self, name: &str) -> Option<Backend> {
        self.backends.get(name).map(|b| b.clone())
    }

    /// All backends in configuration order
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.backends.iter().map(|b| b.value().clone()).collect();
        backends.sort_by_key(|b| b.order);
        backends
    }

    /// Remove a backend together with its GPUs and instances
    pub fn remove_backend(&self, name: &str) -> Option<Backend> {
        let removed = self.backends.remove(name).map(|(_, b)| b)?;
        self.retain_gpus(name, &HashSet::new());
        self.remove_backend_instances(name);
        Some(removed)
    }

    /// Mark a backend unreachable. Returns whether it was available before.
    pub fn mark_backend_unavailable(&self, name: &str) -> bool {
        match self.backends.get_mut(name) {
            Some(mut backend) => std::mem::replace(&mut backend.available, false),
            None => false,
        }
    }

    /// Record a successful sync. Returns whether it was available before.
    pub fn mark_backend_seen(
        &self,
        name: &str,
        advertised_models: BTreeSet<String>,
        ready_models: BTreeSet<String>,
    ) -> Result<bool> {
        let mut backend = self
            .backends
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownBackend(name.to_string()))?;
        backend.advertised_models = advertised_models;
        backend.ready_models = ready_models;
        backend.last_seen = Some(Utc::now());
        Ok(std::mem::replace(&mut backend.available, true))
    }

    // GPUs

    /// Replace a backend's GPU set, matching devices by vendor and index
    pub fn reconcile_gpus(&self, backend: &str, reports: &[GpuReport]) -> GpuDelta {
        let mut delta = GpuDelta::default();
        let mut keep = HashSet::new();

        for (enumeration, report) in reports.iter().enumerate() {
            let gpu = Gpu {
                backend: backend.to_string(),
                enumeration,
                report: report.clone(),
            };
            keep.insert(gpu.gpu_ref());
            match self.gpus.insert((backend.to_string(), gpu.gpu_ref()), gpu.clone()) {
                None => delta.created += 1,
                Some(previous) if previous != gpu => delta.updated += 1,
                Some(_) => {}
            }
        }

        delta.removed = self.retain_gpus(backend, &keep);
        delta
    }

    /// Delete a backend's GPUs not listed in `keep`. Returns how many went.
    pub fn retain_gpus(&self, backend: &str, keep: &HashSet<GpuRef>) -> usize {
        let before = self.gpus.len();
        self.gpus
            .retain(|(owner, gpu), _| owner != backend || keep.contains(gpu));
        before.saturating_sub(self.gpus.len())
    }

    /// A backend's GPUs in reported order
    pub fn gpus_for(&self, backend: &str) -> Vec<Gpu> {
        let mut gpus: Vec<Gpu> = self
            .gpus
            .iter()
            .filter(|g| g.backend == backend)
            .map(|g| g.value().clone())
            .collect();
        gpus.sort_by_key(|g| g.enumeration);
        gpus
    }

    // Instances

    fn allocate_instance_id(&self) -> InstanceId {
        InstanceId::new(self.next_instance_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Create a local record for an instance about to be launched
    pub fn insert_instance(
        &self,
        backend: &str,
        model: &Model,
        name: &str,
        gpus: Vec<GpuRef>,
    ) -> InstanceId {
        let id = self.allocate_instance_id();
        self.instances.insert(
            id,
            Instance {
                id,
                backend: backend.to_string(),
                model: model.name.clone(),
                name: name.to_string(),
                port: None,
                gpus,
                state: InstanceState::Launching,
                slots: empty_slots(model.slots_per_instance),
                updated_at: Instant::now(),
            },
        );
        self.stats.instances_created.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %backend, instance = %name, %id, "Inserted instance");
        id
    }

    /// Find the instance with this `(backend, model, port)` or create it.
    ///
    /// State is taken from the report's flags unless the local record changed
    /// after `observed_at`, in which case the report is older than the record.
    pub fn upsert_instance_by_port(
        &self,
        backend: &str,
        report: &InstanceReport,
        observed_at: Instant,
    ) -> InstanceId {
        let reported_state = InstanceState::from_flags(report.running, report.loaded);
        let existing = self
            .instances
            .iter()
            .find(|i| {
                i.backend == backend && i.model == report.model && i.port == Some(report.port)
            })
            .map(|i| i.id);

        if let Some(id) = existing {
            if let Some(mut instance) = self.instances.get_mut(&id) {
                if instance.updated_at <= observed_at
                    && !instance.state.is_terminal()
                    && instance.state != reported_state
                {
                    debug!(
                        backend = %backend,
                        instance = %instance.name,
                        "State {} -> {}", instance.state, reported_state
                    );
                    instance.state = reported_state;
                    instance.touch();
                }
                return id;
            }
        }

        let capacity = if report.slots_capacity > 0 {
            report.slots_capacity
        } else {
            self.model(&report.model).map_or(1, |m| m.slots_per_instance)
        };
        let id = self.allocate_instance_id();
        self.instances.insert(
            id,
            Instance {
                id,
                backend: backend.to_string(),
                model: report.model.clone(),
                name: report.name.clone(),
                port: Some(report.port),
                gpus: report.gpus.clone(),
                state: reported_state,
                slots: empty_slots(capacity),
                updated_at: Instant::now(),
            },
        );
        self.stats.instances_created.fetch_add(1, Ordering::Relaxed);
        info!(backend = %backend, instance = %report.name, port = report.port, "Discovered instance");
        id
    }

    /// Delete a backend's instances not in `keep`.
    ///
    /// Instances changed after `observed_at` are spared, and so are launches
    /// younger than `launch_grace`. A launch older than that never got an
    /// answer from its worker.
    pub fn remove_instances_except(
        &self,
        backend: &str,
        keep: &HashSet<InstanceId>,
        observed_at: Instant,
        launch_grace: Duration,
    ) -> usize {
        let before = self.instances.len();
        self.instances.retain(|id, instance| {
            instance.backend != backend
                || keep.contains(id)
                || instance.updated_at > observed_at
                || (instance.state == InstanceState::Launching
                    && instance.updated_at.elapsed() < launch_grace)
        });
        let removed = before.saturating_sub(self.instances.len());
        self.stats
            .instances_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Delete every instance of a backend, occupied slots included
    pub fn remove_backend_instances(&self, backend: &str) -> usize {
        let before = self.instances.len();
        self.instances.retain(|_, instance| instance.backend != backend);
        let removed = before.saturating_sub(self.instances.len());
        self.stats
            .instances_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn remove_instance(&self, id: InstanceId) -> Option<Instance> {
        let removed = self.instances.remove(&id).map(|(_, i)| i);
        if removed.is_some() {
            self.stats.instances_removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn instance(&self, id: InstanceId) -> Option<Instance> {
        self.instances.get(&id).map(|i| i.clone())
    }

    /// Instances of `model` on `backend`, oldest first
    pub fn instances_for(&self, backend: &str, model: &str) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .instances
            .iter()
            .filter(|i| i.backend == backend && i.model == model)
            .map(|i| i.value().clone())
            .collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// All instances, oldest first
    pub fn instances(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self.instances.iter().map(|i| i.value().clone()).collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// Number of `Loaded` instances of a model across all backends
    pub fn loaded_instance_count(&self, model: &str) -> usize {
        self.instances
            .iter()
            .filter(|i| i.model == model && i.state == InstanceState::Loaded)
            .count()
    }

    pub fn set_instance_state(&self, id: InstanceId, state: InstanceState) -> bool {
        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.state = state;
                instance.touch();
                true
            }
            None => false,
        }
    }

    pub fn set_instance_port(&self, id: InstanceId, port: u16) -> bool {
        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.port = Some(port);
                instance.touch();
                true
            }
            None => false,
        }
    }

    // Slots

    /// Occupy the lowest free slot of a loaded instance.
    ///
    /// The check and the write happen under the instance's entry lock.
    pub fn claim_slot(&self, id: InstanceId) -> Option<SlotClaim> {
        let mut instance = self.instances.get_mut(&id)?;
        if instance.state != InstanceState::Loaded {
            return None;
        }
        let slot = instance.slots.iter_mut().find(|s| !s.occupied)?;
        slot.occupied = true;
        slot.generation += 1;
        let claim = SlotClaim {
            instance_id: id,
            slot_number: slot.slot_number,
            generation: slot.generation,
        };
        self.stats.slot_claims.fetch_add(1, Ordering::Relaxed);
        Some(claim)
    }

    /// Free a claimed slot. Returns false when the claim is stale: the slot
    /// was already released, re-claimed since, or the instance is gone.
    pub fn release_slot(&self, claim: &SlotClaim) -> bool {
        let released = self
            .instances
            .get_mut(&claim.instance_id)
            .and_then(|mut instance| {
                let slot = instance
                    .slots
                    .iter_mut()
                    .find(|s| s.slot_number == claim.slot_number)?;
                if slot.occupied && slot.generation == claim.generation {
                    slot.occupied = false;
                    Some(())
                } else {
                    None
                }
            })
            .is_some();

        if released {
            self.stats.slot_releases.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.stale_releases.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    // Statistics

    pub fn stats(&self) -> StoreSummary {
        StoreSummary {
            models: self.models.len(),
            backends: self.backends.len(),
            available_backends: self.backends.iter().filter(|b| b.available).count(),
            gpus: self.gpus.len(),
            instances: self.instances.len(),
            slots_in_use: self
                .instances
                .iter()
                .map(|i| u64::from(i.slots_in_use()))
                .sum(),
            slot_claims: self.stats.slot_claims.load(Ordering::Relaxed),
            slot_releases: self.stats.slot_releases.load(Ordering::Relaxed),
            stale_releases: self.stats.stale_releases.load(Ordering::Relaxed),
            instances_created: self.stats.instances_created.load(Ordering::Relaxed),
            instances_removed: self.stats.instances_removed.load(Ordering::Relaxed),
        }
    }
}
