//! Slot admission
//!
//! A request gets exactly one slot on one loaded instance, held by a
//! [`SlotLease`] until the lease is released or dropped.

use crate::lifecycle::LifecycleManager;
use crate::{GatewayError, Result};
use gw_core::{InstanceId, InstanceState, Model};
use gw_state::{Backend, PlacementPlanner, SlotClaim, Store};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// An occupied slot. Dropping the lease frees the slot.
pub struct SlotLease {
    store: Store,
    claim: SlotClaim,
    backend: String,
    instance: String,
    upstream: Url,
    released: bool,
}

impl SlotLease {
    pub(crate) fn new(
        store: Store,
        claim: SlotClaim,
        backend: impl Into<String>,
        instance: impl Into<String>,
        upstream: Url,
    ) -> Self {
        Self {
            store,
            claim,
            backend: backend.into(),
            instance: instance.into(),
            upstream,
            released: false,
        }
    }

    pub fn slot_number(&self) -> u32 {
        self.claim.slot_number
    }

    pub fn instance_id(&self) -> InstanceId {
        self.claim.instance_id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// `http://<backend host>:<instance port>/`
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Free the slot now. Returns false if it had already been freed or
    /// taken over, which leaves the store untouched.
    pub fn release(mut self) -> bool {
        self.release_once()
    }

    fn release_once(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let freed = self.store.release_slot(&self.claim);
        debug!(
            instance = %self.instance,
            slot = self.claim.slot_number,
            freed,
            "Released slot"
        );
        freed
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("backend", &self.backend)
            .field("instance", &self.instance)
            .field("slot", &self.claim.slot_number)
            .field("upstream", &self.upstream.as_str())
            .field("released", &self.released)
            .finish()
    }
}

/// Engine endpoint for an instance listening on `port` of `backend`'s host
fn upstream_url(backend: &Backend, port: u16) -> Result<Url> {
    let host = backend.host().ok_or_else(|| {
        GatewayError::Unavailable(format!("backend {} has no host", backend.name))
    })?;
    Url::parse(&format!("http://{}:{}/", host, port))
        .map_err(|e| GatewayError::Unavailable(format!("bad upstream for {}: {}", backend.name, e)))
}

/// Fresh instances launched per request before giving up, when concurrent
/// requests keep taking the new slot first
const LAUNCH_ATTEMPTS: usize = 3;

/// Hands out slots, launching instances when every slot is taken
#[derive(Clone)]
pub struct AdmissionController {
    store: Store,
    lifecycle: LifecycleManager,
    planner: PlacementPlanner,
    instance_timeout: Duration,
}

impl AdmissionController {
    pub fn new(store: Store, lifecycle: LifecycleManager, instance_timeout: Duration) -> Self {
        let planner = PlacementPlanner::new(store.clone());
        Self {
            store,
            lifecycle,
            planner,
            instance_timeout,
        }
    }

    /// Claim a slot for `model` on the first available backend advertising it
    pub async fn acquire(&self, model_name: &str) -> Result<SlotLease> {
        let model = self
            .store
            .model(model_name)
            .ok_or_else(|| GatewayError::NotFound("Model not found".to_string()))?;

        let backend = self
            .store
            .backends()
            .into_iter()
            .find(|b| b.available && b.advertises(&model.name))
            .ok_or_else(|| GatewayError::NoAvailableBackend(model.name.clone()))?;

        for _ in 0..LAUNCH_ATTEMPTS {
            if let Some(lease) = self.claim_existing(&backend, &model).await? {
                return Ok(lease);
            }

            debug!(backend = %backend.name, model = %model.name, "No free slot, launching instance");
            let gpus = self.planner.plan(&backend.name, &model)?;
            let id = self.lifecycle.create(&backend.name, &model, &gpus).await?;

            if !self.lifecycle.wait_loaded(id, self.instance_timeout).await {
                warn!(backend = %backend.name, model = %model.name, "New instance did not load");
                return Err(GatewayError::LaunchFailure(format!(
                    "{} did not load within {:?}",
                    model.name, self.instance_timeout
                )));
            }

            if let Some(claim) = self.store.claim_slot(id) {
                return self.lease(&backend, claim);
            }
            debug!(backend = %backend.name, model = %model.name, "New instance filled by concurrent requests");
        }

        Err(GatewayError::Unavailable(format!("no free slot for {}", model.name)))
    }

    /// Claim a slot on an instance that already exists, relaunching or
    /// waiting on it when needed
    async fn claim_existing(&self, backend: &Backend, model: &Model) -> Result<Option<SlotLease>> {
        for instance in self.store.instances_for(&backend.name, &model.name) {
            // no port means another request is still launching it
            if instance.port.is_none() || instance.state.is_terminal() {
                continue;
            }
            if instance.state == InstanceState::Loaded && !instance.has_free_slot() {
                continue;
            }
            if !self.lifecycle.ensure_loaded(instance.id, self.instance_timeout).await {
                continue;
            }
            if let Some(claim) = self.store.claim_slot(instance.id) {
                return self.lease(backend, claim).map(Some);
            }
        }
        Ok(None)
    }

    fn lease(&self, backend: &Backend, claim: SlotClaim) -> Result<SlotLease> {
        let instance = self.store.instance(claim.instance_id);
        let (name, port) = match instance.as_ref().and_then(|i| i.port.map(|p| (i, p))) {
            Some((instance, port)) => (instance.name.clone(), port),
            None => {
                self.store.release_slot(&claim);
                return Err(GatewayError::Unavailable(format!(
                    "instance {} has no port",
                    claim.instance_id
                )));
            }
        };

        let upstream = match upstream_url(backend, port) {
            Ok(url) => url,
            Err(e) => {
                self.store.release_slot(&claim);
                return Err(e);
            }
        };

        info!(
            backend = %backend.name,
            instance = %name,
            slot = claim.slot_number,
            "Acquired slot"
        );
        Ok(SlotLease::new(
            self.store.clone(),
            claim,
            backend.name.clone(),
            name,
            upstream,
        ))
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }
}
