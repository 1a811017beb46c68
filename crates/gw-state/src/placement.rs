//! GPU selection for new instances
//!
//! Placement reads the latest synchronized GPU snapshot and reserves nothing.
//! Two launches planned from the same snapshot can pick the same devices;
//! the worker and the engine are the final judges of whether memory suffices.

use crate::store::{Gpu, Store};
use gw_core::Model;
use thiserror::Error;
use tracing::debug;

/// Reasons a model cannot be placed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Insufficient GPU memory on {backend} for {model}: need {required_mb} MB, {available_mb} MB free")]
    InsufficientResources {
        backend: String,
        model: String,
        required_mb: u64,
        available_mb: u64,
    },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
}

/// Chooses GPUs for a model on a backend
#[derive(Debug, Clone)]
pub struct PlacementPlanner {
    store: Store,
}

impl PlacementPlanner {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Pick the fewest GPUs with the most free memory that together cover
    /// the model's estimate. A model estimated at zero needs no GPU.
    pub fn plan(&self, backend: &str, model: &Model) -> Result<Vec<Gpu>, PlacementError> {
        if self.store.backend(backend).is_none() {
            return Err(PlacementError::UnknownBackend(backend.to_string()));
        }

        let gpus = self.store.gpus_for(backend);
        let selected = select_gpus(&gpus, model.estimated_memory_mb).ok_or_else(|| {
            PlacementError::InsufficientResources {
                backend: backend.to_string(),
                model: model.name.clone(),
                required_mb: model.estimated_memory_mb,
                available_mb: gpus.iter().map(Gpu::memory_free_mb).sum(),
            }
        })?;

        debug!(
            backend = %backend,
            model = %model.name,
            "Placed on {} GPU(s)", selected.len()
        );
        Ok(selected)
    }
}

/// Greedy selection by free memory, largest first.
///
/// The sort is stable so devices with equal free memory keep enumeration
/// order. Returns `None` when all devices together fall short.
pub fn select_gpus(gpus: &[Gpu], required_mb: u64) -> Option<Vec<Gpu>> {
    if required_mb == 0 {
        return Some(Vec::new());
    }

    let mut candidates: Vec<&Gpu> = gpus.iter().collect();
    candidates.sort_by(|a, b| b.memory_free_mb().cmp(&a.memory_free_mb()));

    let mut selected = Vec::new();
    let mut accumulated = 0u64;
    for gpu in candidates {
        selected.push(gpu.clone());
        accumulated = accumulated.saturating_add(gpu.memory_free_mb());
        if accumulated >= required_mb {
            return Some(selected);
        }
    }
    None
}
