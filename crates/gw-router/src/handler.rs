//! Request handling and routing logic

use crate::admission::AdmissionController;
use crate::proxy::UpstreamProxy;
use crate::{GatewayError, Result};
use axum::response::Response;
use bytes::Bytes;
use gw_core::Model;
use gw_state::Store;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request context for tracking and tracing
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID
    pub request_id: String,

    /// Request path
    pub path: String,

    /// Request timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            path: path.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// One entry of the OpenAI-style model list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    /// Some backend has the model's artifacts
    pub ready: bool,
    pub loaded_instances: usize,
}

/// Body of `GET /models`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

/// Find a model by exact name, falling back to a 1-based position in the
/// name-sorted catalog when `identifier` is a number.
///
/// The numeric form is fragile: adding a model shifts every position after
/// it. Clients should send names.
pub fn resolve_model(store: &Store, identifier: &str) -> Option<Model> {
    if let Some(model) = store.model(identifier) {
        return Some(model);
    }
    let position: usize = identifier.trim().parse().ok()?;
    let index = position.checked_sub(1)?;
    store.models().into_iter().nth(index)
}

/// Validates inbound requests and hands them to admission and the proxy
#[derive(Clone)]
pub struct RequestHandler {
    store: Store,
    admission: AdmissionController,
    proxy: UpstreamProxy,
    forward_routes: HashSet<String>,
    started_at: i64,
}

impl RequestHandler {
    pub fn new(
        store: Store,
        admission: AdmissionController,
        proxy: UpstreamProxy,
        forward_routes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            admission,
            proxy,
            forward_routes: forward_routes.into_iter().collect(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Forward a POSTed body to an instance of the model it names
    pub async fn route(&self, context: &RequestContext, body: &Bytes) -> Result<Response> {
        if !self.forward_routes.contains(&context.path) {
            return Err(GatewayError::NotImplemented(context.path.clone()));
        }

        let body: Map<String, Value> = match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(GatewayError::BadRequest("body must be a JSON object".to_string())),
            Err(e) => return Err(GatewayError::BadRequest(format!("invalid JSON: {}", e))),
        };

        let identifier = match body.get("model") {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let model = resolve_model(&self.store, &identifier)
            .ok_or_else(|| GatewayError::NotFound("Model not found".to_string()))?;

        debug!(request_id = %context.request_id, model = %model.name, path = %context.path, "Admitting request");
        let lease = self.admission.acquire(&model.name).await.map_err(|e| {
            warn!(request_id = %context.request_id, model = %model.name, error = %e, "Admission failed");
            e
        })?;

        info!(
            request_id = %context.request_id,
            model = %model.name,
            backend = %lease.backend(),
            instance = %lease.instance_name(),
            slot = lease.slot_number(),
            "Routing request"
        );
        self.proxy.forward(lease, &context.path, body).await
    }

    pub fn list_models(&self) -> ModelList {
        let ready: HashSet<String> = self
            .store
            .backends()
            .into_iter()
            .filter(|b| b.available)
            .flat_map(|b| b.ready_models)
            .collect();

        let data = self
            .store
            .models()
            .into_iter()
            .map(|model| ModelEntry {
                ready: ready.contains(&model.name),
                loaded_instances: self.store.loaded_instance_count(&model.name),
                id: model.name,
                object: "model",
                created: self.started_at,
                owned_by: "organization",
            })
            .collect();

        ModelList {
            object: "list",
            data,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
