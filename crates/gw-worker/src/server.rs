//! Worker control API

use crate::catalog::ModelCatalog;
use crate::instances::{InstanceManager, LaunchOutcome};
use crate::{Result, WorkerError};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use gw_adapter_gpu::GpuMonitor;
use gw_core::{LaunchRequest, Model, WorkerSnapshot};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// HTTP server exposing GPUs, the model catalog and instances
#[derive(Clone)]
pub struct WorkerServer {
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    gpus: Arc<GpuMonitor>,
    catalog: Arc<ModelCatalog>,
    instances: Arc<InstanceManager>,
}

impl WorkerServer {
    pub fn new(gpus: Arc<GpuMonitor>, catalog: Arc<ModelCatalog>, instances: Arc<InstanceManager>) -> Self {
        Self {
            state: AppState {
                gpus,
                catalog,
                instances,
            },
        }
    }

    /// Serve on `listener` until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Starting worker API on {}", addr);
        }

        if let Err(e) = axum::serve(listener, self.create_router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Worker API error: {}", e);
            return Err(WorkerError::Server(format!("HTTP server failed: {}", e)));
        }
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(snapshot))
            .route("/gpus", get(list_gpus))
            .route("/models", get(list_models).post(replace_models))
            .route("/instances", get(list_instances).post(launch_instance))
            .route("/instances/:name", get(instance_status).delete(terminate_instance))
            .route("/instances/:name/logs", get(instance_logs))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state.clone())
    }
}

async fn snapshot(State(state): State<AppState>) -> Json<WorkerSnapshot> {
    Json(WorkerSnapshot {
        gpus: state.gpus.snapshot().await,
        models: state.catalog.reports().await,
        instances: state.instances.list().await,
    })
}

async fn list_gpus(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gpus.snapshot().await)
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.reports().await)
}

async fn replace_models(
    State(state): State<AppState>,
    Json(models): Json<Vec<Model>>,
) -> impl IntoResponse {
    state.catalog.replace(models).await;
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Model initialization started" })),
    )
}

async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.instances.list().await)
}

async fn launch_instance(
    State(state): State<AppState>,
    Json(request): Json<LaunchRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state.instances.launch(&request).await?;
    let response = match outcome {
        LaunchOutcome::Created(report) => (StatusCode::CREATED, Json(report)),
        LaunchOutcome::Existing(report) => (StatusCode::OK, Json(report)),
    };
    Ok(response)
}

async fn instance_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.instances.status(&name).await?))
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let lines = state.instances.logs(&name).await?;
    Ok(Json(json!({ "lines": lines })))
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    state.instances.terminate(&name).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::instances::tests::{catalog_with, mock_gpus, model, write_engine, SERVING_ENGINE};
    use gw_adapter_runtime::EngineConfig;
    use gw_core::{InstanceReport, ModelReport};
    use serde_json::Value;
    use std::time::Duration;

    struct TestApp {
        base: String,
        client: reqwest::Client,
        instances: Arc<InstanceManager>,
        _dir: tempfile::TempDir,
    }

    async fn spawn_app(ports: PortRange) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_engine(dir.path(), "engine.sh", SERVING_ENGINE);
        std::fs::write(dir.path().join("m1.gguf"), b"weights").unwrap();

        let gpus = mock_gpus(2).await;
        let catalog = catalog_with(dir.path(), vec![model("m1")]).await;
        let instances = Arc::new(
            InstanceManager::with_engine(
                EngineConfig {
                    binary: engine,
                    model_dir: dir.path().to_path_buf(),
                    bind: "127.0.0.1".to_string(),
                    gpu_layers: 99,
                },
                ports,
                catalog.clone(),
                gpus.clone(),
            )
            .with_process_limits(Duration::from_secs(2), 50),
        );
        let server = WorkerServer::new(gpus, catalog, instances.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            server.serve(listener, std::future::pending()).await.unwrap();
        });

        TestApp {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            instances,
            _dir: dir,
        }
    }

    impl TestApp {
        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let response = self
                .client
                .get(format!("{}{}", self.base, path))
                .send()
                .await
                .unwrap();
            let status = response.status();
            (status, response.json().await.unwrap_or(Value::Null))
        }

        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let response = self
                .client
                .post(format!("{}{}", self.base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = response.status();
            (status, response.json().await.unwrap_or(Value::Null))
        }

        async fn delete(&self, path: &str) -> (StatusCode, Value) {
            let response = self
                .client
                .delete(format!("{}{}", self.base, path))
                .send()
                .await
                .unwrap();
            let status = response.status();
            (status, response.json().await.unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_snapshot_and_gpus() {
        let app = spawn_app(PortRange::new(18200, 18209)).await;

        let (status, body) = app.get("/").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: WorkerSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.gpus.len(), 2);
        assert_eq!(snapshot.models.len(), 1);
        assert!(snapshot.models[0].ready);
        assert!(snapshot.instances.is_empty());

        let (status, gpus) = app.get("/gpus").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gpus[1]["index"], 1);
        assert_eq!(gpus[1]["vendor"], "nvidia");
    }

    #[tokio::test]
    async fn test_replace_models() {
        let app = spawn_app(PortRange::new(18210, 18219)).await;

        let (status, body) = app
            .post(
                "/models",
                serde_json::json!([
                    {"name": "m2", "slots": 4, "context_length": 2048, "files": ["m2.gguf"]},
                    {"name": "m1", "files": ["m1.gguf"]}
                ]),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "Model initialization started");

        let (_, body) = app.get("/models").await;
        let models: Vec<ModelReport> = serde_json::from_value(body).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model.name, "m1");
        assert_eq!(models[1].model.slots_per_instance, 4);
        // m2.gguf is absent and has no url
        assert!(!models[1].ready);
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let app = spawn_app(PortRange::new(18220, 18229)).await;

        let (status, body) = app
            .post("/instances", serde_json::json!({"name": "m1-1", "model": "m1", "gpus": [0]}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let report: InstanceReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.port, 18220);
        assert_eq!(report.gpus.len(), 1);

        let (status, body) = app
            .post("/instances", serde_json::json!({"name": "m1-1", "model": "m1"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["port"], 18220);

        let mut loaded = false;
        for _ in 0..100 {
            let (status, body) = app.get("/instances/m1-1").await;
            assert_eq!(status, StatusCode::OK);
            if body["loaded"] == true {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(loaded);

        let (_, list) = app.get("/instances").await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, logs) = app.get("/instances/m1-1/logs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(logs["lines"][0].as_str().unwrap().starts_with("loading"));

        let (status, body) = app.delete("/instances/m1-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");

        let (status, body) = app.get("/instances/m1-1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
        assert_eq!(app.instances.ports_in_use().await, 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = spawn_app(PortRange::new(18230, 18230)).await;

        let (status, body) = app
            .post("/instances", serde_json::json!({"name": "x-1", "model": "nope"}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));

        let (status, _) = app
            .post("/instances", serde_json::json!({"name": "m1-1", "model": "m1", "gpus": [9]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .post("/instances", serde_json::json!({"name": "m1-1", "model": "m1"}))
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = app
            .post("/instances", serde_json::json!({"name": "m1-2", "model": "m1"}))
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "No available ports");

        let (status, _) = app.delete("/instances/ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.get("/instances/ghost/logs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.instances.stop_all().await;
    }
}
