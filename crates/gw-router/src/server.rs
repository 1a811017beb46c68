//! Gateway HTTP server

use crate::config::GatewayConfig;
use crate::handler::{RequestContext, RequestHandler};
use crate::router::RouterStats;
use crate::{GatewayError, Result};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use gw_core::ErrorBody;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

/// HTTP server for the gateway API
#[derive(Clone)]
pub struct HttpServer {
    config: GatewayConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<RouterStats>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    handler: Arc<RequestHandler>,
    stats: Arc<RouterStats>,
}

impl HttpServer {
    pub fn new(config: GatewayConfig, handler: Arc<RequestHandler>, stats: Arc<RouterStats>) -> Self {
        Self {
            config,
            handler,
            stats,
        }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Server(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Serve on `listener` until `shutdown` completes
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Starting HTTP server on {}", addr);
        }

        if let Err(e) = axum::serve(listener, self.create_router())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
            return Err(GatewayError::Server(format!("HTTP server failed: {}", e)));
        }
        Ok(())
    }

    /// Create the Axum router with all routes
    pub fn create_router(&self) -> AxumRouter {
        let state = AppState {
            handler: self.handler.clone(),
            stats: self.stats.clone(),
        };

        let mut router = AxumRouter::new()
            .route("/health", get(health_check))
            .route("/stats", get(stats_handler))
            .route("/models", get(list_models))
            .route("/v1/models", get(list_models))
            // forward routes are configurable, so every other path lands here
            .fallback(forward)
            .layer(DefaultBodyLimit::max(self.config.max_request_size))
            .with_state(state);

        router = router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        if self.config.enable_compression {
            router = router.layer(CompressionLayer::new());
        }

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }
}

// HTTP Handler functions

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.handler.store().stats();
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.stats.uptime_seconds(),
        "backends": store.backends,
        "available_backends": store.available_backends,
    }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "requests_total": state.stats.total_requests(),
        "responses_total": state.stats.total_responses(),
        "errors_total": state.stats.total_errors(),
        "uptime_seconds": state.stats.uptime_seconds(),
        "store": state.handler.store().stats(),
    }))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handler.list_models())
}

async fn forward(State(state): State<AppState>, method: Method, uri: Uri, body: Bytes) -> Response {
    if method != Method::POST {
        return (StatusCode::NOT_FOUND, Json(ErrorBody::new("Not found"))).into_response();
    }

    state.stats.increment_requests();
    let context = RequestContext::new(uri.path());

    match state.handler.route(&context, &body).await {
        Ok(response) => {
            state.stats.increment_responses();
            response
        }
        Err(e) => {
            state.stats.increment_errors();
            error!(request_id = %context.request_id, path = %context.path, "Request failed: {}", e);
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::config::GatewayConfigBuilder;
    use crate::lifecycle::LifecycleManager;
    use crate::proxy::UpstreamProxy;
    use gw_core::{InstanceState, MockWorker, Model};
    use gw_state::Store;
    use serde_json::Value;
    use std::time::Duration;
    use url::Url;

    struct TestApp {
        base: String,
        store: Store,
        stats: Arc<RouterStats>,
    }

    async fn spawn_app() -> TestApp {
        let config = GatewayConfigBuilder::new()
            .model(Model::new("llama").with_slots(2))
            .model(Model::new("mistral"))
            .build();

        let store = Store::new();
        for model in &config.models {
            store.upsert_model(model.clone());
        }

        let lifecycle = LifecycleManager::new(
            store.clone(),
            Arc::new(MockWorker::new()),
            Duration::from_millis(5),
        );
        let admission = AdmissionController::new(store.clone(), lifecycle, Duration::from_millis(50));
        let proxy = UpstreamProxy::new(Duration::from_secs(1)).unwrap();
        let handler = Arc::new(RequestHandler::new(
            store.clone(),
            admission,
            proxy,
            config.forward_routes.clone(),
        ));
        let stats = Arc::new(RouterStats::default());
        let server = HttpServer::new(config, handler, stats.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            server.serve(listener, std::future::pending()).await.unwrap();
        });

        TestApp {
            base: format!("http://{}", addr),
            store,
            stats,
        }
    }

    /// An engine that echoes the request body back
    async fn spawn_engine() -> u16 {
        let app = AxumRouter::new().route(
            "/v1/chat/completions",
            axum::routing::post(|Json(body): Json<Value>| async move { Json(body) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn post(url: String, body: &str) -> (StatusCode, Value) {
        let response = reqwest::Client::new()
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let app = spawn_app().await;

        let health: Value = reqwest::get(format!("{}/health", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert!(health["timestamp"].is_string());

        let stats: Value = reqwest::get(format!("{}/stats", app.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["requests_total"], 0);
        assert_eq!(stats["store"]["models"], 2);
    }

    #[tokio::test]
    async fn test_model_listing_on_both_paths() {
        let app = spawn_app().await;

        for path in ["/models", "/v1/models"] {
            let list: Value = reqwest::get(format!("{}{}", app.base, path))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(list["object"], "list");
            assert_eq!(list["data"][0]["id"], "llama");
            assert_eq!(list["data"][1]["id"], "mistral");
        }
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = spawn_app().await;

        let (status, body) = post(format!("{}/v1/images/generations", app.base), "{}").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(body["error"].is_string());

        let (status, _) = post(format!("{}/completion", app.base), "[]").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(format!("{}/completion", app.base), r#"{"model":"gpt-4"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Model not found");

        let (status, _) = post(format!("{}/completion", app.base), r#"{"model":"llama"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let response = reqwest::get(format!("{}/nowhere", app.base)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(app.stats.total_requests(), 4);
        assert_eq!(app.stats.total_errors(), 4);
    }

    #[tokio::test]
    async fn test_forward_to_loaded_instance() {
        let app = spawn_app().await;
        let engine_port = spawn_engine().await;

        app.store
            .upsert_backend("local", Url::parse("http://127.0.0.1:4567").unwrap());
        app.store
            .mark_backend_seen(
                "local",
                ["llama".to_string()].into_iter().collect(),
                ["llama".to_string()].into_iter().collect(),
            )
            .unwrap();
        let model = app.store.model("llama").unwrap();
        let id = app.store.insert_instance("local", &model, "llama-1", vec![]);
        app.store.set_instance_port(id, engine_port);
        app.store.set_instance_state(id, InstanceState::Loaded);

        let (status, body) = post(
            format!("{}/v1/chat/completions", app.base),
            r#"{"model":"1","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id_slot"], 0);
        assert_eq!(body["messages"][0]["content"], "hi");

        assert_eq!(app.store.instance(id).unwrap().slots_in_use(), 0);
        assert_eq!(app.stats.total_responses(), 1);
    }
}
