//! HTTP implementation of the worker control API

use crate::{Result, StateError};
use async_trait::async_trait;
use gw_core::{ErrorBody, InstanceReport, LaunchRequest, Model, WorkerApi, WorkerSnapshot};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Talks to `gw-worker` hosts over HTTP
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StateError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// `base` with `segments` appended as path segments
fn endpoint(base: &Url, segments: &[&str]) -> gw_core::Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| gw_core::Error::config(format!("Worker URL cannot be a base: {}", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn transport_error(url: &Url, e: reqwest::Error) -> gw_core::Error {
    if e.is_timeout() {
        gw_core::Error::timeout(format!("{}: {}", url, e))
    } else {
        gw_core::Error::transport(format!("{}: {}", url, e))
    }
}

/// Turn a non-success response into `Rejected`, keeping the worker's message
async fn check(response: Response) -> gw_core::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or_else(|_| if text.is_empty() { status.to_string() } else { text });
    Err(gw_core::Error::rejected(status.as_u16(), message))
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn snapshot(&self, base_url: &Url) -> gw_core::Result<WorkerSnapshot> {
        let url = endpoint(base_url, &[])?;
        debug!("Fetching worker snapshot from {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| gw_core::Error::transport(format!("Invalid snapshot from {}: {}", url, e)))
    }

    async fn announce_models(&self, base_url: &Url, models: &[Model]) -> gw_core::Result<()> {
        let url = endpoint(base_url, &["models"])?;
        debug!("Announcing {} models to {}", models.len(), url);

        let response = self
            .client
            .post(url.clone())
            .json(models)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check(response).await?;
        Ok(())
    }

    async fn launch_instance(
        &self,
        base_url: &Url,
        request: &LaunchRequest,
    ) -> gw_core::Result<InstanceReport> {
        let url = endpoint(base_url, &["instances"])?;
        debug!("Launching {} on {}", request.name, url);

        let response = self
            .client
            .post(url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        let response = check(response).await?;
        response.json().await.map_err(|e| {
            gw_core::Error::transport(format!("Invalid launch response from {}: {}", url, e))
        })
    }

    async fn instance_status(&self, base_url: &Url, name: &str) -> gw_core::Result<InstanceReport> {
        let url = endpoint(base_url, &["instances", name])?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        let response = check(response).await?;
        response.json().await.map_err(|e| {
            gw_core::Error::transport(format!("Invalid instance status from {}: {}", url, e))
        })
    }

    async fn terminate_instance(&self, base_url: &Url, name: &str) -> gw_core::Result<()> {
        let url = endpoint(base_url, &["instances", name])?;
        debug!("Terminating {} on {}", name, base_url);

        let response = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use gw_core::{GpuReport, GpuVendor, ModelReport};

    fn instance(name: &str) -> InstanceReport {
        InstanceReport {
            name: name.to_string(),
            model: "m1".to_string(),
            slots_in_use: 0,
            slots_capacity: 2,
            port: 8080,
            bind: "0.0.0.0".to_string(),
            running: true,
            loaded: true,
            command: vec!["./server".to_string()],
            gpus: vec![],
        }
    }

    async fn serve_worker() -> Url {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    Json(WorkerSnapshot {
                        gpus: vec![GpuReport {
                            vendor: GpuVendor::Nvidia,
                            index: 0,
                            name: "RTX".to_string(),
                            memory_total_mb: 24576,
                            memory_free_mb: 20000,
                            memory_used_mb: 4576,
                            power_draw_w: None,
                            utilization_pct: None,
                            temperature_c: None,
                        }],
                        models: vec![ModelReport {
                            model: Model::new("m1"),
                            ready: true,
                        }],
                        instances: vec![instance("m1-1")],
                    })
                }),
            )
            .route(
                "/models",
                post(|Json(models): Json<Vec<Model>>| async move {
                    assert_eq!(models.len(), 1);
                    StatusCode::ACCEPTED
                }),
            )
            .route(
                "/instances",
                post(|Json(request): Json<LaunchRequest>| async move {
                    if request.model == "m1" {
                        Ok((StatusCode::CREATED, Json(instance(&request.name))))
                    } else {
                        Err((StatusCode::NOT_FOUND, Json(ErrorBody::new("model not found"))))
                    }
                }),
            )
            .route(
                "/instances/:name",
                get(|Path(name): Path<String>| async move {
                    if name == "m1-1" {
                        Ok(Json(instance(&name)))
                    } else {
                        Err(StatusCode::NOT_FOUND)
                    }
                })
                .delete(|Path(_name): Path<String>| async { Json(serde_json::json!({"status": "stopped"})) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    fn client() -> HttpWorkerClient {
        HttpWorkerClient::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_appends_segments() {
        let base = Url::parse("http://worker-a:4567").unwrap();
        assert_eq!(endpoint(&base, &[]).unwrap().as_str(), "http://worker-a:4567/");
        assert_eq!(
            endpoint(&base, &["instances", "m1 1"]).unwrap().as_str(),
            "http://worker-a:4567/instances/m1%201"
        );

        let nested = Url::parse("http://proxy/worker-a/").unwrap();
        assert_eq!(
            endpoint(&nested, &["models"]).unwrap().as_str(),
            "http://proxy/worker-a/models"
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let base = serve_worker().await;
        let snapshot = client().snapshot(&base).await.unwrap();
        assert_eq!(snapshot.gpus.len(), 1);
        assert_eq!(snapshot.models[0].model.name, "m1");
        assert_eq!(snapshot.instances[0].port, 8080);
    }

    #[tokio::test]
    async fn test_launch_status_and_terminate() {
        let base = serve_worker().await;
        let client = client();

        client.announce_models(&base, &[Model::new("m1")]).await.unwrap();

        let request = LaunchRequest {
            name: "m1-2".to_string(),
            model: "m1".to_string(),
            gpus: None,
        };
        let report = client.launch_instance(&base, &request).await.unwrap();
        assert_eq!(report.name, "m1-2");

        assert!(client.instance_status(&base, "m1-1").await.unwrap().loaded);
        client.terminate_instance(&base, "m1-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_keeps_status_and_message() {
        let base = serve_worker().await;
        let request = LaunchRequest {
            name: "x-1".to_string(),
            model: "unknown".to_string(),
            gpus: None,
        };
        match client().launch_instance(&base, &request).await {
            Err(gw_core::Error::Rejected { status, message }) => {
                assert_eq!(status, 404);
                assert_eq!(message, "model not found");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let result = client().instance_status(&base, "missing").await;
        assert!(matches!(result, Err(gw_core::Error::Rejected { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let base = Url::parse(&format!("http://{}", addr)).unwrap();
        let error = client().snapshot(&base).await.unwrap_err();
        assert!(error.is_transport());
    }
}
