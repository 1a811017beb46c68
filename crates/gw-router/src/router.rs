//! Gateway assembly and lifecycle

use crate::admission::AdmissionController;
use crate::config::{validate_config, GatewayConfig};
use crate::handler::RequestHandler;
use crate::lifecycle::LifecycleManager;
use crate::proxy::UpstreamProxy;
use crate::server::HttpServer;
use crate::{GatewayError, Result};

use gw_core::WorkerApi;
use gw_state::{HttpWorkerClient, Store, Synchronizer};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The gateway: store, synchronizer, admission and the HTTP server
pub struct Gateway {
    /// Gateway configuration
    config: GatewayConfig,

    /// Shared registry of models, backends and instances
    store: Store,

    /// Keeps the store in line with the worker hosts
    synchronizer: Synchronizer,

    /// HTTP server
    http_server: HttpServer,

    /// Gateway statistics
    stats: Arc<RouterStats>,

    /// Wakes the HTTP server for graceful shutdown
    shutdown: Arc<Notify>,

    /// Running server handle
    server_handle: RwLock<Option<JoinHandle<Result<()>>>>,
}

/// Router statistics
#[derive(Debug)]
pub struct RouterStats {
    /// Forwarding requests received
    pub requests_total: AtomicU64,

    /// Responses streamed back from an instance
    pub responses_total: AtomicU64,

    /// Requests answered with an error
    pub errors_total: AtomicU64,

    /// Gateway start time
    pub start_time: Instant,
}

impl Default for RouterStats {
    fn default() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

impl Gateway {
    /// Create a gateway that talks to worker hosts over HTTP
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = HttpWorkerClient::new(config.backend_timeout())?;
        Self::with_worker(config, Arc::new(client))
    }

    /// Create a gateway on top of any worker API implementation
    pub fn with_worker(config: GatewayConfig, worker: Arc<dyn WorkerApi>) -> Result<Self> {
        validate_config(&config).map_err(GatewayError::Configuration)?;

        info!(
            backends = config.backends.len(),
            models = config.models.len(),
            "Creating gateway"
        );

        let store = Store::new();
        for model in &config.models {
            store.upsert_model(model.clone());
        }
        for backend in &config.backends {
            store.upsert_backend(&backend.name, backend.url.clone());
        }

        let synchronizer = Synchronizer::new(store.clone(), worker.clone(), config.sync_config());
        let lifecycle = LifecycleManager::new(store.clone(), worker, config.poll_interval());
        let admission = AdmissionController::new(store.clone(), lifecycle, config.instance_timeout());
        let proxy = UpstreamProxy::new(config.backend_timeout())?;

        let handler = Arc::new(RequestHandler::new(
            store.clone(),
            admission,
            proxy,
            config.forward_routes.clone(),
        ));
        let stats = Arc::new(RouterStats::default());
        let http_server = HttpServer::new(config.clone(), handler, stats.clone());

        Ok(Self {
            config,
            store,
            synchronizer,
            http_server,
            stats,
            shutdown: Arc::new(Notify::new()),
            server_handle: RwLock::new(None),
        })
    }

    /// Sync every backend once, start the periodic sync and open the listener
    pub async fn start(&self) -> Result<SocketAddr> {
        let reports = self.synchronizer.sync_all().await;
        let available = reports.iter().filter(|r| r.available).count();
        info!("Initial sync: {}/{} backends available", available, reports.len());

        self.synchronizer.start().await;

        let listener = self.http_server.bind().await?;
        let addr = listener.local_addr()?;

        let server = self.http_server.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async move { shutdown.notified().await })
                .await
        });
        *self.server_handle.write().await = Some(handle);

        info!("Gateway listening on {}", addr);
        Ok(addr)
    }

    /// Serve and block until shutdown
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        self.wait_for_shutdown().await;
        self.shutdown().await
    }

    /// Wait for Ctrl-C or SIGTERM
    pub async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    /// Stop syncing and close the listener
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down gateway");
        self.synchronizer.stop().await;
        self.shutdown.notify_one();

        if let Some(handle) = self.server_handle.write().await.take() {
            let timeout = tokio::time::Duration::from_secs(30);
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(result)) => result?,
                Ok(Err(e)) => warn!("Server task failed: {}", e),
                Err(_) => warn!("Server did not shut down within {:?}", timeout),
            }
        }

        info!("Gateway shutdown complete");
        Ok(())
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Get uptime in seconds
    pub fn uptime(&self) -> u64 {
        self.stats.start_time.elapsed().as_secs()
    }
}

impl RouterStats {
    /// Increment request counter
    pub fn increment_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment response counter
    pub fn increment_responses(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment error counter
    pub fn increment_errors(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_responses(&self) -> u64 {
        self.responses_total.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfigBuilder;
    use gw_core::{MockHost, MockWorker, Model};
    use url::Url;

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = GatewayConfigBuilder::new().http_port(0).build();
        let result = Gateway::with_worker(config, Arc::new(MockWorker::new()));
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }

    #[test]
    fn test_store_seeded_from_config() {
        let config = GatewayConfigBuilder::new()
            .backend("a", Url::parse("http://worker-a:4567").unwrap())
            .backend("b", Url::parse("http://worker-b:4567").unwrap())
            .model(Model::new("m1"))
            .build();

        let gateway = Gateway::with_worker(config, Arc::new(MockWorker::new())).unwrap();
        let backends = gateway.store().backends();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].name, "a");
        assert!(!backends[0].available);
        assert_eq!(gateway.store().models().len(), 1);
        assert_eq!(gateway.stats().total_requests(), 0);
    }

    #[tokio::test]
    async fn test_start_syncs_before_listening() {
        let url = Url::parse("http://worker-a:4567").unwrap();
        let worker = MockWorker::new();
        worker.add_host(&url, MockHost::new(vec![Model::new("m1")])).await;

        let config = GatewayConfigBuilder::new()
            .bind_address("127.0.0.1")
            .http_port(free_port().await)
            .backend("a", url.clone())
            .model(Model::new("m1"))
            .build();
        let gateway = Gateway::with_worker(config, Arc::new(worker.clone())).unwrap();

        let addr = gateway.start().await.unwrap();
        assert!(gateway.store().backend("a").unwrap().available);
        assert_eq!(worker.host(&url).await.unwrap().announcements, 1);

        let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert!(response.status().is_success());

        gateway.shutdown().await.unwrap();
        assert!(reqwest::get(format!("http://{}/health", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_router_stats() {
        let stats = RouterStats::default();
        stats.increment_requests();
        stats.increment_requests();
        stats.increment_responses();
        stats.increment_errors();

        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.total_responses(), 1);
        assert_eq!(stats.total_errors(), 1);
    }
}
