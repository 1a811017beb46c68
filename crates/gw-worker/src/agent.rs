//! Worker agent assembly and lifecycle

use crate::catalog::ModelCatalog;
use crate::config::WorkerConfig;
use crate::fetcher::{HttpModelFetcher, ModelFetcher};
use crate::instances::InstanceManager;
use crate::server::WorkerServer;
use crate::{Result, WorkerError};

use gw_adapter_gpu::GpuMonitor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The worker agent: GPU monitor, model catalog, instances and the API server
pub struct WorkerAgent {
    config: WorkerConfig,
    gpus: Arc<GpuMonitor>,
    catalog: Arc<ModelCatalog>,
    instances: Arc<InstanceManager>,
    server: WorkerServer,
    shutdown: Arc<Notify>,
    server_handle: RwLock<Option<JoinHandle<Result<()>>>>,
}

impl WorkerAgent {
    /// Create an agent with the configured GPU source and an HTTP fetcher
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let gpus = Arc::new(GpuMonitor::new(config.gpu_monitor_config()).await?);
        let fetcher = Arc::new(HttpModelFetcher::new(Duration::from_secs(30))?);
        Self::with_parts(config, gpus, fetcher).await
    }

    /// Create an agent around an existing GPU monitor and fetcher
    pub async fn with_parts(
        config: WorkerConfig,
        gpus: Arc<GpuMonitor>,
        fetcher: Arc<dyn ModelFetcher>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.model_dir).await.map_err(|e| {
            WorkerError::Configuration(format!(
                "Cannot create model directory {}: {}",
                config.model_dir.display(),
                e
            ))
        })?;

        let catalog = Arc::new(ModelCatalog::new(config.model_dir.clone(), fetcher));
        let instances = Arc::new(InstanceManager::new(&config, catalog.clone(), gpus.clone()));
        let server = WorkerServer::new(gpus.clone(), catalog.clone(), instances.clone());

        Ok(Self {
            config,
            gpus,
            catalog,
            instances,
            server,
            shutdown: Arc::new(Notify::new()),
            server_handle: RwLock::new(None),
        })
    }

    /// Start GPU monitoring and the API server
    pub async fn start(&self) -> Result<SocketAddr> {
        info!(
            bind = %self.config.bind,
            llama_bin = %self.config.llama_bin.display(),
            model_dir = %self.config.model_dir.display(),
            "Starting worker agent"
        );

        self.gpus.start_background_monitoring().await;

        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WorkerError::Server(format!("Failed to bind to {}: {}", addr, e)))?;
        let local = listener.local_addr()?;

        let server = self.server.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async move { shutdown.notified().await })
                .await
        });
        *self.server_handle.write().await = Some(handle);

        info!("Worker agent listening on {}", local);
        Ok(local)
    }

    /// Serve until Ctrl-C or SIGTERM, then stop everything
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.wait_for_shutdown().await;
        self.shutdown().await
    }

    async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
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
                info!("Received Ctrl+C signal");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }
    }

    /// Close the API, stop every engine and the GPU monitor
    pub async fn shutdown(&self) -> Result<()> {
        info!("Stopping worker agent");
        self.shutdown.notify_one();

        if let Some(handle) = self.server_handle.write().await.take() {
            let limit = Duration::from_secs(30);
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(result)) => {
                    if let Err(e) = result {
                        warn!("Worker API stopped with error: {}", e);
                    }
                }
                Ok(Err(e)) => warn!("Worker API task failed: {}", e),
                Err(_) => warn!("Worker API did not shut down within {:?}", limit),
            }
        }

        self.instances.stop_all().await;
        self.gpus.stop_background_monitoring().await;

        info!("Worker agent stopped");
        Ok(())
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }
}
