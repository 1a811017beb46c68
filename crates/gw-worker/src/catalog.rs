//! Model catalog announced by the gateway

use crate::fetcher::ModelFetcher;
use gw_core::{Model, ModelReport};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct CatalogEntry {
    model: Model,
    ready: bool,
}

/// The models this host may run and whether their artifacts are present
pub struct ModelCatalog {
    model_dir: PathBuf,
    fetcher: Arc<dyn ModelFetcher>,
    entries: Arc<RwLock<BTreeMap<String, CatalogEntry>>>,
    preparation: Mutex<Option<JoinHandle<()>>>,
}

impl ModelCatalog {
    pub fn new(model_dir: impl Into<PathBuf>, fetcher: Arc<dyn ModelFetcher>) -> Self {
        Self {
            model_dir: model_dir.into(),
            fetcher,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            preparation: Mutex::new(None),
        }
    }

    /// Replace the catalog and prepare artifacts in the background.
    ///
    /// A model whose definition is unchanged keeps its readiness. A
    /// preparation pass still running for the previous catalog is abandoned.
    pub async fn replace(&self, models: Vec<Model>) -> usize {
        let pending: Vec<Model> = {
            let mut entries = self.entries.write().await;
            let previous = std::mem::take(&mut *entries);

            for model in models {
                let ready = previous
                    .get(&model.name)
                    .is_some_and(|old| old.ready && old.model == model);
                entries.insert(model.name.clone(), CatalogEntry { model, ready });
            }

            entries
                .values()
                .filter(|e| !e.ready)
                .map(|e| e.model.clone())
                .collect()
        };
        let count = self.entries.read().await.len();
        info!(models = count, pending = pending.len(), "Model catalog replaced");

        let mut preparation = self.preparation.lock().await;
        if let Some(handle) = preparation.take() {
            handle.abort();
        }

        let fetcher = Arc::clone(&self.fetcher);
        let entries = Arc::clone(&self.entries);
        let model_dir = self.model_dir.clone();
        *preparation = Some(tokio::spawn(async move {
            for model in pending {
                match fetcher.fetch(&model, &model_dir).await {
                    Ok(()) => {
                        if let Some(entry) = entries.write().await.get_mut(&model.name) {
                            if entry.model == model {
                                entry.ready = true;
                                info!(model = %model.name, "Model ready");
                            }
                        }
                    }
                    Err(e) => warn!(model = %model.name, error = %e, "Model preparation failed"),
                }
            }
        }));

        count
    }

    /// Wait for the current preparation pass to finish
    pub async fn wait_prepared(&self) {
        let handle = self.preparation.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<Model> {
        self.entries.read().await.get(name).map(|e| e.model.clone())
    }

    pub async fn is_ready(&self, name: &str) -> bool {
        self.entries.read().await.get(name).is_some_and(|e| e.ready)
    }

    /// Catalog entries sorted by name
    pub async fn reports(&self) -> Vec<ModelReport> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| ModelReport {
                model: e.model.clone(),
                ready: e.ready,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Drop for ModelCatalog {
    fn drop(&mut self) {
        if let Some(handle) = self.preparation.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Result, WorkerError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Succeeds for models whose name starts with "ok"
    #[derive(Default)]
    struct NamedFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelFetcher for NamedFetcher {
        async fn fetch(&self, model: &Model, _model_dir: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if model.name.starts_with("ok") {
                Ok(())
            } else {
                Err(WorkerError::Fetch("unavailable".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_replace_prepares_in_background() {
        let fetcher = Arc::new(NamedFetcher::default());
        let catalog = ModelCatalog::new("models", fetcher.clone());

        let count = catalog
            .replace(vec![Model::new("ok-b"), Model::new("bad"), Model::new("ok-a")])
            .await;
        assert_eq!(count, 3);
        catalog.wait_prepared().await;

        let reports = catalog.reports().await;
        let names: Vec<&str> = reports.iter().map(|r| r.model.name.as_str()).collect();
        assert_eq!(names, vec!["bad", "ok-a", "ok-b"]);
        assert!(!catalog.is_ready("bad").await);
        assert!(catalog.is_ready("ok-a").await);
        assert!(catalog.is_ready("ok-b").await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_replace_drops_old_models_and_keeps_ready_ones() {
        let fetcher = Arc::new(NamedFetcher::default());
        let catalog = ModelCatalog::new("models", fetcher.clone());

        catalog.replace(vec![Model::new("ok-1"), Model::new("ok-2")]).await;
        catalog.wait_prepared().await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        catalog
            .replace(vec![Model::new("ok-1"), Model::new("ok-3").with_slots(2)])
            .await;
        assert!(catalog.is_ready("ok-1").await);
        assert!(catalog.get("ok-2").await.is_none());
        catalog.wait_prepared().await;

        // only the new model was fetched
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(catalog.get("ok-3").await.unwrap().slots_per_instance, 2);
        assert_eq!(catalog.len().await, 2);
    }

    #[tokio::test]
    async fn test_changed_definition_is_prepared_again() {
        let fetcher = Arc::new(NamedFetcher::default());
        let catalog = ModelCatalog::new("models", fetcher.clone());

        catalog.replace(vec![Model::new("ok")]).await;
        catalog.wait_prepared().await;

        catalog
            .replace(vec![Model::new("ok").with_files(vec!["v2.gguf".to_string()])])
            .await;
        assert!(!catalog.is_ready("ok").await);
        catalog.wait_prepared().await;
        assert!(catalog.is_ready("ok").await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
