//! Model artifact preparation

use crate::{Result, WorkerError};
use async_trait::async_trait;
use futures::StreamExt;
use gw_core::Model;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Makes a model's artifacts available under the model directory
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    /// Ensure every file of `model` exists under `model_dir`
    async fn fetch(&self, model: &Model, model_dir: &Path) -> Result<()>;
}

/// Downloads missing files from the model's `url`.
///
/// The url is a template: `%s` is replaced with the file name, otherwise the
/// file name is appended as a path segment. Files that already exist and are
/// non-empty are left alone.
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    client: reqwest::Client,
}

impl HttpModelFetcher {
    /// Only connecting is bounded; artifacts can take a long time to transfer
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        let partial = partial_path(target);
        info!(%url, target = %target.display(), "Downloading model file");

        let response = self.client.get(url).send().await?.error_for_status()?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(WorkerError::Fetch(format!("{} returned an empty body", url)));
        }

        tokio::fs::rename(&partial, target).await?;
        debug!(target = %target.display(), bytes = written, "Download complete");
        Ok(())
    }
}

#[async_trait]
impl ModelFetcher for HttpModelFetcher {
    async fn fetch(&self, model: &Model, model_dir: &Path) -> Result<()> {
        if model.files.is_empty() {
            return Err(WorkerError::Fetch(format!("Model {} lists no files", model.name)));
        }

        for file in &model.files {
            let target = artifact_path(model_dir, file)?;
            if is_present(&target).await {
                continue;
            }

            let template = model.url.as_deref().ok_or_else(|| {
                WorkerError::Fetch(format!(
                    "{} is missing and model {} has no url",
                    file, model.name
                ))
            })?;
            self.download(&file_url(template, file), &target).await?;
        }
        Ok(())
    }
}

/// Resolve `file` inside `model_dir`, refusing anything that could escape it
pub fn artifact_path(model_dir: &Path, file: &str) -> Result<PathBuf> {
    let relative = Path::new(file);
    let contained = !file.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !contained {
        return Err(WorkerError::Fetch(format!("Invalid model file name: {}", file)));
    }
    Ok(model_dir.join(relative))
}

fn file_url(template: &str, file: &str) -> String {
    if template.contains("%s") {
        template.replace("%s", file)
    } else {
        format!("{}/{}", template.trim_end_matches('/'), file)
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn is_present(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
}
