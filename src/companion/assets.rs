//! Project asset downloads
//!
//! [`AssetFetcher`] owns a single background tokio task that downloads assets one at a time,
//! in submission order. A failed download aborts the rest of its batch; later batches still
//! run. Every completed asset is reported through [`RetValManager`].

use super::retval::RetValManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Session cookie name the App Inventor server expects.
pub const SESSION_COOKIE: &str = "AppInventor";

/// The server session assets are downloaded from.
#[derive(Debug, Clone)]
pub struct AssetSession {
    pub server_uri: String,
    pub project_id: String,
    pub cookie: String,
}

impl AssetSession {
    pub fn new(
        server_uri: impl Into<String>,
        project_id: impl Into<String>,
        cookie: impl Into<String>,
    ) -> Self {
        Self {
            server_uri: server_uri.into(),
            project_id: project_id.into(),
            cookie: cookie.into(),
        }
    }

    /// `GET {server}/ode/download/file/{project}/{asset}`
    pub fn download_url(&self, asset: &str) -> String {
        format!(
            "{}/ode/download/file/{}/{}",
            self.server_uri.trim_end_matches('/'),
            self.project_id,
            asset
        )
    }
}

/// An open download. Dropping it closes the underlying connection.
#[async_trait]
pub trait AssetStream: Send {
    /// Next chunk of the body, or `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Opens asset downloads.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn open(&self, session: &AssetSession, asset: &str) -> Result<Box<dyn AssetStream>>;
}

/// Downloads over HTTP with the session cookie.
pub struct HttpAssetSource {
    client: reqwest::Client,
}

impl HttpAssetSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAssetSource {
    fn default() -> Self {
        Self::new()
    }
}

struct HttpAssetStream {
    response: reqwest::Response,
}

#[async_trait]
impl AssetStream for HttpAssetStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let chunk = self
            .response
            .chunk()
            .await
            .context("Failed to read asset body")?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn open(&self, session: &AssetSession, asset: &str) -> Result<Box<dyn AssetStream>> {
        let url = session.download_url(asset);
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(
                reqwest::header::COOKIE,
                format!("{}={}", SESSION_COOKIE, session.cookie),
            )
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Download of {} failed with status {}", asset, response.status());
        }
        Ok(Box::new(HttpAssetStream { response }))
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub transferred: Vec<String>,
    /// The asset that aborted the batch, with the error text.
    pub failed: Option<(String, String)>,
    /// Assets not attempted because an earlier one failed.
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

struct Batch {
    id: Uuid,
    session: AssetSession,
    assets: Vec<String>,
    done: oneshot::Sender<BatchReport>,
}

pub struct AssetFetcher {
    sender: mpsc::UnboundedSender<Batch>,
    worker: JoinHandle<()>,
}

impl AssetFetcher {
    /// Starts the download worker on the current tokio runtime. Assets land under `target_dir`.
    pub fn spawn(
        source: Arc<dyn AssetSource>,
        target_dir: impl Into<PathBuf>,
        retvals: Arc<RetValManager>,
    ) -> Self {
        let target_dir = target_dir.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Batch>();
        let worker = tokio::spawn(async move {
            while let Some(batch) = receiver.recv().await {
                let report = run_batch(source.as_ref(), &target_dir, &retvals, &batch).await;
                if batch.done.send(report).is_err() {
                    debug!("Nobody waiting on batch {}", batch.id);
                }
            }
            debug!("Asset fetcher stopped");
        });
        Self { sender, worker }
    }

    /// Queues `assets` as one batch. The receiver resolves once the batch finishes.
    pub fn fetch_assets(
        &self,
        session: &AssetSession,
        assets: Vec<String>,
    ) -> Result<oneshot::Receiver<BatchReport>> {
        let (done, report) = oneshot::channel();
        let id = Uuid::new_v4();
        info!("Queueing asset batch {} ({} assets)", id, assets.len());
        self.sender
            .send(Batch {
                id,
                session: session.clone(),
                assets,
                done,
            })
            .map_err(|_| anyhow::anyhow!("Asset fetcher is not running"))?;
        Ok(report)
    }

    /// Queues a single asset as its own batch.
    pub fn fetch_asset(&self, session: &AssetSession, asset: &str) -> Result<oneshot::Receiver<BatchReport>> {
        self.fetch_assets(session, vec![asset.to_string()])
    }

    /// Queues a batch and waits for it.
    pub async fn fetch_and_wait(&self, session: &AssetSession, assets: Vec<String>) -> Result<BatchReport> {
        let report = self.fetch_assets(session, assets)?;
        report.await.context("Asset fetcher dropped the batch")
    }

    /// Stops accepting batches and waits for queued ones to finish.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        self.worker.await.context("Asset fetcher task failed")
    }
}

async fn run_batch(
    source: &dyn AssetSource,
    target_dir: &Path,
    retvals: &RetValManager,
    batch: &Batch,
) -> BatchReport {
    let mut report = BatchReport {
        batch_id: batch.id,
        ..BatchReport::default()
    };
    let mut remaining = batch.assets.iter();
    for asset in remaining.by_ref() {
        match download(source, target_dir, &batch.session, asset).await {
            Ok(path) => {
                info!("Asset {} saved to {:?}", asset, path);
                retvals.asset_transferred(asset);
                report.transferred.push(asset.clone());
            }
            Err(err) => {
                error!("Asset {} failed, aborting batch {}: {:#}", asset, batch.id, err);
                report.failed = Some((asset.clone(), format!("{:#}", err)));
                break;
            }
        }
    }
    report.skipped = remaining.cloned().collect();
    if !report.skipped.is_empty() {
        warn!("Batch {} skipped {} assets", batch.id, report.skipped.len());
    }
    report
}

async fn download(
    source: &dyn AssetSource,
    target_dir: &Path,
    session: &AssetSession,
    asset: &str,
) -> Result<PathBuf> {
    let target = resolve_target(target_dir, asset)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut stream = source.open(session, asset).await?;
    let written = write_stream(stream.as_mut(), &target).await;
    drop(stream);
    if written.is_err() {
        // Leave no truncated file behind.
        let _ = tokio::fs::remove_file(&target).await;
    }
    written?;
    Ok(target)
}

async fn write_stream(stream: &mut dyn AssetStream, target: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("Failed to create {:?}", target))?;
    let mut total = 0usize;
    while let Some(chunk) = stream.next_chunk().await? {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {:?}", target))?;
        total += chunk.len();
    }
    file.flush().await?;
    debug!("Wrote {} bytes to {:?}", total, target);
    Ok(())
}

/// Maps an asset path into `target_dir`, refusing anything that could escape it.
pub fn resolve_target(target_dir: &Path, asset: &str) -> Result<PathBuf> {
    let relative = Path::new(asset);
    let clean = !asset.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !clean {
        anyhow::bail!("Refusing asset path outside the asset directory: {}", asset);
    }
    Ok(target_dir.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_url() {
        let session = AssetSession::new("http://localhost:8888/", "42", "abc");
        assert_eq!(
            session.download_url("assets/kitty.png"),
            "http://localhost:8888/ode/download/file/42/assets/kitty.png"
        );
    }

    #[test]
    fn test_resolve_target_rejects_escapes() {
        let dir = Path::new("/data/AppInventor");
        assert_eq!(
            resolve_target(dir, "assets/a.png").unwrap(),
            PathBuf::from("/data/AppInventor/assets/a.png")
        );
        assert!(resolve_target(dir, "../etc/passwd").is_err());
        assert!(resolve_target(dir, "/etc/passwd").is_err());
        assert!(resolve_target(dir, "").is_err());
    }
}
