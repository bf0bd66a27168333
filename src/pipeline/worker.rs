//! Download consumers and the media-transfer executor.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indicatif::ProgressBar;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex as AsyncMutex;

use super::{DownloadJob, PipelineError, PipelineShared};
use crate::retry::RetryConfig;
use crate::storage::{self, DownloadError};
use crate::store::{MediaRecord, RecordStore};

/// Executes one download job. The pipeline's consumers are generic over
/// this seam so the engine can be driven without a network or a disk.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &DownloadJob) -> Result<(), DownloadError>;
}

/// The production executor: transfers every media file of the post into the
/// target's folder and records each file in the record store.
pub struct MediaDownloader {
    http: reqwest::Client,
    store: Arc<dyn RecordStore>,
    retry: RetryConfig,
}

impl MediaDownloader {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryConfig) -> anyhow::Result<Self> {
        // Media host is separate from the API host: plain client, no auth
        // headers, no total timeout (videos can be large), bounded connect.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http, store, retry })
    }
}

#[async_trait]
impl JobExecutor for MediaDownloader {
    async fn execute(&self, job: &DownloadJob) -> Result<(), DownloadError> {
        // The target folder is created lazily, on the first media written.
        tokio::fs::create_dir_all(&job.dir).await?;

        for url in &job.post.media_urls {
            let path = storage::download_media(
                &self.http,
                url,
                &job.dir,
                &job.post.text,
                job.post.created_at,
                &self.retry,
            )
            .await?;

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.store
                .create_media_record(&MediaRecord {
                    user_id: job.account_id,
                    post_id: job.post.id,
                    file_name,
                    created_at: job.post.created_at,
                })
                .await
                .map_err(|e| DownloadError::Other(e.into()))?;
        }

        tracing::debug!(post = job.post.id, dir = %job.dir.display(), "post mirrored");
        Ok(())
    }
}

/// Consumer loop: pull jobs until the queue closes.
///
/// Every job taken off the queue is accounted for — downloaded, skipped
/// (media permanently gone upstream), or pushed to this worker's failed
/// list. After cancellation the loop keeps pulling but routes everything
/// straight to the failed list, so nothing queued is ever dropped.
pub(super) async fn consume(
    rx: Arc<AsyncMutex<Receiver<DownloadJob>>>,
    executor: Arc<dyn JobExecutor>,
    shared: Arc<PipelineShared>,
    pb: ProgressBar,
) -> Vec<DownloadJob> {
    let mut failed = Vec::new();

    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        if shared.cancel_token().is_cancelled() {
            failed.push(job);
            pb.inc(1);
            continue;
        }

        match executor.execute(&job).await {
            Ok(()) => {
                shared.downloaded.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) if e.is_skippable() => {
                pb.suspend(|| {
                    tracing::debug!(post = job.post.id, error = %e, "media gone upstream, skipping");
                });
                shared.skipped.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                pb.suspend(|| {
                    tracing::error!(post = job.post.id, error = %e, "download failed");
                });
                if e.is_disk_full() {
                    shared.fatal(PipelineError::DiskFull(e.to_string()));
                }
                failed.push(job);
            }
        }
        pb.inc(1);
    }

    failed
}
