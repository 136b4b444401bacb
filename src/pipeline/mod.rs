//! Per-job transfer pipeline: a bounded download pool feeding a bounded
//! upload pool through a channel.
//!
//! Without staging the channel holds at most `upload_concurrency` payloads,
//! so a slow destination throttles downloads. With staging bodies stream to
//! disk and the channel only carries file references, so it gets a much
//! larger buffer. Both pools stop taking
//! new items as soon as the job's [`StopSignal`] fires; items already in
//! flight run to their next boundary.

mod download;
mod health;
mod upload;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::checksum::ChecksumStore;
use crate::destination::{AssetData, Destination};
use crate::progress::{Outcome, ProgressHandle, Report};
use crate::retry::RetryConfig;
use crate::source::SourceClient;
use crate::staging::StagingManager;
use crate::state::{ControlRequest, ItemRecord, JobOptions};

pub use health::{OutageMonitor, OUTAGE_THRESHOLD};

/// Channel capacity between the pools when payloads are files on disk.
const STAGED_CHANNEL_CAPACITY: usize = 1024;

/// Why a running job stopped taking new work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Pause,
    Cancel,
    /// The worker process is shutting down; the job goes back to the queue.
    Shutdown,
    /// A job-fatal error, carried as the human-readable reason.
    Fatal(String),
}

impl From<ControlRequest> for StopReason {
    fn from(request: ControlRequest) -> Self {
        match request {
            ControlRequest::Pause => StopReason::Pause,
            ControlRequest::Cancel => StopReason::Cancel,
        }
    }
}

/// Cooperative stop flag for one running job. The first request wins.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless another one was recorded first. Returns true
    /// if this call set the reason.
    pub fn request(&self, reason: StopReason) -> bool {
        let set = match self.reason.lock() {
            Ok(mut current) if current.is_none() => {
                *current = Some(reason);
                true
            }
            _ => false,
        };
        self.token.cancel();
        set
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// One item entering the pipeline.
#[derive(Debug, Clone)]
pub struct ItemTask {
    pub record: ItemRecord,
    pub album_position: u32,
    /// Destination album to link the asset into, if albums are created.
    pub dest_album_id: Option<String>,
}

impl ItemTask {
    pub fn label(&self) -> String {
        format!(
            "{} (album {}, item {})",
            self.record.effective_filename(),
            self.album_position + 1,
            self.record.position + 1
        )
    }
}

/// Output of the download pool, input of the upload pool.
#[derive(Debug)]
pub(crate) struct DownloadedItem {
    pub task: ItemTask,
    /// Staged file reference, or the whole payload when nothing is staged.
    pub payload: AssetData,
    pub checksum: String,
    pub filename: String,
    pub content_type: Option<String>,
    /// From the album page, else from the payload's EXIF.
    pub captured_at: Option<DateTime<Utc>>,
}

/// Everything the pools need for one job run.
pub struct PipelineContext {
    pub job_id: String,
    pub source: Arc<dyn SourceClient>,
    pub destination: Arc<dyn Destination>,
    /// Present only when the job stages payloads on disk.
    pub staging: Option<Arc<StagingManager>>,
    pub checksums: ChecksumStore,
    pub options: JobOptions,
    pub retry: RetryConfig,
    pub progress: ProgressHandle,
    pub stop: StopSignal,
    /// Consecutive downloads that failed on transient errors.
    pub source_health: OutageMonitor,
    /// Consecutive uploads that failed on outage errors.
    pub destination_health: OutageMonitor,
}

impl PipelineContext {
    pub(crate) fn finish(
        &self,
        task: &ItemTask,
        outcome: Outcome,
        asset_id: Option<String>,
        error: Option<String>,
        attempts: u32,
    ) {
        self.progress.send(Report::ItemFinished {
            item_id: task.record.id,
            album_id: task.record.album_id,
            label: task.label(),
            outcome,
            asset_id,
            error,
            attempts,
        });
    }
}

/// Drive `items` through download and upload until the stream ends or the
/// job is stopped.
pub async fn run_pipeline<S>(ctx: Arc<PipelineContext>, items: S)
where
    S: Stream<Item = ItemTask> + Send,
{
    let capacity = if ctx.staging.is_some() {
        STAGED_CHANNEL_CAPACITY
    } else {
        ctx.options.upload_concurrency
    };
    let (tx, rx) = mpsc::channel::<DownloadedItem>(capacity.max(1));

    let download_ctx = ctx.clone();
    let download_stage = async move {
        let ctx = download_ctx;
        let tx_ref = &tx;
        let ctx_ref = &ctx;
        items
            .take_while(|_| std::future::ready(!ctx_ref.stop.is_stopped()))
            .for_each_concurrent(ctx.options.download_concurrency, |task| async move {
                if let Some(item) = download::download_item(ctx_ref, task).await {
                    // Receiver only goes away once the upload stage is done.
                    let _ = tx_ref.send(item).await;
                }
            })
            .await;
        drop(tx);
    };

    let upload_ctx = ctx.clone();
    let upload_stage = ReceiverStream::new(rx).for_each_concurrent(
        ctx.options.upload_concurrency,
        move |item| {
            let ctx = upload_ctx.clone();
            async move { upload::upload_item(&ctx, item).await }
        },
    );

    tokio::join!(download_stage, upload_stage);
    tracing::debug!(job_id = %ctx.job_id, stopped = ctx.stop.is_stopped(), "Pipeline drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_stop_reason_wins() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert!(stop.request(StopReason::Pause));
        assert!(!stop.request(StopReason::Cancel));
        assert!(stop.is_stopped());
        assert_eq!(stop.reason(), Some(StopReason::Pause));
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_request() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });
        stop.request(StopReason::Fatal("auth".into()));
        handle.await.unwrap();
        assert_eq!(stop.reason(), Some(StopReason::Fatal("auth".into())));
    }
}
