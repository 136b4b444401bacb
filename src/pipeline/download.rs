use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::checksum::to_hex;
use crate::destination::AssetData;
use crate::exif;
use crate::progress::{Outcome, Report};
use crate::retry::{retry_retryable, Retryable};
use crate::source::{FetchedMedia, SourceError};
use crate::staging::StagingError;
use crate::state::{ItemRecord, ItemStatus};

use super::{DownloadedItem, ItemTask, PipelineContext, StopReason};

#[derive(Debug, Error)]
enum DownloadError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Staging(#[from] StagingError),
}

impl Retryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Source(e) => e.is_retryable(),
            DownloadError::Staging(_) => false,
        }
    }
}

struct Fetched {
    payload: AssetData,
    checksum: String,
    filename: String,
    content_type: Option<String>,
}

/// One fetch attempt: request, then stream the body to a part file or a
/// buffer while hashing it.
async fn fetch_once(ctx: &PipelineContext, task: &ItemTask) -> Result<Fetched, DownloadError> {
    let record = &task.record;
    let FetchedMedia {
        mut body,
        filename,
        content_type,
        size,
    } = ctx.source.fetch(&record.descriptor).await?;
    let filename = filename.unwrap_or_else(|| record.descriptor.filename_hint.clone());

    match &ctx.staging {
        Some(staging) => {
            let mut part = staging.begin(&ctx.job_id, task.album_position).await?;
            while let Some(chunk) = body.next().await {
                let written = match chunk {
                    Ok(chunk) => part.write(&chunk).await.map_err(DownloadError::from),
                    Err(e) => Err(DownloadError::from(e)),
                };
                if let Err(e) = written {
                    part.discard().await;
                    return Err(e);
                }
            }
            let staged = staging.commit(part, &filename).await?;
            Ok(Fetched {
                payload: AssetData::File(staged.path),
                checksum: staged.checksum,
                filename,
                content_type,
            })
        }
        None => {
            let mut hasher = Sha1::new();
            let mut buf = BytesMut::with_capacity(size.unwrap_or(0).min(64 << 20) as usize);
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                buf.extend_from_slice(&chunk);
            }
            Ok(Fetched {
                payload: AssetData::Memory(buf.freeze()),
                checksum: to_hex(&hasher.finalize()),
                filename,
                content_type,
            })
        }
    }
}

/// Page metadata first, then `DateTimeOriginal` from the payload.
async fn capture_time(record: &ItemRecord, payload: &AssetData) -> Option<DateTime<Utc>> {
    if record.descriptor.captured_at.is_some() {
        return record.descriptor.captured_at;
    }
    if record.descriptor.is_video {
        return None;
    }
    let found = match payload {
        AssetData::Memory(bytes) => {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || exif::capture_time_from_bytes(&bytes)).await
        }
        AssetData::File(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || exif::capture_time_from_file(&path)).await
        }
    }
    .ok()
    .flatten();
    if let Some(time) = found {
        tracing::debug!(item = %record.descriptor.media_key, %time, "Capture time from EXIF");
    }
    found
}

/// Fetch one item, checksum it and optionally stage it.
///
/// Returns `None` when the item was not started (job stopping) or failed;
/// failures are reported to the tracker before returning.
pub(super) async fn download_item(ctx: &PipelineContext, task: ItemTask) -> Option<DownloadedItem> {
    if ctx.stop.is_stopped() {
        return None;
    }
    let record = &task.record;

    if let (Some(staging), Some(path), Some(checksum)) =
        (&ctx.staging, &record.staged_path, &record.checksum)
    {
        if staging.is_staged(path).await {
            tracing::debug!(
                job_id = %ctx.job_id,
                item = %record.descriptor.media_key,
                path = %path.display(),
                "Reusing staged payload"
            );
            let payload = AssetData::File(path.clone());
            let captured_at = capture_time(record, &payload).await;
            return Some(DownloadedItem {
                payload,
                checksum: checksum.clone(),
                filename: record.effective_filename().to_string(),
                content_type: record.content_type.clone(),
                captured_at,
                task,
            });
        }
    }

    ctx.progress.item_status(record.id, ItemStatus::Downloading);
    let attempts = AtomicU32::new(0);
    let fetched = retry_retryable(&ctx.retry, || {
        attempts.fetch_add(1, Ordering::Relaxed);
        fetch_once(ctx, &task)
    })
    .await;
    let attempts = attempts.load(Ordering::Relaxed);

    let fetched = match fetched {
        Ok(f) => {
            ctx.source_health.success();
            f
        }
        Err(e) => {
            let reason = format!("download failed after {} attempt(s): {}", attempts, e);
            ctx.finish(&task, Outcome::Failed, None, Some(reason), attempts);
            if e.is_retryable() && ctx.source_health.failure() {
                let reason = format!(
                    "Source unavailable: {} consecutive downloads failed, last error: {}",
                    ctx.source_health.consecutive(),
                    e
                );
                if ctx.stop.request(StopReason::Fatal(reason)) {
                    tracing::error!(job_id = %ctx.job_id, error = %e, "Source outage stops the job");
                }
            }
            return None;
        }
    };

    let captured_at = capture_time(record, &fetched.payload).await;
    let staged_path = match &fetched.payload {
        AssetData::File(path) => Some(path.clone()),
        AssetData::Memory(_) => None,
    };
    ctx.progress.send(Report::ItemDownloaded {
        item_id: record.id,
        filename: Some(fetched.filename.clone()),
        content_type: fetched.content_type.clone(),
        checksum: fetched.checksum.clone(),
        staged_path,
        attempts,
    });

    Some(DownloadedItem {
        payload: fetched.payload,
        checksum: fetched.checksum,
        filename: fetched.filename,
        content_type: fetched.content_type,
        captured_at,
        task,
    })
}
