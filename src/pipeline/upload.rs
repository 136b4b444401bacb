use std::sync::atomic::{AtomicU32, Ordering};

use crate::checksum::Claim;
use crate::destination::{AssetUpload, DestinationError};
use crate::progress::Outcome;
use crate::retry::retry_retryable;
use crate::state::ItemStatus;

use super::{DownloadedItem, PipelineContext, StopReason};

fn stop_fatal(ctx: &PipelineContext, err: &DestinationError) {
    if ctx.stop.request(StopReason::Fatal(err.to_string())) {
        tracing::error!(job_id = %ctx.job_id, error = %err, "Destination error stops the job");
    }
}

/// Count an exhausted outage error. When enough pile up in a row, ping the
/// destination and stop the job if it does not answer.
async fn note_outage(ctx: &PipelineContext, err: &DestinationError) {
    if !err.is_outage() || !ctx.destination_health.failure() {
        return;
    }
    let failures = ctx.destination_health.consecutive();
    tracing::warn!(job_id = %ctx.job_id, failures, error = %err, "Checking destination after repeated failures");
    match retry_retryable(&ctx.retry, || ctx.destination.ping()).await {
        Ok(()) => {
            tracing::info!(job_id = %ctx.job_id, "Destination answers, continuing");
            ctx.destination_health.success();
        }
        Err(ping_err) => {
            let reason = format!(
                "Destination unreachable: {} consecutive uploads failed ({}), ping: {}",
                failures, err, ping_err
            );
            if ctx.stop.request(StopReason::Fatal(reason)) {
                tracing::error!(job_id = %ctx.job_id, error = %ping_err, "Destination outage stops the job");
            }
        }
    }
}

/// Dedup, upload and album-link one item.
///
/// Once the upload call starts the item runs through association even if
/// a pause or cancel arrives meanwhile.
pub(super) async fn upload_item(ctx: &PipelineContext, item: DownloadedItem) {
    if ctx.stop.is_stopped() {
        return;
    }
    let DownloadedItem {
        task,
        payload,
        checksum,
        filename,
        content_type,
        captured_at,
    } = item;
    let record = &task.record;

    // Held until this item settles; another worker with the same bytes
    // waits here and then skips.
    let _claim = if ctx.options.skip_duplicates {
        match ctx.checksums.claim(&checksum).await {
            Claim::Known => {
                tracing::debug!(job_id = %ctx.job_id, item = %filename, "Already uploaded, skipping");
                ctx.finish(&task, Outcome::Skipped, None, None, 0);
                return;
            }
            Claim::Owned(guard) => Some(guard),
        }
    } else {
        None
    };
    if ctx.stop.is_stopped() {
        return;
    }

    if ctx.options.skip_duplicates {
        match ctx.destination.checksum_exists(&checksum).await {
            Ok(Some(true)) => {
                tracing::debug!(job_id = %ctx.job_id, item = %filename, "Destination has checksum, skipping");
                ctx.checksums.record(&checksum);
                ctx.finish(&task, Outcome::Skipped, None, None, 0);
                return;
            }
            Ok(_) => {}
            Err(e) if e.is_job_fatal() => {
                stop_fatal(ctx, &e);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %ctx.job_id,
                    item = %filename,
                    error = %e,
                    "Checksum lookup failed, uploading anyway"
                );
            }
        }
    }

    ctx.progress.item_status(record.id, ItemStatus::Uploading);
    let asset = AssetUpload {
        data: payload,
        filename: filename.clone(),
        content_type,
        checksum: checksum.clone(),
        device_asset_id: record.descriptor.media_key.clone(),
        created_at: captured_at,
    };
    let attempts = AtomicU32::new(0);
    let uploaded = retry_retryable(&ctx.retry, || {
        attempts.fetch_add(1, Ordering::Relaxed);
        ctx.destination.upload(asset.clone())
    })
    .await;
    let attempts = attempts.load(Ordering::Relaxed);

    let uploaded = match uploaded {
        Ok(u) => u,
        Err(e) if e.is_job_fatal() => {
            stop_fatal(ctx, &e);
            return;
        }
        Err(e) => {
            let reason = format!("upload failed after {} attempt(s): {}", attempts, e);
            ctx.finish(&task, Outcome::Failed, None, Some(reason), attempts);
            note_outage(ctx, &e).await;
            return;
        }
    };
    ctx.destination_health.success();
    ctx.checksums.record(&checksum);

    if let Some(album_id) = &task.dest_album_id {
        let linked = retry_retryable(&ctx.retry, || {
            ctx.destination.associate(&uploaded.id, album_id)
        })
        .await;
        if let Err(e) = linked {
            let reason = format!(
                "uploaded as {} but adding it to the album failed: {}",
                uploaded.id, e
            );
            ctx.finish(
                &task,
                Outcome::Failed,
                Some(uploaded.id.clone()),
                Some(reason),
                attempts,
            );
            if e.is_job_fatal() {
                stop_fatal(ctx, &e);
            } else {
                note_outage(ctx, &e).await;
            }
            return;
        }
    }

    let outcome = if uploaded.duplicate {
        tracing::debug!(job_id = %ctx.job_id, item = %filename, asset = %uploaded.id, "Server reported duplicate");
        Outcome::Skipped
    } else {
        Outcome::Uploaded
    };
    ctx.finish(&task, outcome, Some(uploaded.id), None, attempts);
}
