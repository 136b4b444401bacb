//! Execution of one admitted job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::MissedTickBehavior;

use crate::checksum::ChecksumStore;
use crate::destination::{Destination, Identity};
use crate::events::JobEvent;
use crate::pipeline::{
    run_pipeline, ItemTask, OutageMonitor, PipelineContext, StopReason, StopSignal, OUTAGE_THRESHOLD,
};
use crate::progress::{LogTail, ProgressHandle, ProgressTracker, Report, TrackerSummary, LOG_TAIL_LINES};
use crate::retry::retry_retryable;
use crate::source::SourceError;
use crate::state::{AlbumRecord, AlbumStatus, Job, JobPatch, JobStatus, JobStore};

use super::JobController;

impl JobController {
    /// Run an admitted job to its next resting state and persist it.
    pub(super) async fn run_job(
        self: Arc<Self>,
        job: Job,
        stop: StopSignal,
        _permit: OwnedSemaphorePermit,
    ) {
        let job_id = job.id.clone();
        let initial = match self.store.progress_counts(&job_id).await {
            Ok(progress) => progress,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to load progress, starting from snapshot");
                job.progress
            }
        };
        let (progress, tracker) = ProgressTracker::spawn(
            &job_id,
            self.store.clone(),
            self.events.clone(),
            initial,
            &job.log_tail,
        );
        progress.log(format!(
            "Job started with {} album link(s)",
            job.album_links.len()
        ));

        let watcher = tokio::spawn(watch_control(
            self.store.clone(),
            job_id.clone(),
            stop.clone(),
            self.config.poll_interval,
        ));

        self.transfer(&job, &stop, &progress).await;

        watcher.abort();
        drop(progress);
        let summary = match tracker.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Progress tracker panicked");
                TrackerSummary {
                    progress: initial,
                    log_tail: job.log_tail.clone(),
                }
            }
        };

        let reason = match stop.reason() {
            Some(reason) => Some(reason),
            None => self
                .verify_finished(&job_id)
                .await
                .err()
                .map(StopReason::Fatal),
        };
        self.finish_job(&job_id, reason, summary).await;
    }

    async fn finish_job(&self, job_id: &str, reason: Option<StopReason>, summary: TrackerSummary) {
        let progress = summary.progress;
        let (status, last_error, message) = match reason {
            None => (
                JobStatus::Completed,
                Some(None),
                format!(
                    "Job completed: {} uploaded, {} skipped, {} failed",
                    progress.uploaded, progress.skipped, progress.failed
                ),
            ),
            Some(StopReason::Pause) => (JobStatus::Paused, None, "Job paused".to_string()),
            Some(StopReason::Cancel) => (JobStatus::Cancelled, None, "Job cancelled".to_string()),
            Some(StopReason::Shutdown) => (
                JobStatus::Queued,
                None,
                "Worker shutting down, job returned to the queue".to_string(),
            ),
            Some(StopReason::Fatal(error)) => (
                JobStatus::Failed,
                Some(Some(error.clone())),
                format!("Job failed: {}", error),
            ),
        };

        if status != JobStatus::Completed {
            // Items interrupted between stages start over on the next run.
            if let Err(e) = self.store.reset_unfinished_items(job_id).await {
                tracing::warn!(job_id, error = %e, "Failed to reset interrupted items");
            }
        }

        let mut log = LogTail::from_text(&summary.log_tail, LOG_TAIL_LINES);
        log.push(&message);
        if status == JobStatus::Failed {
            tracing::error!(job_id, "{}", message);
        } else {
            tracing::info!(job_id, "{}", message);
        }

        let patch = JobPatch {
            progress: Some(progress),
            last_error,
            log_tail: Some(log.render()),
            control: Some(None),
            ..JobPatch::default()
        };
        if let Err(e) = self.store.update_job(job_id, &patch).await {
            tracing::error!(job_id, error = %e, "Failed to persist final job state");
        }
        match self
            .store
            .transition(job_id, &[JobStatus::Running], status)
            .await
        {
            Ok(true) => self
                .events
                .status_changed(job_id, JobStatus::Running, status),
            Ok(false) => {
                tracing::warn!(job_id, status = %status, "Job left RUNNING before it finished")
            }
            Err(e) => tracing::error!(job_id, error = %e, "Failed to persist final job status"),
        }
        self.untrack_running(job_id);
        self.events.publish(JobEvent::Progress {
            job_id: job_id.to_string(),
            progress,
        });
    }

    /// Connect, then feed every album through the pipeline.
    async fn transfer(&self, job: &Job, stop: &StopSignal, progress: &ProgressHandle) {
        let (destination, identity) = match self.connect(job).await {
            Ok(connected) => connected,
            Err(reason) => {
                stop.request(StopReason::Fatal(reason));
                return;
            }
        };
        progress.log(format!(
            "Connected to {} as {}",
            job.immich_url, identity.email
        ));

        let albums = match self.store.albums(&job.id).await {
            Ok(albums) => albums,
            Err(e) => {
                stop.request(StopReason::Fatal(format!("Could not load albums: {}", e)));
                return;
            }
        };
        let seed = match self.store.known_checksums(&job.immich_url).await {
            Ok(seed) => seed,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to load known checksums");
                HashSet::new()
            }
        };

        let options = job.options.clamped();
        let ctx = Arc::new(PipelineContext {
            job_id: job.id.clone(),
            source: self.source.clone(),
            destination,
            staging: options.store_staging.then(|| self.staging.clone()),
            checksums: ChecksumStore::new(seed),
            options,
            retry: self.config.retry,
            progress: progress.clone(),
            stop: stop.clone(),
            source_health: OutageMonitor::new(OUTAGE_THRESHOLD),
            destination_health: OutageMonitor::new(OUTAGE_THRESHOLD),
        });

        let feed_stop = stop.clone();
        let store = self.store.clone();
        let feed_ctx = ctx.clone();
        let feed = stream::iter(albums)
            .take_while(move |_| std::future::ready(!feed_stop.is_stopped()))
            .then(move |album| prepare_album(store.clone(), feed_ctx.clone(), album))
            .flat_map(stream::iter);

        run_pipeline(ctx, feed).await;
    }

    async fn connect(&self, job: &Job) -> Result<(Arc<dyn Destination>, Identity), String> {
        let destination = self
            .destinations
            .connect(&job.immich_url)
            .map_err(|e| format!("Could not connect to {}: {}", job.immich_url, e))?;
        let identity = retry_retryable(&self.config.retry, || {
            destination.authenticate(&job.auth)
        })
        .await
        .map_err(|e| format!("Could not authenticate with {}: {}", job.immich_url, e))?;
        tracing::debug!(job_id = %job.id, user = %identity.id, "Authenticated");
        Ok((destination, identity))
    }

    /// A run that was never stopped must have finished every album and item.
    async fn verify_finished(&self, job_id: &str) -> Result<(), String> {
        let albums = self.store.albums(job_id).await.map_err(|e| e.to_string())?;
        if let Some(album) = albums.iter().find(|a| a.status != AlbumStatus::Done) {
            return Err(format!(
                "Album \"{}\" did not finish (status {})",
                album.display_name(),
                album.status.as_str()
            ));
        }
        let items = self.store.items(job_id).await.map_err(|e| e.to_string())?;
        let open = items.iter().filter(|i| !i.status.is_terminal()).count();
        if open > 0 {
            return Err(format!("{} item(s) did not finish", open));
        }
        Ok(())
    }
}

/// Resolve an album if needed, make sure its destination album exists and
/// return its unfinished items as pipeline tasks.
///
/// Any failure here stops the job; the album is marked failed so a retry
/// resolves it again.
async fn prepare_album(
    store: Arc<dyn JobStore>,
    ctx: Arc<PipelineContext>,
    mut album: AlbumRecord,
) -> Vec<ItemTask> {
    if ctx.stop.is_stopped() || album.status == AlbumStatus::Done {
        return Vec::new();
    }
    match prepare(store.as_ref(), &ctx, &mut album).await {
        Ok(tasks) => tasks,
        Err(reason) => {
            if let Err(e) = store
                .set_album_status(album.id, AlbumStatus::Failed, Some(&reason))
                .await
            {
                tracing::warn!(job_id = %ctx.job_id, album_id = album.id, error = %e, "Failed to persist album state");
            }
            ctx.stop.request(StopReason::Fatal(reason));
            Vec::new()
        }
    }
}

async fn prepare(
    store: &dyn JobStore,
    ctx: &PipelineContext,
    album: &mut AlbumRecord,
) -> Result<Vec<ItemTask>, String> {
    let records = if album.status == AlbumStatus::Resolved {
        store
            .unfinished_items(album.id)
            .await
            .map_err(|e| e.to_string())?
    } else {
        let link = album.link.clone();
        match retry_retryable(&ctx.retry, || ctx.source.resolve(&link)).await {
            Ok(resolved) => {
                if resolved.title.is_some() {
                    album.title = resolved.title.clone();
                }
                ctx.progress.log(format!(
                    "Resolved \"{}\": {} item(s)",
                    album.display_name(),
                    resolved.items.len()
                ));
                store
                    .record_album_resolved(album.id, resolved.title.as_deref(), &resolved.items)
                    .await
                    .map_err(|e| e.to_string())?
            }
            Err(SourceError::Empty { .. }) => {
                ctx.progress
                    .log(format!("Album link {} has no items", link));
                store
                    .record_album_resolved(album.id, None, &[])
                    .await
                    .map_err(|e| e.to_string())?
            }
            Err(e) => return Err(format!("Could not resolve {}: {}", link, e)),
        }
    };

    if ctx.options.create_album && album.dest_album_id.is_none() && !records.is_empty() {
        let name = album.display_name();
        let dest_id = retry_retryable(&ctx.retry, || {
            ctx.destination.find_or_create_album(&name)
        })
        .await
        .map_err(|e| format!("Could not create album \"{}\": {}", name, e))?;
        store
            .set_album_destination(album.id, &dest_id)
            .await
            .map_err(|e| e.to_string())?;
        album.dest_album_id = Some(dest_id);
    }

    ctx.progress.send(Report::AlbumQueued {
        album_id: album.id,
        name: album.display_name(),
        pending: records.len(),
    });

    let position = album.position;
    let dest_album_id = album.dest_album_id.clone();
    Ok(records
        .into_iter()
        .map(|record| ItemTask {
            record,
            album_position: position,
            dest_album_id: dest_album_id.clone(),
        })
        .collect())
}

/// Turn a control request recorded by another process into a stop.
async fn watch_control(
    store: Arc<dyn JobStore>,
    job_id: String,
    stop: StopSignal,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.stopped() => return,
            _ = ticker.tick() => {}
        }
        match store.get_job(&job_id).await {
            Ok(Some(job)) => {
                if let Some(request) = job.control {
                    tracing::info!(job_id = %job_id, request = request.as_str(), "Control request received");
                    stop.request(request.into());
                    return;
                }
            }
            Ok(None) => {
                stop.request(StopReason::Cancel);
                return;
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to poll job control"),
        }
    }
}
