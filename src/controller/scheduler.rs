use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{StopReason, StopSignal};
use crate::state::{Job, JobPatch, JobStatus};

use super::{ControlError, JobController};

impl JobController {
    /// Admit and run queued jobs until `shutdown` fires.
    ///
    /// With `once` set the loop returns as soon as nothing is queued and
    /// nothing is running. On shutdown every running job is stopped at its
    /// next item boundary and put back in the queue.
    pub async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        once: bool,
    ) -> Result<(), ControlError> {
        let recovered = self.recover_interrupted().await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered jobs from a previous worker");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            while let Ok(permit) = self.admission.clone().try_acquire_owned() {
                match self.admit_next().await {
                    Ok(Some((job, stop))) => {
                        tasks.spawn(self.clone().run_job(job, stop, permit));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to admit queued job");
                        break;
                    }
                }
            }

            if once && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = self.wake.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Job task panicked");
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        if !tasks.is_empty() {
            tracing::info!(running = tasks.len(), "Stopping running jobs");
            self.stop_all(StopReason::Shutdown);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Job task panicked");
            }
        }
        Ok(())
    }

    /// Move the oldest queued job to `RUNNING`.
    ///
    /// The status change is a compare-and-set, so a job paused or cancelled
    /// between the listing and the admission is skipped.
    async fn admit_next(&self) -> Result<Option<(Job, StopSignal)>, ControlError> {
        for mut job in self.store.list_by_status(JobStatus::Queued).await? {
            if job.control.is_some() {
                let patch = JobPatch {
                    control: Some(None),
                    ..JobPatch::default()
                };
                self.store.update_job(&job.id, &patch).await?;
                job.control = None;
            }

            // Registered before the status flips so a cancel that sees the
            // job running also reaches its signal.
            let stop = StopSignal::new();
            self.track_running(&job.id, stop.clone());
            let admitted = self
                .store
                .transition(&job.id, &[JobStatus::Queued], JobStatus::Running)
                .await;
            match admitted {
                Ok(true) => {
                    tracing::info!(job_id = %job.id, "Job admitted");
                    self.events
                        .status_changed(&job.id, JobStatus::Queued, JobStatus::Running);
                    job.status = JobStatus::Running;
                    return Ok(Some((job, stop)));
                }
                Ok(false) => self.untrack_running(&job.id),
                Err(e) => {
                    self.untrack_running(&job.id);
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }
}
