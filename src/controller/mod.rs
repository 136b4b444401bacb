//! Job controller: owns the job state machine, admits queued jobs and
//! applies control operations.
//!
//! Control operations work both inside the worker process and from a
//! separate CLI invocation. Jobs that are not running change state directly
//! in the store. Running jobs get a control request recorded on their row,
//! which the owning worker polls; inside the worker the request also fires
//! the job's [`StopSignal`] immediately.

pub mod error;
mod runner;
mod scheduler;


use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify, Semaphore};

use crate::destination::DestinationFactory;
use crate::events::{EventBus, JobEvent};
use crate::pipeline::{StopReason, StopSignal};
use crate::retry::RetryConfig;
use crate::source::SourceClient;
use crate::staging::StagingManager;
use crate::state::{ControlRequest, Job, JobPatch, JobStatus, JobStore, NewJob};

pub use error::ControlError;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on concurrently running jobs.
    pub max_running_jobs: usize,
    pub retry: RetryConfig,
    /// How often idle workers look for queued jobs and running jobs look
    /// for control requests.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: 1,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Result of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The job is now in this state.
    Applied(JobStatus),
    /// The job is running; it will act on the request at its next item
    /// boundary.
    Requested(ControlRequest),
}

pub struct JobController {
    store: Arc<dyn JobStore>,
    source: Arc<dyn SourceClient>,
    destinations: Arc<dyn DestinationFactory>,
    staging: Arc<StagingManager>,
    config: EngineConfig,
    events: EventBus,
    running: Mutex<HashMap<String, StopSignal>>,
    admission: Arc<Semaphore>,
    wake: Notify,
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("config", &self.config)
            .field("staging", &self.staging.root())
            .finish_non_exhaustive()
    }
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        source: Arc<dyn SourceClient>,
        destinations: Arc<dyn DestinationFactory>,
        staging: Arc<StagingManager>,
        config: EngineConfig,
    ) -> Self {
        let permits = config.max_running_jobs.max(1);
        Self {
            store,
            source,
            destinations,
            staging,
            config,
            events: EventBus::default(),
            running: Mutex::new(HashMap::new()),
            admission: Arc::new(Semaphore::new(permits)),
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Create a job in `QUEUED` and wake the scheduler.
    pub async fn create_job(&self, new_job: NewJob) -> Result<Job, ControlError> {
        let job = self.store.create_job(&new_job).await?;
        tracing::info!(
            job_id = %job.id,
            albums = job.album_links.len(),
            auth = job.auth.mode_str(),
            "Job queued"
        );
        self.wake.notify_one();
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, ControlError> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, ControlError> {
        Ok(self.store.list_jobs().await?)
    }

    async fn apply_transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, ControlError> {
        let changed = self.store.transition(id, &[from], to).await?;
        if changed {
            tracing::info!(job_id = id, from = %from, to = %to, "Job state changed");
            self.events.status_changed(id, from, to);
        }
        Ok(changed)
    }

    /// Record a control request against a running job.
    async fn request(&self, id: &str, request: ControlRequest) -> Result<ControlOutcome, ControlError> {
        let patch = JobPatch {
            control: Some(Some(request)),
            ..JobPatch::default()
        };
        self.store.update_job(id, &patch).await?;
        let local = self
            .running
            .lock()
            .ok()
            .and_then(|running| running.get(id).cloned());
        if let Some(stop) = local {
            stop.request(request.into());
        }
        tracing::info!(job_id = id, request = request.as_str(), "Control requested");
        Ok(ControlOutcome::Requested(request))
    }

    /// Cancel a job. `QUEUED` and `PAUSED` jobs are cancelled on the spot;
    /// a running job stops at its next item boundary.
    pub async fn cancel(&self, id: &str) -> Result<ControlOutcome, ControlError> {
        // A queued job can be admitted between the read and the write; the
        // second pass then sees it running.
        for _ in 0..2 {
            let job = self.get_job(id).await?;
            match job.status {
                JobStatus::Queued | JobStatus::Paused => {
                    if self
                        .apply_transition(id, job.status, JobStatus::Cancelled)
                        .await?
                    {
                        return Ok(ControlOutcome::Applied(JobStatus::Cancelled));
                    }
                }
                JobStatus::Running => return self.request(id, ControlRequest::Cancel).await,
                status => {
                    return Err(ControlError::InvalidState {
                        id: id.to_string(),
                        op: "cancel",
                        status,
                    })
                }
            }
        }
        let job = self.get_job(id).await?;
        Err(ControlError::InvalidState {
            id: id.to_string(),
            op: "cancel",
            status: job.status,
        })
    }

    /// Pause a queued or running job.
    pub async fn pause(&self, id: &str) -> Result<ControlOutcome, ControlError> {
        for _ in 0..2 {
            let job = self.get_job(id).await?;
            match job.status {
                JobStatus::Queued => {
                    if self
                        .apply_transition(id, JobStatus::Queued, JobStatus::Paused)
                        .await?
                    {
                        return Ok(ControlOutcome::Applied(JobStatus::Paused));
                    }
                }
                JobStatus::Running => return self.request(id, ControlRequest::Pause).await,
                status => {
                    return Err(ControlError::InvalidState {
                        id: id.to_string(),
                        op: "pause",
                        status,
                    })
                }
            }
        }
        let job = self.get_job(id).await?;
        Err(ControlError::InvalidState {
            id: id.to_string(),
            op: "pause",
            status: job.status,
        })
    }

    /// Resume a paused job. It goes back through admission, so it starts
    /// running once a slot is free.
    pub async fn resume(&self, id: &str) -> Result<ControlOutcome, ControlError> {
        let job = self.get_job(id).await?;
        if job.status == JobStatus::Paused && job.control.is_some() {
            // A request that raced the job's own stop.
            let patch = JobPatch {
                control: Some(None),
                ..JobPatch::default()
            };
            self.store.update_job(id, &patch).await?;
        }
        if job.status != JobStatus::Paused
            || !self
                .apply_transition(id, JobStatus::Paused, JobStatus::Queued)
                .await?
        {
            return Err(ControlError::InvalidState {
                id: id.to_string(),
                op: "resume",
                status: job.status,
            });
        }
        self.wake.notify_one();
        Ok(ControlOutcome::Applied(JobStatus::Queued))
    }

    /// Re-queue a finished job so its failed items get another try.
    pub async fn retry_failed(&self, id: &str) -> Result<ControlOutcome, ControlError> {
        let job = self.get_job(id).await?;
        if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return Err(ControlError::InvalidState {
                id: id.to_string(),
                op: "retry",
                status: job.status,
            });
        }
        let reset = self.store.reset_failed_items(id).await?;
        if reset == 0 && job.status == JobStatus::Completed {
            return Err(ControlError::NothingToRetry(id.to_string()));
        }
        let patch = JobPatch {
            last_error: Some(None),
            control: Some(None),
            ..JobPatch::default()
        };
        self.store.update_job(id, &patch).await?;
        if !self.apply_transition(id, job.status, JobStatus::Queued).await? {
            let current = self.get_job(id).await?;
            return Err(ControlError::InvalidState {
                id: id.to_string(),
                op: "retry",
                status: current.status,
            });
        }
        tracing::info!(job_id = id, items = reset, "Failed items re-queued");
        self.wake.notify_one();
        Ok(ControlOutcome::Applied(JobStatus::Queued))
    }

    /// Delete a job that is not running, along with its staged files.
    pub async fn delete(&self, id: &str) -> Result<(), ControlError> {
        self.store.delete_job(id).await?;
        self.staging.remove_job(id).await?;
        tracing::info!(job_id = id, "Job deleted");
        Ok(())
    }

    /// Pause every queued job. Returns the ids that changed.
    pub async fn pause_queued(&self) -> Result<Vec<String>, ControlError> {
        let ids = self.store.pause_all_queued().await?;
        for id in &ids {
            self.events
                .status_changed(id, JobStatus::Queued, JobStatus::Paused);
        }
        tracing::info!(count = ids.len(), "Paused queued jobs");
        Ok(ids)
    }

    /// Delete every queued job and its staged files. Returns the removed ids.
    pub async fn remove_queued(&self) -> Result<Vec<String>, ControlError> {
        let ids = self.store.remove_all_queued().await?;
        for id in &ids {
            if let Err(e) = self.staging.remove_job(id).await {
                tracing::warn!(job_id = %id, error = %e, "Failed to remove staged files");
            }
        }
        tracing::info!(count = ids.len(), "Removed queued jobs");
        Ok(ids)
    }

    /// Put jobs a dead worker left `RUNNING` back in line.
    ///
    /// A pending pause or cancel request is honoured; otherwise the job is
    /// re-queued. Interrupted items go back to `pending` either way.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, ControlError> {
        let mut recovered = Vec::new();
        for job in self.store.list_by_status(JobStatus::Running).await? {
            let in_process = self
                .running
                .lock()
                .map(|running| running.contains_key(&job.id))
                .unwrap_or(false);
            if in_process {
                continue;
            }
            let reset = self.store.reset_unfinished_items(&job.id).await?;
            let to = match job.control {
                Some(ControlRequest::Pause) => JobStatus::Paused,
                Some(ControlRequest::Cancel) => JobStatus::Cancelled,
                None => JobStatus::Queued,
            };
            let patch = JobPatch {
                control: Some(None),
                ..JobPatch::default()
            };
            self.store.update_job(&job.id, &patch).await?;
            if self
                .apply_transition(&job.id, JobStatus::Running, to)
                .await?
            {
                tracing::warn!(
                    job_id = %job.id,
                    items_reset = reset,
                    status = %to,
                    "Recovered interrupted job"
                );
                recovered.push(job.id);
            }
        }
        Ok(recovered)
    }

    fn track_running(&self, id: &str, stop: StopSignal) {
        if let Ok(mut running) = self.running.lock() {
            running.insert(id.to_string(), stop);
        }
    }

    fn untrack_running(&self, id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(id);
        }
    }

    fn stop_all(&self, reason: StopReason) {
        if let Ok(running) = self.running.lock() {
            for stop in running.values() {
                stop.request(reason.clone());
            }
        }
    }
}
