//! Types for the job store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::destination::AuthConfig;
use crate::source::ItemDescriptor;

use super::error::StateError;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Edges of the job state machine.
    ///
    /// `Running -> Queued` is taken when a worker shuts down or recovers an
    /// interrupted job; `Completed/Failed -> Queued` only by retry-failed.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Paused)
                | (Queued, Cancelled)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Completed, Queued)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job options chosen at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub create_album: bool,
    pub skip_duplicates: bool,
    pub store_staging: bool,
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            create_album: true,
            skip_duplicates: true,
            store_staging: true,
            download_concurrency: 3,
            upload_concurrency: 3,
        }
    }
}

impl JobOptions {
    /// Clamp both concurrencies into `[1, 10]`.
    pub fn clamped(mut self) -> Self {
        self.download_concurrency = self
            .download_concurrency
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        self.upload_concurrency = self
            .upload_concurrency
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        self
    }
}

/// Progress snapshot. `items_processed = uploaded + skipped + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub albums_processed: u64,
    pub total_albums: u64,
    pub items_processed: u64,
    pub total_items: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl Progress {
    pub fn recompute_processed(&mut self) {
        self.items_processed = self.uploaded + self.skipped + self.failed;
    }

    pub fn percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.items_processed as f64 * 100.0 / self.total_items as f64
    }
}

/// A control request recorded against a running job, picked up by the
/// worker that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause,
    Cancel,
}

impl ControlRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Cancel => "cancel",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pause" => Some(Self::Pause),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub immich_url: String,
    pub auth: AuthConfig,
    pub album_links: Vec<String>,
    pub options: JobOptions,
    pub progress: Progress,
    pub last_error: Option<String>,
    pub log_tail: String,
    pub control: Option<ControlRequest>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Split newline-delimited album links, dropping blank lines.
pub fn parse_album_links(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything needed to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub immich_url: String,
    pub auth: AuthConfig,
    pub album_links: Vec<String>,
    pub options: JobOptions,
}

impl NewJob {
    /// Build a new job from raw links text; options are clamped.
    pub fn new(immich_url: &str, auth: AuthConfig, links: &str, options: JobOptions) -> Self {
        Self {
            immich_url: immich_url.trim().to_string(),
            auth,
            album_links: parse_album_links(links),
            options: options.clamped(),
        }
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.immich_url.is_empty() {
            return Err(StateError::InvalidJob("Immich URL is required".into()));
        }
        if self.album_links.is_empty() {
            return Err(StateError::InvalidJob(
                "at least one album link is required".into(),
            ));
        }
        match &self.auth {
            AuthConfig::ApiKey { api_key } if api_key.trim().is_empty() => {
                Err(StateError::InvalidJob("API key is empty".into()))
            }
            AuthConfig::Credentials { email, password }
                if email.trim().is_empty() || password.is_empty() =>
            {
                Err(StateError::InvalidJob(
                    "email and password are both required".into(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Partial update of a job row. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<Progress>,
    pub last_error: Option<Option<String>>,
    pub log_tail: Option<String>,
    pub control: Option<Option<ControlRequest>>,
}

/// Resolution state of one album link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumStatus {
    Pending,
    Resolved,
    Done,
    Failed,
}

impl AlbumStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One album link within a job, with counts derived from its items.
#[derive(Debug, Clone)]
pub struct AlbumRecord {
    pub id: i64,
    pub job_id: String,
    pub position: u32,
    pub link: String,
    pub title: Option<String>,
    pub status: AlbumStatus,
    pub dest_album_id: Option<String>,
    pub error: Option<String>,
    pub item_count: u64,
    pub processed: u64,
    pub failed: u64,
}

impl AlbumRecord {
    /// Name of the destination album: the source title, or a positional
    /// fallback when the page had none.
    pub fn display_name(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Imported album {}", self.position + 1))
    }
}

/// Per-item lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    Downloading,
    Downloaded,
    Uploading,
    Done,
    Skipped,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "downloaded" => Some(Self::Downloaded),
            "uploading" => Some(Self::Uploading),
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }
}

/// One media item of an album.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub id: i64,
    pub job_id: String,
    pub album_id: i64,
    pub position: u32,
    pub descriptor: ItemDescriptor,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub checksum: Option<String>,
    pub staged_path: Option<PathBuf>,
    pub asset_id: Option<String>,
    pub status: ItemStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

impl ItemRecord {
    /// Filename reported by the source, else the descriptor's hint.
    pub fn effective_filename(&self) -> &str {
        self.filename
            .as_deref()
            .unwrap_or(&self.descriptor.filename_hint)
    }
}

/// Partial update of an item row. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub status: Option<ItemStatus>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub checksum: Option<String>,
    pub staged_path: Option<PathBuf>,
    pub asset_id: Option<String>,
    pub error: Option<Option<String>>,
    pub add_attempts: u32,
}

impl ItemUpdate {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Cancelled,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_str("queued"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_state_machine_edges() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_options_clamped() {
        let opts = JobOptions {
            download_concurrency: 0,
            upload_concurrency: 50,
            ..JobOptions::default()
        }
        .clamped();
        assert_eq!(opts.download_concurrency, 1);
        assert_eq!(opts.upload_concurrency, 10);
    }

    #[test]
    fn test_parse_album_links_drops_blanks() {
        let links = parse_album_links("\n https://photos.app.goo.gl/a \n\n   \nhttps://photos.app.goo.gl/b\n");
        assert_eq!(
            links,
            vec!["https://photos.app.goo.gl/a", "https://photos.app.goo.gl/b"]
        );
    }

    #[test]
    fn test_new_job_validation() {
        let auth = AuthConfig::ApiKey {
            api_key: "k".into(),
        };
        let ok = NewJob::new("https://immich", auth.clone(), "https://photos.app.goo.gl/a", JobOptions::default());
        assert!(ok.validate().is_ok());

        let no_links = NewJob::new("https://immich", auth, "\n\n", JobOptions::default());
        assert!(matches!(no_links.validate(), Err(StateError::InvalidJob(_))));

        let no_password = NewJob::new(
            "https://immich",
            AuthConfig::Credentials {
                email: "a@b.c".into(),
                password: String::new(),
            },
            "https://photos.app.goo.gl/a",
            JobOptions::default(),
        );
        assert!(no_password.validate().is_err());
    }

    #[test]
    fn test_progress_processed_sum() {
        let mut p = Progress {
            uploaded: 3,
            skipped: 1,
            failed: 1,
            total_items: 10,
            ..Progress::default()
        };
        p.recompute_processed();
        assert_eq!(p.items_processed, 5);
        assert!((p.percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_item_status_terminal() {
        assert!(ItemStatus::Done.is_terminal());
        assert!(ItemStatus::Skipped.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Downloaded.is_terminal());
        assert_eq!(ItemStatus::from_str("uploading"), Some(ItemStatus::Uploading));
    }

    #[test]
    fn test_album_display_name_fallback() {
        let album = AlbumRecord {
            id: 1,
            job_id: "j".into(),
            position: 1,
            link: "l".into(),
            title: None,
            status: AlbumStatus::Pending,
            dest_album_id: None,
            error: None,
            item_count: 0,
            processed: 0,
            failed: 0,
        };
        assert_eq!(album.display_name(), "Imported album 2");
    }
}
