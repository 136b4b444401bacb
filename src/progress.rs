//! Progress tracking for a running job.
//!
//! Workers never touch the job row directly. They send [`Report`]s to a
//! single tracker task which applies item outcomes to the store, keeps the
//! counters and the bounded log tail, persists the snapshot and publishes
//! it as a [`JobEvent::Progress`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{EventBus, JobEvent};
use crate::state::{AlbumStatus, ItemStatus, ItemUpdate, JobPatch, JobStore, Progress};

pub const LOG_TAIL_LINES: usize = 200;

/// The last N job-visible log lines, each prefixed with a UTC timestamp.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Continue from a persisted tail.
    pub fn from_text(text: &str, capacity: usize) -> Self {
        let mut tail = Self::new(capacity);
        for line in text.lines().filter(|l| !l.is_empty()) {
            tail.push_raw(line.to_string());
        }
        tail
    }

    pub fn push(&mut self, message: &str) {
        let line = format!("{} {}", Utc::now().format("%H:%M:%S"), message);
        self.push_raw(line);
    }

    fn push_raw(&mut self, line: String) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Uploaded,
    Skipped,
    Failed,
}

impl Outcome {
    fn item_status(self) -> ItemStatus {
        match self {
            Outcome::Uploaded => ItemStatus::Done,
            Outcome::Skipped => ItemStatus::Skipped,
            Outcome::Failed => ItemStatus::Failed,
        }
    }
}

#[derive(Debug)]
pub enum Report {
    /// An album's items are about to enter the pipeline. `pending` of them
    /// still need work; zero means the album is already finished.
    AlbumQueued {
        album_id: i64,
        name: String,
        pending: usize,
    },
    ItemStatus {
        item_id: i64,
        status: ItemStatus,
    },
    ItemDownloaded {
        item_id: i64,
        filename: Option<String>,
        content_type: Option<String>,
        checksum: String,
        staged_path: Option<PathBuf>,
        attempts: u32,
    },
    ItemFinished {
        item_id: i64,
        album_id: i64,
        label: String,
        outcome: Outcome,
        asset_id: Option<String>,
        error: Option<String>,
        attempts: u32,
    },
    Log(String),
}

/// Cloneable sender side handed to every worker.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<Report>,
}

impl ProgressHandle {
    pub fn send(&self, report: Report) {
        // The tracker outlives every handle; a closed channel means the job
        // is already being torn down.
        let _ = self.tx.send(report);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.send(Report::Log(message.into()));
    }

    pub fn item_status(&self, item_id: i64, status: ItemStatus) {
        self.send(Report::ItemStatus { item_id, status });
    }
}

/// Final state handed back when every handle has been dropped.
#[derive(Debug, Clone)]
pub struct TrackerSummary {
    pub progress: Progress,
    pub log_tail: String,
}

struct AlbumCounter {
    name: String,
    remaining: usize,
}

pub struct ProgressTracker {
    job_id: String,
    store: Arc<dyn JobStore>,
    events: EventBus,
    progress: Progress,
    log: LogTail,
    albums: HashMap<i64, AlbumCounter>,
}

impl ProgressTracker {
    /// Start the tracker task from the persisted snapshot and log tail.
    pub fn spawn(
        job_id: &str,
        store: Arc<dyn JobStore>,
        events: EventBus,
        initial: Progress,
        log_tail: &str,
    ) -> (ProgressHandle, JoinHandle<TrackerSummary>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            job_id: job_id.to_string(),
            store,
            events,
            progress: initial,
            log: LogTail::from_text(log_tail, LOG_TAIL_LINES),
            albums: HashMap::new(),
        };
        let handle = tokio::spawn(tracker.run(rx));
        (ProgressHandle { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Report>) -> TrackerSummary {
        while let Some(report) = rx.recv().await {
            self.apply(report).await;
            // Coalesce whatever else is already queued into one write.
            while let Ok(report) = rx.try_recv() {
                self.apply(report).await;
            }
            self.persist().await;
        }
        TrackerSummary {
            progress: self.progress,
            log_tail: self.log.render(),
        }
    }

    fn log_line(&mut self, message: &str) {
        tracing::info!(job_id = %self.job_id, "{}", message);
        self.log.push(message);
    }

    async fn update_item(&self, item_id: i64, update: ItemUpdate) {
        if let Err(e) = self.store.update_item(item_id, &update).await {
            tracing::warn!(job_id = %self.job_id, item_id, error = %e, "Failed to persist item state");
        }
    }

    async fn album_finished(&mut self, album_id: i64, name: &str) {
        if let Err(e) = self
            .store
            .set_album_status(album_id, AlbumStatus::Done, None)
            .await
        {
            tracing::warn!(job_id = %self.job_id, album_id, error = %e, "Failed to persist album state");
        }
        self.progress.albums_processed =
            (self.progress.albums_processed + 1).min(self.progress.total_albums);
        self.log_line(&format!("Album \"{}\" finished", name));
    }

    async fn apply(&mut self, report: Report) {
        match report {
            Report::AlbumQueued {
                album_id,
                name,
                pending,
            } => {
                match self.store.progress_counts(&self.job_id).await {
                    Ok(counts) => {
                        self.progress.total_items = self.progress.total_items.max(counts.total_items);
                        self.progress.total_albums =
                            self.progress.total_albums.max(counts.total_albums);
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %self.job_id, error = %e, "Failed to refresh item totals")
                    }
                }
                if pending == 0 {
                    self.album_finished(album_id, &name).await;
                } else {
                    self.log_line(&format!("Album \"{}\": {} item(s) to import", name, pending));
                    self.albums.insert(
                        album_id,
                        AlbumCounter {
                            name,
                            remaining: pending,
                        },
                    );
                }
            }
            Report::ItemStatus { item_id, status } => {
                self.update_item(item_id, ItemUpdate::status(status)).await;
            }
            Report::ItemDownloaded {
                item_id,
                filename,
                content_type,
                checksum,
                staged_path,
                attempts,
            } => {
                let update = ItemUpdate {
                    status: Some(ItemStatus::Downloaded),
                    filename,
                    content_type,
                    checksum: Some(checksum),
                    staged_path,
                    add_attempts: attempts,
                    ..ItemUpdate::default()
                };
                self.update_item(item_id, update).await;
            }
            Report::ItemFinished {
                item_id,
                album_id,
                label,
                outcome,
                asset_id,
                error,
                attempts,
            } => {
                match outcome {
                    Outcome::Uploaded => self.progress.uploaded += 1,
                    Outcome::Skipped => self.progress.skipped += 1,
                    Outcome::Failed => self.progress.failed += 1,
                }
                self.progress.recompute_processed();
                if let Some(reason) = &error {
                    tracing::warn!(job_id = %self.job_id, item = %label, error = %reason, "Item failed");
                    self.log.push(&format!("Failed {}: {}", label, reason));
                }
                let update = ItemUpdate {
                    status: Some(outcome.item_status()),
                    asset_id,
                    error: Some(error),
                    add_attempts: attempts,
                    ..ItemUpdate::default()
                };
                self.update_item(item_id, update).await;

                let finished = match self.albums.get_mut(&album_id) {
                    Some(counter) => {
                        counter.remaining = counter.remaining.saturating_sub(1);
                        counter.remaining == 0
                    }
                    None => false,
                };
                if finished {
                    if let Some(counter) = self.albums.remove(&album_id) {
                        self.album_finished(album_id, &counter.name).await;
                    }
                }
            }
            Report::Log(message) => self.log_line(&message),
        }
    }

    async fn persist(&self) {
        let patch = JobPatch {
            progress: Some(self.progress),
            log_tail: Some(self.log.render()),
            ..JobPatch::default()
        };
        if let Err(e) = self.store.update_job(&self.job_id, &patch).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to persist progress");
        }
        self.events.publish(JobEvent::Progress {
            job_id: self.job_id.clone(),
            progress: self.progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::AuthConfig;
    use crate::source::ItemDescriptor;
    use crate::state::{JobOptions, NewJob, SqliteJobStore};

    #[test]
    fn test_log_tail_drops_oldest() {
        let mut tail = LogTail::new(3);
        for i in 0..5 {
            tail.push(&format!("line {}", i));
        }
        assert_eq!(tail.len(), 3);
        let text = tail.render();
        assert!(!text.contains("line 1"));
        assert!(text.contains("line 2"));
        assert!(text.lines().last().unwrap().ends_with("line 4"));
    }

    #[test]
    fn test_log_tail_timestamp_prefix() {
        let mut tail = LogTail::new(10);
        tail.push("hello");
        let line = tail.render();
        let (ts, msg) = line.split_once(' ').unwrap();
        assert_eq!(ts.len(), 8);
        assert_eq!(ts.matches(':').count(), 2);
        assert_eq!(msg, "hello");
    }

    #[test]
    fn test_log_tail_from_text_respects_capacity() {
        let tail = LogTail::from_text("a\nb\n\nc\nd", 2);
        assert_eq!(tail.render(), "c\nd");
        assert!(LogTail::from_text("", 5).is_empty());
    }

    fn descriptor(key: &str) -> ItemDescriptor {
        ItemDescriptor {
            media_key: key.to_string(),
            url: format!("https://lh3.googleusercontent.com/pw/{}=d", key),
            filename_hint: format!("{}.jpg", key),
            captured_at: None,
            is_video: false,
        }
    }

    #[tokio::test]
    async fn test_tracker_applies_reports() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let job = store
            .create_job(&NewJob::new(
                "https://immich.local",
                AuthConfig::ApiKey {
                    api_key: "k".into(),
                },
                "https://photos.app.goo.gl/a",
                JobOptions::default(),
            ))
            .await
            .unwrap();
        let album = store.albums(&job.id).await.unwrap().remove(0);
        let items = store
            .record_album_resolved(album.id, Some("Trip"), &[descriptor("k1"), descriptor("k2")])
            .await
            .unwrap();

        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (handle, task) =
            ProgressTracker::spawn(&job.id, store.clone(), events, job.progress, "");

        handle.send(Report::AlbumQueued {
            album_id: album.id,
            name: "Trip".into(),
            pending: 2,
        });
        handle.send(Report::ItemFinished {
            item_id: items[0].id,
            album_id: album.id,
            label: "k1.jpg".into(),
            outcome: Outcome::Uploaded,
            asset_id: Some("a1".into()),
            error: None,
            attempts: 1,
        });
        handle.send(Report::ItemFinished {
            item_id: items[1].id,
            album_id: album.id,
            label: "k2.jpg".into(),
            outcome: Outcome::Failed,
            asset_id: None,
            error: Some("upload failed after 3 attempts".into()),
            attempts: 3,
        });
        drop(handle);

        let summary = task.await.unwrap();
        assert_eq!(summary.progress.total_items, 2);
        assert_eq!(summary.progress.uploaded, 1);
        assert_eq!(summary.progress.failed, 1);
        assert_eq!(summary.progress.items_processed, 2);
        assert_eq!(summary.progress.albums_processed, 1);
        assert!(summary.log_tail.contains("Failed k2.jpg"));

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, summary.progress);
        let album = store.albums(&job.id).await.unwrap().remove(0);
        assert_eq!(album.status, AlbumStatus::Done);

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Progress { .. }));
    }

    #[tokio::test]
    async fn test_empty_album_counts_as_processed() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let job = store
            .create_job(&NewJob::new(
                "https://immich.local",
                AuthConfig::ApiKey {
                    api_key: "k".into(),
                },
                "https://photos.app.goo.gl/empty",
                JobOptions::default(),
            ))
            .await
            .unwrap();
        let album = store.albums(&job.id).await.unwrap().remove(0);

        let (handle, task) =
            ProgressTracker::spawn(&job.id, store.clone(), EventBus::default(), job.progress, "");
        handle.send(Report::AlbumQueued {
            album_id: album.id,
            name: "Imported album 1".into(),
            pending: 0,
        });
        drop(handle);

        let summary = task.await.unwrap();
        assert_eq!(summary.progress.albums_processed, 1);
        assert_eq!(summary.progress.total_items, 0);
    }
}
