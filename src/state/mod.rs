//! Persistent job state.
//!
//! SQLite-backed store for jobs, their album links and per-item outcomes.
//! Everything a worker needs to resume an interrupted or paused job lives
//! here:
//! - Job status, options, progress snapshot and log tail
//! - Album resolution state and destination album ids
//! - Item status, checksum, staged file and destination asset id

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{JobStore, SqliteJobStore};
pub use error::StateError;
pub use types::{
    AlbumRecord, AlbumStatus, ControlRequest, ItemRecord, ItemStatus, ItemUpdate, Job, JobOptions,
    JobPatch, JobStatus, NewJob, Progress, MAX_CONCURRENCY, MIN_CONCURRENCY,
};
pub use types::parse_album_links;
