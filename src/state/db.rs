//! Job store trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::error::StateError;
use super::schema;
use super::types::{
    AlbumRecord, AlbumStatus, ControlRequest, ItemRecord, ItemStatus, ItemUpdate, Job, JobPatch,
    JobStatus, NewJob, Progress,
};
use crate::secrets::SecretBox;
use crate::source::ItemDescriptor;

/// Persistence for jobs, their album links and their items.
///
/// Object-safe so the controller and workers can share an
/// `Arc<dyn JobStore>`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &NewJob) -> Result<Job, StateError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StateError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StateError>;

    /// Jobs in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StateError>;

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<(), StateError>;

    /// Compare-and-set on the status column. Returns false when the job
    /// was not in one of `from`.
    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, StateError>;

    /// Delete a job with its albums and items. Rejected while `RUNNING`.
    async fn delete_job(&self, id: &str) -> Result<(), StateError>;

    /// Move every `QUEUED` job to `PAUSED`; returns the affected ids.
    async fn pause_all_queued(&self) -> Result<Vec<String>, StateError>;

    /// Delete every `QUEUED` job; returns the removed ids.
    async fn remove_all_queued(&self) -> Result<Vec<String>, StateError>;

    /// Album links of a job in position order.
    async fn albums(&self, job_id: &str) -> Result<Vec<AlbumRecord>, StateError>;

    /// Persist the resolution of an album and return its unfinished items.
    ///
    /// Items already recorded for the album (same media key) are kept as
    /// they are, so re-resolving never resets finished work.
    async fn record_album_resolved(
        &self,
        album_id: i64,
        title: Option<&str>,
        items: &[ItemDescriptor],
    ) -> Result<Vec<ItemRecord>, StateError>;

    async fn set_album_status(
        &self,
        album_id: i64,
        status: AlbumStatus,
        error: Option<&str>,
    ) -> Result<(), StateError>;

    async fn set_album_destination(&self, album_id: i64, dest_album_id: &str)
        -> Result<(), StateError>;

    /// Items of an album that are not yet done, skipped or failed.
    async fn unfinished_items(&self, album_id: i64) -> Result<Vec<ItemRecord>, StateError>;

    /// Every item of a job.
    async fn items(&self, job_id: &str) -> Result<Vec<ItemRecord>, StateError>;

    async fn failed_items(&self, job_id: &str) -> Result<Vec<ItemRecord>, StateError>;

    async fn update_item(&self, item_id: i64, update: &ItemUpdate) -> Result<(), StateError>;

    /// Return interrupted items (downloading, downloaded, uploading) to
    /// `pending`, keeping any staged file and checksum.
    async fn reset_unfinished_items(&self, job_id: &str) -> Result<u64, StateError>;

    /// Return failed items to `pending` and reopen their albums.
    async fn reset_failed_items(&self, job_id: &str) -> Result<u64, StateError>;

    /// Checksums of items any job has already delivered to `immich_url`.
    async fn known_checksums(&self, immich_url: &str) -> Result<HashSet<String>, StateError>;

    /// Progress derived from persisted album and item outcomes.
    async fn progress_counts(&self, job_id: &str) -> Result<Progress, StateError>;
}

/// SQLite implementation of the job store.
pub struct SqliteJobStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    /// Seals the `auth` column.
    secrets: SecretBox,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const JOB_COLUMNS: &str = "id, status, immich_url, auth, album_links, options, progress, \
     last_error, log_tail, control, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, job_id, album_id, position, media_key, url, filename_hint, \
     captured_at, is_video, filename, content_type, checksum, staged_path, asset_id, status, \
     attempts, error";

const ALBUM_SELECT: &str = r#"
    SELECT a.id, a.job_id, a.position, a.link, a.title, a.status, a.dest_album_id, a.error,
        (SELECT COUNT(*) FROM items i WHERE i.album_id = a.id),
        (SELECT COUNT(*) FROM items i WHERE i.album_id = a.id
            AND i.status IN ('done', 'skipped', 'failed')),
        (SELECT COUNT(*) FROM items i WHERE i.album_id = a.id AND i.status = 'failed')
    FROM albums a
"#;

impl SqliteJobStore {
    /// Open or create a database at the given path. Credentials are
    /// sealed with `secrets` on write and opened with it on read.
    pub async fn open(path: &Path, secrets: SecretBox) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // Enable WAL mode so status readers don't block the worker
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(StateError::Migration)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            secrets,
        })
    }

    /// Open an in-memory database with a throwaway key.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            secrets: SecretBox::generate(),
        })
    }

    /// Get the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

fn job_status_of(conn: &Connection, id: &str) -> Result<Option<JobStatus>, StateError> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
        .optional()
        .map_err(StateError::query)?;
    raw.map(|s| JobStatus::from_str(&s).ok_or_else(|| StateError::corrupt("jobs", s)))
        .transpose()
}

fn delete_job_rows(conn: &Connection, id: &str) -> Result<(), StateError> {
    conn.execute("DELETE FROM items WHERE job_id = ?1", [id])
        .map_err(StateError::query)?;
    conn.execute("DELETE FROM albums WHERE job_id = ?1", [id])
        .map_err(StateError::query)?;
    conn.execute("DELETE FROM jobs WHERE id = ?1", [id])
        .map_err(StateError::query)?;
    Ok(())
}

fn ids_with_status(conn: &Connection, status: JobStatus) -> Result<Vec<String>, StateError> {
    let mut stmt = conn
        .prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at, rowid")
        .map_err(StateError::query)?;
    let ids = stmt
        .query_map([status.as_str()], |row| row.get(0))
        .map_err(StateError::query)?
        .collect::<Result<Vec<String>, _>>()
        .map_err(StateError::query)?;
    Ok(ids)
}

fn query_items(
    conn: &Connection,
    filter: &str,
    param: &dyn rusqlite::ToSql,
) -> Result<Vec<ItemRecord>, StateError> {
    let sql = format!(
        "SELECT {} FROM items WHERE {} ORDER BY album_id, position",
        ITEM_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(StateError::query)?;
    let items = stmt
        .query_map([param], row_to_item)
        .map_err(StateError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::query)?;
    Ok(items)
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &NewJob) -> Result<Job, StateError> {
        job.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let options = job.options.clamped();
        let progress = Progress {
            total_albums: job.album_links.len() as u64,
            ..Progress::default()
        };

        let auth_json =
            serde_json::to_string(&job.auth).map_err(|e| StateError::corrupt("jobs", e.to_string()))?;
        let sealed_auth = self.secrets.seal(auth_json.as_bytes())?;
        let links_json = serde_json::to_string(&job.album_links)
            .map_err(|e| StateError::corrupt("jobs", e.to_string()))?;
        let options_json =
            serde_json::to_string(&options).map_err(|e| StateError::corrupt("jobs", e.to_string()))?;
        let progress_json = serde_json::to_string(&progress)
            .map_err(|e| StateError::corrupt("jobs", e.to_string()))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        tx.execute(
            r#"
            INSERT INTO jobs (id, status, immich_url, auth, album_links, options, progress, log_tail, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '', ?8, ?8)
            "#,
            rusqlite::params![
                &id,
                JobStatus::Queued.as_str(),
                &job.immich_url,
                sealed_auth,
                links_json,
                options_json,
                progress_json,
                now.timestamp(),
            ],
        )
        .map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO albums (job_id, position, link) VALUES (?1, ?2, ?3)")
                .map_err(StateError::query)?;
            for (position, link) in job.album_links.iter().enumerate() {
                stmt.execute(rusqlite::params![&id, position as i64, link])
                    .map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;

        tracing::debug!(job_id = %id, albums = job.album_links.len(), "Created job");
        Ok(Job {
            id,
            status: JobStatus::Queued,
            immich_url: job.immich_url.clone(),
            auth: job.auth.clone(),
            album_links: job.album_links.clone(),
            options,
            progress,
            last_error: None,
            log_tail: String::new(),
            control: None,
            created_at: from_ts(now.timestamp()),
            updated_at: from_ts(now.timestamp()),
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            [id],
            |row| row_to_job(row, &self.secrets),
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs ORDER BY created_at, rowid",
                JOB_COLUMNS
            ))
            .map_err(StateError::query)?;
        let jobs = stmt
            .query_map([], |row| row_to_job(row, &self.secrets))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(jobs)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at, rowid",
                JOB_COLUMNS
            ))
            .map_err(StateError::query)?;
        let jobs = stmt
            .query_map([status.as_str()], |row| row_to_job(row, &self.secrets))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(jobs)
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<(), StateError> {
        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        let mut values: Vec<Value> = vec![Value::Integer(now_ts())];

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(progress) = &patch.progress {
            let json = serde_json::to_string(progress)
                .map_err(|e| StateError::corrupt("jobs", e.to_string()))?;
            sets.push("progress = ?");
            values.push(Value::Text(json));
        }
        if let Some(last_error) = &patch.last_error {
            sets.push("last_error = ?");
            values.push(last_error.clone().map_or(Value::Null, Value::Text));
        }
        if let Some(log_tail) = &patch.log_tail {
            sets.push("log_tail = ?");
            values.push(Value::Text(log_tail.clone()));
        }
        if let Some(control) = &patch.control {
            sets.push("control = ?");
            values.push(control.map_or(Value::Null, |c| Value::Text(c.as_str().to_string())));
        }
        values.push(Value::Text(id.to_string()));

        let sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        let conn = self.lock()?;
        let changed = conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(StateError::query)?;
        if changed == 0 {
            return Err(StateError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<bool, StateError> {
        let conn = self.lock()?;
        let Some(current) = job_status_of(&conn, id)? else {
            return Err(StateError::JobNotFound(id.to_string()));
        };
        if !from.contains(&current) || !current.can_transition_to(to) {
            return Ok(false);
        }
        let changed = conn
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                rusqlite::params![to.as_str(), now_ts(), id, current.as_str()],
            )
            .map_err(StateError::query)?;
        Ok(changed == 1)
    }

    async fn delete_job(&self, id: &str) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        match job_status_of(&tx, id)? {
            None => return Err(StateError::JobNotFound(id.to_string())),
            Some(JobStatus::Running) => {
                return Err(StateError::JobBusy {
                    id: id.to_string(),
                    status: JobStatus::Running,
                })
            }
            Some(_) => {}
        }
        delete_job_rows(&tx, id)?;
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn pause_all_queued(&self) -> Result<Vec<String>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let ids = ids_with_status(&tx, JobStatus::Queued)?;
        tx.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE status = ?3",
            rusqlite::params![JobStatus::Paused.as_str(), now_ts(), JobStatus::Queued.as_str()],
        )
        .map_err(StateError::query)?;
        tx.commit().map_err(StateError::query)?;
        Ok(ids)
    }

    async fn remove_all_queued(&self) -> Result<Vec<String>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let ids = ids_with_status(&tx, JobStatus::Queued)?;
        for id in &ids {
            delete_job_rows(&tx, id)?;
        }
        tx.commit().map_err(StateError::query)?;
        Ok(ids)
    }

    async fn albums(&self, job_id: &str) -> Result<Vec<AlbumRecord>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE a.job_id = ?1 ORDER BY a.position", ALBUM_SELECT))
            .map_err(StateError::query)?;
        let albums = stmt
            .query_map([job_id], row_to_album)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(albums)
    }

    async fn record_album_resolved(
        &self,
        album_id: i64,
        title: Option<&str>,
        items: &[ItemDescriptor],
    ) -> Result<Vec<ItemRecord>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let job_id: String = tx
            .query_row("SELECT job_id FROM albums WHERE id = ?1", [album_id], |row| {
                row.get(0)
            })
            .map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR IGNORE INTO items (job_id, album_id, position, media_key, url, filename_hint, captured_at, is_video)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                )
                .map_err(StateError::query)?;
            for (position, item) in items.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    &job_id,
                    album_id,
                    position as i64,
                    &item.media_key,
                    &item.url,
                    &item.filename_hint,
                    item.captured_at.map(|dt| dt.timestamp_millis()),
                    item.is_video,
                ])
                .map_err(StateError::query)?;
            }
        }
        tx.execute(
            "UPDATE albums SET title = COALESCE(?1, title), status = ?2, error = NULL WHERE id = ?3",
            rusqlite::params![title, AlbumStatus::Resolved.as_str(), album_id],
        )
        .map_err(StateError::query)?;
        let unfinished = query_items(
            &tx,
            "album_id = ?1 AND status NOT IN ('done', 'skipped', 'failed')",
            &album_id,
        )?;
        tx.commit().map_err(StateError::query)?;
        Ok(unfinished)
    }

    async fn set_album_status(
        &self,
        album_id: i64,
        status: AlbumStatus,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE albums SET status = ?1, error = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), error, album_id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn set_album_destination(
        &self,
        album_id: i64,
        dest_album_id: &str,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE albums SET dest_album_id = ?1 WHERE id = ?2",
            rusqlite::params![dest_album_id, album_id],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn unfinished_items(&self, album_id: i64) -> Result<Vec<ItemRecord>, StateError> {
        let conn = self.lock()?;
        query_items(
            &conn,
            "album_id = ?1 AND status NOT IN ('done', 'skipped', 'failed')",
            &album_id,
        )
    }

    async fn items(&self, job_id: &str) -> Result<Vec<ItemRecord>, StateError> {
        let conn = self.lock()?;
        query_items(&conn, "job_id = ?1", &job_id)
    }

    async fn failed_items(&self, job_id: &str) -> Result<Vec<ItemRecord>, StateError> {
        let conn = self.lock()?;
        query_items(&conn, "job_id = ?1 AND status = 'failed'", &job_id)
    }

    async fn update_item(&self, item_id: i64, update: &ItemUpdate) -> Result<(), StateError> {
        let mut sets: Vec<&str> = vec!["attempts = attempts + ?"];
        let mut values: Vec<Value> = vec![Value::Integer(update.add_attempts as i64)];

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(filename) = &update.filename {
            sets.push("filename = ?");
            values.push(Value::Text(filename.clone()));
        }
        if let Some(content_type) = &update.content_type {
            sets.push("content_type = ?");
            values.push(Value::Text(content_type.clone()));
        }
        if let Some(checksum) = &update.checksum {
            sets.push("checksum = ?");
            values.push(Value::Text(checksum.clone()));
        }
        if let Some(path) = &update.staged_path {
            sets.push("staged_path = ?");
            values.push(Value::Text(path.to_string_lossy().into_owned()));
        }
        if let Some(asset_id) = &update.asset_id {
            sets.push("asset_id = ?");
            values.push(Value::Text(asset_id.clone()));
        }
        if let Some(error) = &update.error {
            sets.push("error = ?");
            values.push(error.clone().map_or(Value::Null, Value::Text));
        }
        values.push(Value::Integer(item_id));

        let sql = format!("UPDATE items SET {} WHERE id = ?", sets.join(", "));
        let conn = self.lock()?;
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .map_err(StateError::query)?;
        Ok(())
    }

    async fn reset_unfinished_items(&self, job_id: &str) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE items SET status = 'pending' WHERE job_id = ?1 \
                 AND status IN ('downloading', 'downloaded', 'uploading')",
                [job_id],
            )
            .map_err(StateError::query)?;
        Ok(changed as u64)
    }

    async fn reset_failed_items(&self, job_id: &str) -> Result<u64, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        tx.execute(
            "UPDATE albums SET status = 'resolved' WHERE job_id = ?1 AND status = 'done' \
             AND id IN (SELECT album_id FROM items WHERE job_id = ?1 AND status = 'failed')",
            [job_id],
        )
        .map_err(StateError::query)?;
        tx.execute(
            "UPDATE albums SET status = 'pending', error = NULL WHERE job_id = ?1 AND status = 'failed'",
            [job_id],
        )
        .map_err(StateError::query)?;
        let changed = tx
            .execute(
                "UPDATE items SET status = 'pending', error = NULL, attempts = 0 \
                 WHERE job_id = ?1 AND status = 'failed'",
                [job_id],
            )
            .map_err(StateError::query)?;
        tx.commit().map_err(StateError::query)?;
        Ok(changed as u64)
    }

    async fn known_checksums(&self, immich_url: &str) -> Result<HashSet<String>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT i.checksum FROM items i JOIN jobs j ON j.id = i.job_id \
                 WHERE j.immich_url = ?1 AND i.checksum IS NOT NULL \
                 AND i.status IN ('done', 'skipped')",
            )
            .map_err(StateError::query)?;
        let checksums = stmt
            .query_map([immich_url], |row| row.get(0))
            .map_err(StateError::query)?
            .collect::<Result<HashSet<String>, _>>()
            .map_err(StateError::query)?;
        Ok(checksums)
    }

    async fn progress_counts(&self, job_id: &str) -> Result<Progress, StateError> {
        let conn = self.lock()?;
        let counts = conn
            .query_row(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM albums WHERE job_id = ?1),
                    (SELECT COUNT(*) FROM albums WHERE job_id = ?1 AND status IN ('done', 'failed')),
                    (SELECT COUNT(*) FROM items WHERE job_id = ?1),
                    (SELECT COUNT(*) FROM items WHERE job_id = ?1 AND status = 'done'),
                    (SELECT COUNT(*) FROM items WHERE job_id = ?1 AND status = 'skipped'),
                    (SELECT COUNT(*) FROM items WHERE job_id = ?1 AND status = 'failed')
                "#,
                [job_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .map_err(StateError::query)?;
        let mut progress = Progress {
            total_albums: counts.0 as u64,
            albums_processed: counts.1 as u64,
            total_items: counts.2 as u64,
            uploaded: counts.3 as u64,
            skipped: counts.4 as u64,
            failed: counts.5 as u64,
            items_processed: 0,
        };
        progress.recompute_processed();
        Ok(progress)
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn conversion_error(idx: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason.into())
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn sealed_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
    secrets: &SecretBox,
) -> rusqlite::Result<T> {
    let sealed: String = row.get(idx)?;
    let raw = secrets
        .open(&sealed)
        .map_err(|e| conversion_error(idx, e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_job(row: &Row<'_>, secrets: &SecretBox) -> rusqlite::Result<Job> {
    let status: String = row.get(1)?;
    let control: Option<String> = row.get(9)?;
    Ok(Job {
        id: row.get(0)?,
        status: JobStatus::from_str(&status)
            .ok_or_else(|| conversion_error(1, format!("unknown job status {}", status)))?,
        immich_url: row.get(2)?,
        auth: sealed_json_column(row, 3, secrets)?,
        album_links: json_column(row, 4)?,
        options: json_column(row, 5)?,
        progress: json_column(row, 6)?,
        last_error: row.get(7)?,
        log_tail: row.get(8)?,
        control: control.as_deref().and_then(ControlRequest::from_str),
        created_at: from_ts(row.get(10)?),
        updated_at: from_ts(row.get(11)?),
    })
}

fn row_to_album(row: &Row<'_>) -> rusqlite::Result<AlbumRecord> {
    let status: String = row.get(5)?;
    Ok(AlbumRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        position: row.get::<_, i64>(2)? as u32,
        link: row.get(3)?,
        title: row.get(4)?,
        status: AlbumStatus::from_str(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown album status {}", status)))?,
        dest_album_id: row.get(6)?,
        error: row.get(7)?,
        item_count: row.get::<_, i64>(8)? as u64,
        processed: row.get::<_, i64>(9)? as u64,
        failed: row.get::<_, i64>(10)? as u64,
    })
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    let captured_at: Option<i64> = row.get(7)?;
    let staged_path: Option<String> = row.get(12)?;
    let status: String = row.get(14)?;
    Ok(ItemRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        album_id: row.get(2)?,
        position: row.get::<_, i64>(3)? as u32,
        descriptor: ItemDescriptor {
            media_key: row.get(4)?,
            url: row.get(5)?,
            filename_hint: row.get(6)?,
            captured_at: captured_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            is_video: row.get(8)?,
        },
        filename: row.get(9)?,
        content_type: row.get(10)?,
        checksum: row.get(11)?,
        staged_path: staged_path.map(PathBuf::from),
        asset_id: row.get(13)?,
        status: ItemStatus::from_str(&status)
            .ok_or_else(|| conversion_error(14, format!("unknown item status {}", status)))?,
        attempts: row.get::<_, i64>(15)? as u32,
        error: row.get(16)?,
    })
}
