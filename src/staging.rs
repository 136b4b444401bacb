//! On-disk holding area for downloaded payloads.
//!
//! Layout: `<root>/<job id>/<album position>/<filename>`. Bodies are
//! streamed into a uniquely named `.part` file, hashed on the way, and
//! renamed into place, so a crash never leaves a truncated file under a
//! final name and a payload is never held in memory as a whole.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::checksum::{sha1_file, to_hex};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Remove characters that are invalid on common filesystems and leading
/// dots, falling back to `item` when nothing is left.
pub fn clean_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "item".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Add a string suffix before the file extension.
///
/// For example, `"photo.jpg"` with suffix `"abc"` becomes `"photo-abc.jpg"`.
pub fn insert_suffix(path: &str, suffix: &str) -> String {
    match path.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => {
            let (stem, ext) = path.split_at(dot_pos);
            let mut result = String::with_capacity(stem.len() + 1 + suffix.len() + ext.len());
            result.push_str(stem);
            result.push('-');
            result.push_str(suffix);
            result.push_str(ext);
            result
        }
        _ => format!("{}-{}", path, suffix),
    }
}

/// A payload staged under its final name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

/// An open `.part` file being filled chunk by chunk.
///
/// Finish it with [`StagingManager::commit`] or throw it away with
/// [`PartFile::discard`].
#[derive(Debug)]
pub struct PartFile {
    dir: PathBuf,
    path: PathBuf,
    file: File,
    hasher: Sha1,
    size: u64,
}

impl PartFile {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        self.hasher.update(chunk);
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| StagingError::io(&self.path, e))?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn discard(self) {
        drop(self.file);
        remove_quietly(&self.path).await;
    }
}

/// Manages the staging root shared by all jobs of one worker.
#[derive(Debug)]
pub struct StagingManager {
    root: PathBuf,
    /// Serializes final-name selection and rename.
    naming: Mutex<()>,
}

impl StagingManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            naming: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Open a fresh `.part` file for one item of `album_position`.
    pub async fn begin(&self, job_id: &str, album_position: u32) -> Result<PartFile, StagingError> {
        let dir = self.job_dir(job_id).join(album_position.to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;

        let path = dir.join(format!("{}.part", uuid::Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| StagingError::io(&path, e))?;
        Ok(PartFile {
            dir,
            path,
            file,
            hasher: Sha1::new(),
            size: 0,
        })
    }

    /// Flush `part` and move it under its final name.
    ///
    /// A file already holding the same bytes under the chosen name is
    /// reused. A different file under that name gets the checksum prefix
    /// as a suffix instead of being overwritten. The `.part` file is gone
    /// afterwards whether or not this succeeds.
    pub async fn commit(&self, part: PartFile, filename: &str) -> Result<StagedFile, StagingError> {
        let PartFile {
            dir,
            path: part_path,
            mut file,
            hasher,
            size,
        } = part;
        let checksum = to_hex(&hasher.finalize());

        let flushed = file.flush().await;
        drop(file);
        if let Err(e) = flushed {
            remove_quietly(&part_path).await;
            return Err(StagingError::io(&part_path, e));
        }

        let clean = clean_filename(filename);
        let _guard = self.naming.lock().await;
        let primary = dir.join(&clean);
        let target = match choose_target(&primary, &dir, &clean, &checksum).await {
            Ok(Target::Fresh(path)) => path,
            Ok(Target::Existing(path)) => {
                remove_quietly(&part_path).await;
                tracing::debug!(path = %path.display(), "Reusing staged file");
                return Ok(StagedFile {
                    path,
                    checksum,
                    size,
                });
            }
            Err(e) => {
                remove_quietly(&part_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&part_path, &target).await {
            remove_quietly(&part_path).await;
            return Err(StagingError::io(&target, e));
        }
        Ok(StagedFile {
            path: target,
            checksum,
            size,
        })
    }

    /// True when `path` still exists on disk.
    pub async fn is_staged(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Delete everything staged for a job. Returns false if nothing was there.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool, StagingError> {
        let dir = self.job_dir(job_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(job_id, path = %dir.display(), "Removed staging directory");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StagingError::io(&dir, e)),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}

enum Target {
    Fresh(PathBuf),
    Existing(PathBuf),
}

async fn choose_target(
    primary: &Path,
    dir: &Path,
    clean: &str,
    checksum: &str,
) -> Result<Target, StagingError> {
    if !fs::try_exists(primary).await.unwrap_or(false) {
        return Ok(Target::Fresh(primary.to_path_buf()));
    }
    let existing = sha1_file(primary)
        .await
        .map_err(|e| StagingError::io(primary, e))?;
    if existing == checksum {
        return Ok(Target::Existing(primary.to_path_buf()));
    }

    let short = &checksum[..checksum.len().min(8)];
    let alternate = dir.join(insert_suffix(clean, short));
    if fs::try_exists(&alternate).await.unwrap_or(false) {
        Ok(Target::Existing(alternate))
    } else {
        Ok(Target::Fresh(alternate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha1_hex;

    async fn stage(
        staging: &StagingManager,
        job_id: &str,
        album_position: u32,
        filename: &str,
        data: &[u8],
    ) -> Result<StagedFile, StagingError> {
        let mut part = staging.begin(job_id, album_position).await?;
        // Two chunks, like a body arriving over the network.
        let (head, tail) = data.split_at(data.len() / 2);
        part.write(head).await?;
        part.write(tail).await?;
        staging.commit(part, filename).await
    }

    fn part_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("a/b:c*d?.jpg"), "abcd.jpg");
        assert_eq!(clean_filename("../secret"), "secret");
        assert_eq!(clean_filename("   "), "item");
    }

    #[test]
    fn test_insert_suffix() {
        assert_eq!(insert_suffix("photo.jpg", "abc"), "photo-abc.jpg");
        assert_eq!(insert_suffix("photo", "abc"), "photo-abc");
        assert_eq!(insert_suffix("archive.tar.gz", "x"), "archive.tar-x.gz");
    }

    #[tokio::test]
    async fn test_stage_writes_under_job_and_album() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let data = b"jpeg bytes";
        let staged = stage(&staging, "job-1", 0, "IMG_1.jpg", data).await.unwrap();
        assert_eq!(
            staged.path,
            tmp.path().join("job-1").join("0").join("IMG_1.jpg")
        );
        assert_eq!(staged.checksum, sha1_hex(data));
        assert_eq!(staged.size, data.len() as u64);
        assert_eq!(std::fs::read(&staged.path).unwrap(), data);
        let entries = std::fs::read_dir(staged.path.parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(entries, 1, "no .part file left behind");
    }

    #[tokio::test]
    async fn test_stage_same_bytes_reuses_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let a = stage(&staging, "j", 1, "x.jpg", b"same").await.unwrap();
        let b = stage(&staging, "j", 1, "x.jpg", b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(part_files(&tmp.path().join("j").join("1")), 0);
    }

    #[tokio::test]
    async fn test_stage_name_collision_gets_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let first = b"first";
        let second = b"second";
        let a = stage(&staging, "j", 0, "x.jpg", first).await.unwrap();
        let b = stage(&staging, "j", 0, "x.jpg", second).await.unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(std::fs::read(&a.path).unwrap(), first);
        assert_eq!(std::fs::read(&b.path).unwrap(), second);
        let name = b.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("x-") && name.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_failed_commit_removes_part_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let dir = tmp.path().join("j").join("0");
        // A directory squatting on the final name cannot be hashed or replaced.
        std::fs::create_dir_all(dir.join("x.jpg")).unwrap();

        let err = stage(&staging, "j", 0, "x.jpg", b"bytes").await;
        assert!(err.is_err());
        assert_eq!(part_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_discard_removes_part_file() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let mut part = staging.begin("j", 2).await.unwrap();
        part.write(b"half a body").await.unwrap();
        assert_eq!(part.size(), 11);
        part.discard().await;
        assert_eq!(part_files(&tmp.path().join("j").join("2")), 0);
    }

    #[tokio::test]
    async fn test_remove_job() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(tmp.path());
        let staged = stage(&staging, "gone", 0, "a.jpg", b"a").await.unwrap();
        assert!(staging.is_staged(&staged.path).await);
        assert!(staging.remove_job("gone").await.unwrap());
        assert!(!staging.is_staged(&staged.path).await);
        assert!(!staging.remove_job("gone").await.unwrap());
    }
}
