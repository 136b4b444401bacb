//! Content checksums and the local record of what a destination already has.
//!
//! Checksums are SHA-1 over the raw downloaded bytes, hex encoded, which is
//! the digest Immich indexes assets by. Renamed copies of the same bytes
//! hash identically.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};
use tokio::sync::OwnedMutexGuard;

/// Hex-encode a finished digest.
pub fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hex-encoded SHA-1 of `data`.
pub fn sha1_hex(data: &[u8]) -> String {
    to_hex(&Sha1::digest(data))
}

/// Hex-encoded SHA-1 of a file, hashed on the blocking pool.
pub async fn sha1_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha1::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(to_hex(&hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Result of [`ChecksumStore::claim`].
#[derive(Debug)]
pub enum Claim {
    /// The destination already has these bytes.
    Known,
    /// The caller owns the upload of these bytes until the guard drops.
    /// Call [`ChecksumStore::record`] before dropping it on success.
    Owned(OwnedMutexGuard<()>),
}

#[derive(Debug, Default)]
struct Inner {
    known: HashSet<String>,
    uploading: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// Checksums known to exist at one destination.
///
/// Seeded from the state database (items previously uploaded to the same
/// server by any job) and extended as this run uploads. Workers holding the
/// same bytes serialize on [`claim`](Self::claim): the second one waits for
/// the first upload and then sees the checksum as known, or takes over if
/// that upload failed. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ChecksumStore {
    inner: Arc<Mutex<Inner>>,
}

impl ChecksumStore {
    pub fn new(seed: HashSet<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                known: seed,
                uploading: HashMap::new(),
            })),
        }
    }

    pub fn contains(&self, checksum: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.known.contains(checksum))
            .unwrap_or(false)
    }

    /// Record a checksum; returns false if it was already known.
    pub fn record(&self, checksum: &str) -> bool {
        match self.inner.lock() {
            Ok(mut inner) => inner.known.insert(checksum.to_string()),
            Err(_) => false,
        }
    }

    /// Wait for exclusive ownership of `checksum`, unless it is known.
    pub async fn claim(&self, checksum: &str) -> Claim {
        let slot = match self.inner.lock() {
            Ok(mut inner) => {
                if inner.known.contains(checksum) {
                    return Claim::Known;
                }
                inner
                    .uploading
                    .entry(checksum.to_string())
                    .or_default()
                    .clone()
            }
            // A poisoned set cannot dedup; let every worker upload.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        };
        let guard = slot.lock_owned().await;
        if self.contains(checksum) {
            return Claim::Known;
        }
        Claim::Owned(guard)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.known.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            sha1_hex(b"hello world"),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[tokio::test]
    async fn test_sha1_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(sha1_file(&path).await.unwrap(), sha1_hex(b"hello world"));
    }

    #[test]
    fn test_store_records_and_shares_between_clones() {
        let store = ChecksumStore::new(HashSet::from(["abc".to_string()]));
        let clone = store.clone();
        assert!(store.contains("abc"));
        assert!(!store.contains("def"));
        assert!(clone.record("def"));
        assert!(!clone.record("def"));
        assert!(store.contains("def"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_known_checksum() {
        let store = ChecksumStore::new(HashSet::from(["abc".to_string()]));
        assert!(matches!(store.claim("abc").await, Claim::Known));
        assert!(matches!(store.claim("def").await, Claim::Owned(_)));
    }

    #[tokio::test]
    async fn test_second_claim_waits_for_first_upload() {
        let store = ChecksumStore::default();
        let first = match store.claim("abc").await {
            Claim::Owned(guard) => guard,
            Claim::Known => panic!("nothing is known yet"),
        };

        let waiter = store.clone();
        let second = tokio::spawn(async move { waiter.claim("abc").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        store.record("abc");
        drop(first);
        assert!(matches!(second.await.unwrap(), Claim::Known));
    }

    #[tokio::test]
    async fn test_claim_passes_on_after_failed_upload() {
        let store = ChecksumStore::default();
        let first = store.claim("abc").await;
        let waiter = store.clone();
        let second = tokio::spawn(async move { waiter.claim("abc").await });

        // Dropped without recording: the upload failed.
        drop(first);
        assert!(matches!(second.await.unwrap(), Claim::Owned(_)));
    }
}
