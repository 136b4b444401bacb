//! Source side: resolving shared-album links into media items and fetching
//! their bytes.

pub mod error;
pub mod google;
pub mod parser;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

pub use error::SourceError;
pub use google::GooglePhotosClient;

/// One media item as listed by the source album page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Stable per-item key assigned by the source (`AF1Qip…`).
    pub media_key: String,
    /// URL that returns the original bytes.
    pub url: String,
    /// Filename to use when the download response does not name the file.
    pub filename_hint: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub is_video: bool,
}

/// A resolved album: its display title and items in page order.
#[derive(Debug, Clone)]
pub struct ResolvedAlbum {
    pub title: Option<String>,
    pub items: Vec<ItemDescriptor>,
}

/// Body of a fetched item, chunk by chunk.
pub type MediaStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// An item's byte stream plus what the response headers told us about it.
pub struct FetchedMedia {
    pub body: MediaStream,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Announced body length, when the source sent one.
    pub size: Option<u64>,
}

impl std::fmt::Debug for FetchedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedMedia")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Resolves album links and fetches item bytes.
///
/// Resolution is idempotent: resolving the same link twice yields the same
/// items unless the album changed at the source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn resolve(&self, album_link: &str) -> Result<ResolvedAlbum, SourceError>;

    /// Start the download of one item. Errors while reading the body
    /// arrive through [`FetchedMedia::body`].
    async fn fetch(&self, item: &ItemDescriptor) -> Result<FetchedMedia, SourceError>;
}
