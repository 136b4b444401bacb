use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;

use super::parser::{content_disposition_filename, parse_album_page};
use super::{FetchedMedia, ItemDescriptor, ResolvedAlbum, SourceClient, SourceError};

/// Google serves the full album markup only to browser-like agents.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";

const SHARED_ALBUM_PREFIXES: &[&str] = &[
    "https://photos.app.goo.gl/",
    "https://photos.google.com/share/",
    "https://photos.google.com/u/",
    "https://goo.gl/photos/",
];

/// Returns true if `link` looks like a Google Photos shared-album link.
pub fn is_shared_album_link(link: &str) -> bool {
    SHARED_ALBUM_PREFIXES.iter().any(|p| link.starts_with(p))
}

/// HTTP client for public Google Photos shared albums.
///
/// Album pages and media bytes use separate clients so that page requests
/// keep a short timeout while large video transfers get a long one.
#[derive(Debug, Clone)]
pub struct GooglePhotosClient {
    pages: Client,
    media: Client,
}

impl GooglePhotosClient {
    pub fn new(request_timeout: Duration, transfer_timeout: Duration) -> anyhow::Result<Self> {
        let pages = Client::builder()
            .cookie_store(true)
            .timeout(request_timeout)
            .build()?;
        let media = Client::builder()
            .cookie_store(true)
            .timeout(transfer_timeout)
            .build()?;
        Ok(Self { pages, media })
    }
}

#[async_trait]
impl SourceClient for GooglePhotosClient {
    async fn resolve(&self, album_link: &str) -> Result<ResolvedAlbum, SourceError> {
        if !is_shared_album_link(album_link) {
            return Err(SourceError::InvalidLink(album_link.to_string()));
        }

        tracing::debug!(link = album_link, "Resolving album");
        let response = self
            .pages
            .get(album_link)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::unavailable(album_link, &e))?;

        // Short links redirect; report the final page URL in errors.
        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| SourceError::unavailable(album_link, &e))?;

        parse_album_page(&final_url, &html)
    }

    async fn fetch(&self, item: &ItemDescriptor) -> Result<FetchedMedia, SourceError> {
        let response = self
            .media
            .get(&item.url)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::fetch(&item.url, &e))?;

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(content_disposition_filename);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let size = response.content_length();

        tracing::debug!(
            media_key = %item.media_key,
            size_bytes = ?size,
            "Fetching item"
        );
        let url = item.url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| SourceError::fetch(&url, &e)))
            .boxed();
        Ok(FetchedMedia {
            body,
            filename,
            content_type,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_album_links_accepted() {
        assert!(is_shared_album_link("https://photos.app.goo.gl/abc123"));
        assert!(is_shared_album_link(
            "https://photos.google.com/share/AF1QipXYZ?key=k"
        ));
    }

    #[test]
    fn test_other_links_rejected() {
        assert!(!is_shared_album_link("https://example.com/album"));
        assert!(!is_shared_album_link("photos.app.goo.gl/abc"));
        assert!(!is_shared_album_link(""));
    }

    #[tokio::test]
    async fn test_resolve_rejects_foreign_link_without_network() {
        let client =
            GooglePhotosClient::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let err = client.resolve("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, SourceError::InvalidLink(_)));
    }
}
