use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;

use super::{
    AssetData, AssetUpload, AuthConfig, Destination, DestinationError, Identity, UploadedAsset,
};

const API_KEY_HEADER: &str = "x-api-key";
const CHECKSUM_HEADER: &str = "x-immich-checksum";
const DEVICE_ID: &str = "gphotos2immich";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct AlbumSummary {
    id: String,
    #[serde(rename = "albumName")]
    album_name: String,
}

#[derive(Debug, Deserialize)]
struct CreatedAsset {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct BulkCheckResponse {
    results: Vec<BulkCheckResult>,
}

#[derive(Debug, Deserialize)]
struct BulkCheckResult {
    action: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlbumAssetResult {
    id: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Normalize a user-supplied server URL: trailing slashes and a trailing
/// `/api` are dropped because every path below is built as `{base}/api/...`.
pub fn normalize_base_url(raw: &str) -> Result<String, DestinationError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(DestinationError::InvalidUrl(raw.to_string()));
    }
    let base = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    Ok(base.to_string())
}

/// Immich REST client for one job.
///
/// Holds the job's auth header once [`Destination::authenticate`] succeeds
/// and a name→id album cache so repeated lookups within a job never create
/// a second album.
pub struct ImmichClient {
    base_url: String,
    api: Client,
    transfer: Client,
    auth_header: RwLock<Option<(HeaderName, HeaderValue)>>,
    albums: tokio::sync::Mutex<HashMap<String, String>>,
    checksum_lookup_unsupported: AtomicBool,
}

impl std::fmt::Debug for ImmichClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmichClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ImmichClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Result<Self, DestinationError> {
        let base_url = normalize_base_url(base_url)?;
        let api = Client::builder().timeout(request_timeout).build()?;
        let transfer = Client::builder().timeout(transfer_timeout).build()?;
        Ok(Self {
            base_url,
            api,
            transfer,
            auth_header: RwLock::new(None),
            albums: tokio::sync::Mutex::new(HashMap::new()),
            checksum_lookup_unsupported: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn request(&self, client: &Client, method: Method, path: &str) -> RequestBuilder {
        let builder = client.request(method, self.url(path));
        let header = self.auth_header.read().ok().and_then(|h| h.clone());
        match header {
            Some((name, value)) => builder.header(name, value),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, DestinationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DestinationError::from_status(status.as_u16(), &body))
    }

    fn set_auth_header(&self, name: HeaderName, value: HeaderValue) {
        if let Ok(mut guard) = self.auth_header.write() {
            *guard = Some((name, value));
        }
    }
}

/// Multipart body for one attempt. Staged files are reopened and streamed
/// from disk; memory payloads share their buffer.
async fn asset_part(data: &AssetData) -> Result<Part, DestinationError> {
    match data {
        AssetData::Memory(bytes) => Ok(Part::stream_with_length(
            Body::from(bytes.clone()),
            bytes.len() as u64,
        )),
        AssetData::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| DestinationError::Payload(format!("{}: {}", path.display(), e)))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| DestinationError::Payload(format!("{}: {}", path.display(), e)))?
                .len();
            Ok(Part::stream_with_length(Body::from(file), len))
        }
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, DestinationError> {
    HeaderValue::from_str(raw)
        .map_err(|_| DestinationError::Auth("credential contains invalid characters".to_string()))
}

#[async_trait]
impl Destination for ImmichClient {
    async fn authenticate(&self, auth: &AuthConfig) -> Result<Identity, DestinationError> {
        match auth {
            AuthConfig::ApiKey { api_key } => {
                self.set_auth_header(HeaderName::from_static(API_KEY_HEADER), header_value(api_key)?);
            }
            AuthConfig::Credentials { email, password } => {
                let response = self
                    .api
                    .post(self.url("/auth/login"))
                    .json(&json!({ "email": email, "password": password }))
                    .send()
                    .await?;
                let login: LoginResponse = Self::check(response).await?.json().await?;
                self.set_auth_header(
                    AUTHORIZATION,
                    header_value(&format!("Bearer {}", login.access_token))?,
                );
            }
        }

        let response = self.request(&self.api, Method::GET, "/users/me").send().await?;
        let identity: Identity = Self::check(response).await?.json().await?;
        tracing::info!(
            server = %self.base_url,
            user = %identity.email,
            mode = auth.mode_str(),
            "Authenticated with Immich"
        );
        Ok(identity)
    }

    async fn ping(&self) -> Result<(), DestinationError> {
        let response = self
            .request(&self.api, Method::GET, "/server/ping")
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn find_or_create_album(&self, name: &str) -> Result<String, DestinationError> {
        // Held across the lookup and the create so concurrent callers
        // cannot both decide the album is missing.
        let mut cache = self.albums.lock().await;
        if let Some(id) = cache.get(name) {
            return Ok(id.clone());
        }

        let response = self.request(&self.api, Method::GET, "/albums").send().await?;
        let existing: Vec<AlbumSummary> = Self::check(response).await?.json().await?;
        if let Some(album) = existing.into_iter().find(|a| a.album_name == name) {
            tracing::debug!(album = name, id = %album.id, "Reusing existing album");
            cache.insert(name.to_string(), album.id.clone());
            return Ok(album.id);
        }

        let response = self
            .request(&self.api, Method::POST, "/albums")
            .json(&json!({ "albumName": name }))
            .send()
            .await?;
        let created: AlbumSummary = Self::check(response).await?.json().await?;
        tracing::info!(album = name, id = %created.id, "Created album");
        cache.insert(name.to_string(), created.id.clone());
        Ok(created.id)
    }

    async fn checksum_exists(&self, checksum: &str) -> Result<Option<bool>, DestinationError> {
        if self.checksum_lookup_unsupported.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let response = self
            .request(&self.api, Method::POST, "/assets/bulk-upload-check")
            .json(&json!({ "assets": [{ "id": checksum, "checksum": checksum }] }))
            .send()
            .await?;

        if matches!(response.status().as_u16(), 404 | 405 | 501) {
            tracing::warn!(
                server = %self.base_url,
                "Server does not support checksum lookup; uploading without pre-check"
            );
            self.checksum_lookup_unsupported.store(true, Ordering::Relaxed);
            return Ok(None);
        }

        let body: BulkCheckResponse = Self::check(response).await?.json().await?;
        Ok(Some(body.results.iter().any(|r| {
            r.action == "reject" && r.reason.as_deref() == Some("duplicate")
        })))
    }

    async fn upload(&self, asset: AssetUpload) -> Result<UploadedAsset, DestinationError> {
        let created_at = asset.created_at.unwrap_or_else(Utc::now).to_rfc3339();
        let mut part = asset_part(&asset.data)
            .await?
            .file_name(asset.filename.clone());
        if let Some(ct) = &asset.content_type {
            part = part
                .mime_str(ct)
                .map_err(|e| DestinationError::Upload(format!("invalid content type {}: {}", ct, e)))?;
        }
        let form = Form::new()
            .text("deviceAssetId", asset.device_asset_id.clone())
            .text("deviceId", DEVICE_ID)
            .text("fileCreatedAt", created_at.clone())
            .text("fileModifiedAt", created_at)
            .text("isFavorite", "false")
            .part("assetData", part);

        let response = self
            .request(&self.transfer, Method::POST, "/assets")
            .header(CHECKSUM_HEADER, asset.checksum.as_str())
            .multipart(form)
            .send()
            .await?;

        let created: CreatedAsset = match Self::check(response).await {
            Ok(r) => r.json().await?,
            Err(DestinationError::Api { status, message }) => {
                return Err(DestinationError::Upload(format!(
                    "{} rejected (HTTP {}): {}",
                    asset.filename, status, message
                )))
            }
            Err(e) => return Err(e),
        };

        Ok(UploadedAsset {
            duplicate: created.status == "duplicate",
            id: created.id,
        })
    }

    async fn associate(&self, asset_id: &str, album_id: &str) -> Result<(), DestinationError> {
        let response = self
            .request(&self.api, Method::PUT, &format!("/albums/{}/assets", album_id))
            .json(&json!({ "ids": [asset_id] }))
            .send()
            .await?;
        let results: Vec<AlbumAssetResult> = Self::check(response).await?.json().await?;

        match results.into_iter().find(|r| r.id == asset_id) {
            Some(r) if r.success || r.error.as_deref() == Some("duplicate") => Ok(()),
            Some(r) => Err(DestinationError::Api {
                status: 200,
                message: format!(
                    "adding {} to album {} failed: {}",
                    asset_id,
                    album_id,
                    r.error.unwrap_or_else(|| "unknown error".to_string())
                ),
            }),
            None => Err(DestinationError::Api {
                status: 200,
                message: format!("album {} did not acknowledge asset {}", album_id, asset_id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://photos.example.com/").unwrap(),
            "https://photos.example.com"
        );
        assert_eq!(
            normalize_base_url(" http://10.0.0.2:2283/api/ ").unwrap(),
            "http://10.0.0.2:2283"
        );
        assert!(matches!(
            normalize_base_url("photos.example.com"),
            Err(DestinationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_url_building() {
        let client = ImmichClient::new(
            "https://immich.local/api",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.url("/albums"), "https://immich.local/api/albums");
    }

    #[test]
    fn test_bulk_check_response_parsing() {
        let body: BulkCheckResponse = serde_json::from_str(
            r#"{"results":[{"id":"abc","action":"reject","reason":"duplicate","assetId":"1"}]}"#,
        )
        .unwrap();
        assert_eq!(body.results[0].action, "reject");
        assert_eq!(body.results[0].reason.as_deref(), Some("duplicate"));
    }

    #[test]
    fn test_created_asset_duplicate_status() {
        let created: CreatedAsset =
            serde_json::from_str(r#"{"id":"a1","status":"duplicate"}"#).unwrap();
        assert_eq!(created.status, "duplicate");
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_payload_error() {
        let data = AssetData::File("/nonexistent/staged/x.jpg".into());
        match asset_part(&data).await {
            Err(DestinationError::Payload(message)) => assert!(message.contains("x.jpg")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("missing file produced a part"),
        }
    }

    #[tokio::test]
    async fn test_staged_file_part_builds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"bytes").unwrap();
        assert!(asset_part(&AssetData::File(path)).await.is_ok());
        assert!(asset_part(&AssetData::Memory(bytes::Bytes::from_static(b"x")))
            .await
            .is_ok());
    }

    #[test]
    fn test_api_key_with_newline_rejected() {
        assert!(matches!(
            header_value("bad\nkey"),
            Err(DestinationError::Auth(_))
        ));
    }
}
