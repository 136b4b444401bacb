//! Destination side: the Immich server the albums are imported into.

pub mod error;
pub mod immich;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::DestinationError;
pub use immich::ImmichClient;

/// How a job authenticates against the destination. Exactly one mode.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthConfig {
    ApiKey { api_key: String },
    Credentials { email: String, password: String },
}

impl AuthConfig {
    pub fn mode_str(&self) -> &'static str {
        match self {
            AuthConfig::ApiKey { .. } => "API_KEY",
            AuthConfig::Credentials { .. } => "CREDENTIALS",
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::ApiKey { .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"<redacted>")
                .finish(),
            AuthConfig::Credentials { email, .. } => f
                .debug_struct("Credentials")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// The account the destination authenticated us as.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// Where an upload's bytes come from.
#[derive(Debug, Clone)]
pub enum AssetData {
    Memory(Bytes),
    /// A staged file, streamed from disk on every attempt.
    File(PathBuf),
}

/// One asset to upload.
#[derive(Debug, Clone)]
pub struct AssetUpload {
    pub data: AssetData,
    pub filename: String,
    pub content_type: Option<String>,
    pub checksum: String,
    /// Stable id for the asset on the uploading "device" (the source media key).
    pub device_asset_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Result of an upload. `duplicate` is set when the server already had the
/// bytes and returned the existing asset instead of creating one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAsset {
    pub id: String,
    pub duplicate: bool,
}

/// Capabilities the engine needs from the destination server.
///
/// Upload and album association are separate calls so that each can be
/// retried on its own.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn authenticate(&self, auth: &AuthConfig) -> Result<Identity, DestinationError>;

    /// Cheap reachability check, used to tell an outage from bad items.
    async fn ping(&self) -> Result<(), DestinationError>;

    /// Idempotent: the same name always yields the same album id.
    async fn find_or_create_album(&self, name: &str) -> Result<String, DestinationError>;

    /// `None` when the server cannot answer checksum lookups.
    async fn checksum_exists(&self, checksum: &str) -> Result<Option<bool>, DestinationError>;

    async fn upload(&self, asset: AssetUpload) -> Result<UploadedAsset, DestinationError>;

    async fn associate(&self, asset_id: &str, album_id: &str) -> Result<(), DestinationError>;
}

/// Builds one destination client per job; each client carries that job's
/// session and album cache.
pub trait DestinationFactory: Send + Sync {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn Destination>, DestinationError>;
}

/// Factory for real Immich servers.
#[derive(Debug, Clone)]
pub struct ImmichFactory {
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl DestinationFactory for ImmichFactory {
    fn connect(&self, base_url: &str) -> Result<Arc<dyn Destination>, DestinationError> {
        let client = ImmichClient::new(base_url, self.request_timeout, self.transfer_timeout)?;
        Ok(Arc::new(client))
    }
}
