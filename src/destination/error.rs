use thiserror::Error;

use crate::retry::Retryable;

/// Destination failures, split by how the engine reacts to them.
///
/// `Auth` stops the whole job. `RateLimited`, `Unavailable` and transport
/// errors are transient. `Upload` is retried a bounded number of times and
/// then fails only the item. `Api` and `Payload` cover failures that will
/// not change on retry.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Rate limited by destination")]
    RateLimited,

    #[error("Destination unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Destination API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid destination URL: {0}")]
    InvalidUrl(String),

    #[error("Cannot read upload payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl DestinationError {
    /// Map a non-success HTTP status to an error.
    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        let message = body.chars().take(300).collect::<String>();
        match status {
            401 | 403 => DestinationError::Auth(message),
            429 => DestinationError::RateLimited,
            s if s >= 500 => DestinationError::Unavailable { status: s, message },
            s => DestinationError::Api { status: s, message },
        }
    }

    /// True for errors that must stop the job rather than the item.
    pub fn is_job_fatal(&self) -> bool {
        matches!(self, DestinationError::Auth(_) | DestinationError::InvalidUrl(_))
    }

    /// True when the server itself looks down rather than unhappy with one
    /// request: 5xx answers and transport failures.
    pub fn is_outage(&self) -> bool {
        matches!(
            self,
            DestinationError::Unavailable { .. } | DestinationError::Http(_)
        )
    }
}

impl Retryable for DestinationError {
    fn is_retryable(&self) -> bool {
        match self {
            DestinationError::RateLimited
            | DestinationError::Unavailable { .. }
            | DestinationError::Upload(_)
            | DestinationError::Http(_) => true,
            DestinationError::Auth(_)
            | DestinationError::Api { .. }
            | DestinationError::InvalidUrl(_)
            | DestinationError::Payload(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            DestinationError::from_status(401, "no"),
            DestinationError::Auth(_)
        ));
        assert!(matches!(
            DestinationError::from_status(403, "no"),
            DestinationError::Auth(_)
        ));
        assert!(matches!(
            DestinationError::from_status(429, ""),
            DestinationError::RateLimited
        ));
        assert!(matches!(
            DestinationError::from_status(502, ""),
            DestinationError::Unavailable { status: 502, .. }
        ));
        assert!(matches!(
            DestinationError::from_status(400, "bad"),
            DestinationError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn test_auth_is_fatal_and_not_retried() {
        let e = DestinationError::Auth("expired".into());
        assert!(e.is_job_fatal());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_transient_errors_retryable() {
        assert!(DestinationError::RateLimited.is_retryable());
        assert!(DestinationError::Upload("500".into()).is_retryable());
        assert!(!DestinationError::RateLimited.is_job_fatal());
    }

    #[test]
    fn test_outage_classification() {
        assert!(DestinationError::from_status(503, "down").is_outage());
        assert!(!DestinationError::Upload("bad file".into()).is_outage());
        assert!(!DestinationError::RateLimited.is_outage());
        assert!(!DestinationError::Payload("gone".into()).is_retryable());
    }

    #[test]
    fn test_body_truncated_in_message() {
        let body = "x".repeat(1000);
        match DestinationError::from_status(400, &body) {
            DestinationError::Api { message, .. } => assert_eq!(message.len(), 300),
            other => panic!("unexpected {other:?}"),
        }
    }
}
