use thiserror::Error;

use crate::retry::Retryable;

/// Source-side failures, classified for the retry loop.
///
/// Transport errors, 429 and 5xx answers are transient. Any other HTTP
/// status means the album or item is not reachable and retrying will not
/// change that.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Not a shared album link: {0}")]
    InvalidLink(String),

    #[error("Source unavailable for {url}: {message}")]
    Unavailable {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Could not parse album page {url}: {reason}")]
    Format { url: String, reason: String },

    #[error("Album {url} contains no items")]
    Empty { url: String },

    #[error("Failed to fetch {url}: {message}")]
    Fetch {
        url: String,
        status: Option<u16>,
        message: String,
    },
}

fn transient_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(code) => code == 429 || code >= 500,
    }
}

impl SourceError {
    pub(crate) fn unavailable(url: &str, err: &reqwest::Error) -> Self {
        SourceError::Unavailable {
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }

    pub(crate) fn fetch(url: &str, err: &reqwest::Error) -> Self {
        SourceError::Fetch {
            url: url.to_string(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            SourceError::Unavailable { status, .. } | SourceError::Fetch { status, .. } => {
                transient_status(*status)
            }
            SourceError::InvalidLink(_) | SourceError::Format { .. } | SourceError::Empty { .. } => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_err(status: Option<u16>) -> SourceError {
        SourceError::Fetch {
            url: "u".into(),
            status,
            message: "m".into(),
        }
    }

    #[test]
    fn test_transport_errors_retryable() {
        assert!(fetch_err(None).is_retryable());
    }

    #[test]
    fn test_server_errors_and_rate_limit_retryable() {
        assert!(fetch_err(Some(500)).is_retryable());
        assert!(fetch_err(Some(503)).is_retryable());
        assert!(fetch_err(Some(429)).is_retryable());
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!fetch_err(Some(404)).is_retryable());
        assert!(!fetch_err(Some(403)).is_retryable());
        let e = SourceError::Unavailable {
            url: "u".into(),
            status: Some(410),
            message: "gone".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_format_and_empty_not_retryable() {
        assert!(!SourceError::Format {
            url: "u".into(),
            reason: "r".into()
        }
        .is_retryable());
        assert!(!SourceError::Empty { url: "u".into() }.is_retryable());
        assert!(!SourceError::InvalidLink("x".into()).is_retryable());
    }
}
