use thiserror::Error;

/// Failure of an upstream call.
///
/// `Status` mirrors the HTTP response: `name` is the canonical reason
/// phrase and `retry_after` is only populated for 429 responses.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{name} ({status})")]
    Status {
        name: String,
        status: u16,
        retry_after: Option<u64>,
    },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
    #[error("invalid request url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ClientError {
    pub fn from_status(status: reqwest::StatusCode, retry_after: Option<u64>) -> Self {
        ClientError::Status {
            name: status
                .canonical_reason()
                .unwrap_or("Unknown Status")
                .to_string(),
            status: status.as_u16(),
            retry_after: if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                Some(retry_after.unwrap_or(1))
            } else {
                None
            },
        }
    }

    /// Builds a status error from a bare numeric code.
    pub fn from_code(status: u16, retry_after: Option<u64>) -> Self {
        match reqwest::StatusCode::from_u16(status) {
            Ok(status) => Self::from_status(status, retry_after),
            Err(_) => ClientError::Status {
                name: "Unknown Status".to_string(),
                status,
                retry_after: None,
            },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Http(err) => err.status().map(|s| s.as_u16()),
            ClientError::InvalidTokenResponse(_) | ClientError::InvalidUrl(_) => None,
        }
    }

    /// Server-requested backoff in seconds when the call was rate limited.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ClientError::Status {
                status: 429,
                retry_after,
                ..
            } => Some(retry_after.unwrap_or(1)),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.retry_after().is_some()
    }
}
