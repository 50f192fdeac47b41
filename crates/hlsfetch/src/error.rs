use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. } | Self::Playlist { .. } | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { .. }
            | Self::Io { .. }
            | Self::Decryption { .. }
            | Self::Timeout { .. }
            | Self::Internal { .. } => true,
        }
    }

    /// True when the error is the stop sentinel rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
