//! Error types for the relay.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    // Passes the inner message through untouched: validation messages are
    // operator-visible and must not grow a prefix.
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{message}")]
    BadRequest { message: String },

    #[error("{message}")]
    Unauthorized { message: String },

    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("failed to parse upstream response: {message}")]
    UpstreamShape { message: String },

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RelayError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest {
            message: msg.into(),
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    pub fn upstream_shape(msg: impl Into<String>) -> Self {
        Self::UpstreamShape {
            message: msg.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream {
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
        }
    }

    /// HTTP status to surface to the client for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Unauthorized { .. } => 401,
            // A 504 from the upstream is itself a timeout signal.
            Self::Upstream { status: 504, .. } | Self::UpstreamTimeout => 504,
            Self::Upstream { .. } | Self::UpstreamConnect(_) | Self::UpstreamShape { .. } => 502,
            _ => 500,
        }
    }

    /// Anthropic error class for the error envelope.
    pub fn error_type(&self) -> &'static str {
        match self.status() {
            400 => "invalid_request_error",
            401 => "authentication_error",
            504 => "timeout_error",
            502 => "api_error",
            _ => "internal_error",
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout
        } else {
            Self::UpstreamConnect(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
