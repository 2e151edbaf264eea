use std::path::PathBuf;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

const INTERNAL_ERROR_PREFIX: &str = "internal_api_error_";

/// Every error the client can produce.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no username configured for {site}; set WIKI_USERNAME or [wiki].username")]
    NoUsername { site: String },

    #[error("MediaWiki login failed: {reason}")]
    Auth { reason: String },

    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },

    #[error("MediaWiki internal exception {class}: {info}")]
    Internal { class: String, info: String },

    #[error("MediaWiki API rejected token: {info}")]
    BadToken { info: String },

    #[error("MediaWiki API lagged after {attempts} attempts (last lag {lag}s)")]
    MaxLag { attempts: usize, lag: u64 },

    #[error("API module not found: {0}")]
    NotFound(String),

    #[error("MediaWiki API request failed with HTTP {0}")]
    Status(StatusCode),

    #[error("failed to call MediaWiki API")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode MediaWiki API JSON")]
    Json(#[from] serde_json::Error),

    #[error("unexpected MediaWiki API response: {0}")]
    InvalidResponse(String),

    #[error("I/O failure on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Builds the error for a top-level `error` object of an API response.
    pub fn from_api_error(error: &Value) -> Self {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info")
            .to_string();
        match ApiErrorKind::classify(&code) {
            ApiErrorKind::BadToken => Self::BadToken { info },
            ApiErrorKind::Internal => Self::Internal {
                class: code[INTERNAL_ERROR_PREFIX.len()..].to_string(),
                info,
            },
            _ => Self::Api { code, info },
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The server error code, when this error came from the API.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            Self::BadToken { .. } => Some("badtoken"),
            _ => None,
        }
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::BadToken { .. } => ApiErrorKind::BadToken,
            Self::Internal { .. } => ApiErrorKind::Internal,
            Self::Api { code, .. } => ApiErrorKind::classify(code),
            _ => ApiErrorKind::Fatal,
        }
    }
}

/// Classification of server error codes, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    BadToken,
    LoginRequired,
    MaxLag,
    Internal,
    Fatal,
}

impl ApiErrorKind {
    pub fn classify(code: &str) -> Self {
        match code {
            "badtoken" => Self::BadToken,
            "readapidenied" | "assertuserfailed" | "assertbotfailed" => Self::LoginRequired,
            "maxlag" => Self::MaxLag,
            code if code.starts_with(INTERNAL_ERROR_PREFIX) => Self::Internal,
            _ => Self::Fatal,
        }
    }
}
