use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification carried on every failed job response as `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnsupportedLanguage,
    Fetch,
    ModelLoad,
    Inference,
    Encoding,
    Storage,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::Fetch => "fetch",
            ErrorKind::ModelLoad => "model_load",
            ErrorKind::Inference => "inference",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Storage => "storage",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type shared by every component.
///
/// Cloneable so that a single-flight computation can hand the same failure to
/// every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Failed to fetch voice sample: {message}")]
    Fetch { message: String, transient: bool },

    #[error("Model load error ({model}): {message}")]
    ModelLoad { model: String, message: String },

    #[error("Inference error: {message}")]
    Inference { message: String, transient: bool },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Job exceeded execution window of {0} ms")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SynthesisError::Validation(_) => ErrorKind::Validation,
            SynthesisError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            SynthesisError::Fetch { .. } => ErrorKind::Fetch,
            SynthesisError::ModelLoad { .. } => ErrorKind::ModelLoad,
            SynthesisError::Inference { .. } => ErrorKind::Inference,
            SynthesisError::Encoding(_) => ErrorKind::Encoding,
            SynthesisError::Storage(_) => ErrorKind::Storage,
            SynthesisError::Timeout(_) => ErrorKind::Timeout,
            SynthesisError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether resubmitting the same job unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SynthesisError::Fetch { transient, .. } => *transient,
            SynthesisError::Inference { transient, .. } => *transient,
            SynthesisError::Storage(_) | SynthesisError::Timeout(_) => true,
            SynthesisError::ModelLoad { .. } => true,
            _ => false,
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        SynthesisError::Fetch {
            message: message.into(),
            transient: false,
        }
    }

    pub fn fetch_transient(message: impl Into<String>) -> Self {
        SynthesisError::Fetch {
            message: message.into(),
            transient: true,
        }
    }

    pub fn inference(message: impl Into<String>, transient: bool) -> Self {
        SynthesisError::Inference {
            message: message.into(),
            transient,
        }
    }
}

impl From<std::io::Error> for SynthesisError {
    fn from(e: std::io::Error) -> Self {
        SynthesisError::Internal(format!("IO error: {}", e))
    }
}

impl From<serde_json::Error> for SynthesisError {
    fn from(e: serde_json::Error) -> Self {
        SynthesisError::Internal(format!("Serialization error: {}", e))
    }
}

impl From<hound::Error> for SynthesisError {
    fn from(e: hound::Error) -> Self {
        SynthesisError::Encoding(format!("WAV error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, SynthesisError>;
