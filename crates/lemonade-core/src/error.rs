//! Unified error handling for the gateway.
//!
//! Every user-visible failure is mapped onto the OpenAI-style error JSON
//! shape `{"error": {"message", "type", "code"?}}` before it leaves the
//! process. The variants here mirror the failure classes the gateway can
//! actually produce, so handlers never have to invent ad-hoc shapes.

use serde_json::{json, Value};

/// Unified error type for the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors (missing resource files, bad flags).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested model is not in the catalog.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// An inference request arrived while no matching backend was loaded.
    #[error("No model loaded{}", fmt_opt(.0))]
    ModelNotLoaded(Option<String>),

    /// The loaded backend does not advertise the requested capability.
    #[error("{operation} is not supported by the '{recipe}' backend")]
    UnsupportedOperation { operation: String, recipe: String },

    /// Request body failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network-level failure talking to the hub or a backend.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend answered with a non-success status.
    #[error("Backend error ({status}): {message}")]
    Backend {
        message: String,
        status: u16,
        body: String,
    },

    /// Artifact download failed after retries were exhausted.
    #[error("Download error: {0}")]
    Download(String),

    /// The caller cancelled an in-progress download.
    #[error("Download cancelled")]
    Cancelled,

    /// Child-process management failure (spawn, early exit, kill).
    #[error("Process error: {0}")]
    Process(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem errors.
    #[error("I/O error: {0}")]
    Io(String),

    /// Deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn fmt_opt(name: &Option<String>) -> String {
    match name {
        Some(n) => format!(": {n}"),
        None => String::new(),
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn model_not_found(name: impl Into<String>) -> Self {
        Self::ModelNotFound(name.into())
    }

    pub fn model_not_loaded(name: impl Into<String>) -> Self {
        Self::ModelNotLoaded(Some(name.into()))
    }

    pub fn unsupported(operation: impl Into<String>, recipe: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            recipe: recipe.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn backend(message: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            status,
            body: body.into(),
        }
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wire-level `type` field for the error JSON shape.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration_error",
            Error::ModelNotFound(_) => "model_not_found",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::UnsupportedOperation { .. } => "invalid_request_error",
            Error::Validation(_) => "invalid_request_error",
            Error::Network(_) => "network_error",
            Error::Backend { .. } => "backend_error",
            Error::Download(_) => "download_error",
            Error::Cancelled => "cancelled",
            Error::Process(_) => "process_error",
            Error::Serialization(_) => "invalid_request_error",
            Error::Io(_) => "internal_error",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal_error",
        }
    }

    /// HTTP status the error maps to when it reaches a handler.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ModelNotFound(_) => 404,
            Error::ModelNotLoaded(_) => 400,
            Error::UnsupportedOperation { .. } => 422,
            Error::Validation(_) | Error::Serialization(_) => 400,
            Error::Backend { status, .. } if *status >= 400 => 502,
            Error::Network(_) => 502,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Render as the OpenAI-style error body.
    pub fn to_error_json(&self) -> Value {
        let mut err = json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let Error::UnsupportedOperation { operation, .. } = self {
            err["code"] = json!(format!(
                "unsupported_{}",
                operation.to_lowercase().replace(' ', "_")
            ));
        }
        if let Error::Backend { status, body, .. } = self {
            err["code"] = json!(status);
            if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                err["backend_response"] = parsed;
            } else if !body.is_empty() {
                err["backend_response"] = json!(body);
            }
        }
        json!({ "error": err })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_shape() {
        let err = Error::model_not_loaded("Qwen3-0.6B-GGUF");
        let body = err.to_error_json();
        assert_eq!(body["error"]["type"], "model_not_loaded");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Qwen3-0.6B-GGUF"));
    }

    #[test]
    fn test_unsupported_operation_maps_to_422() {
        let err = Error::unsupported("Embeddings", "sd-cpp");
        assert_eq!(err.status_code(), 422);
        let body = err.to_error_json();
        assert_eq!(body["error"]["code"], "unsupported_embeddings");
    }

    #[test]
    fn test_backend_error_echoes_body() {
        let err = Error::backend("llama-server request failed", 500, r#"{"oops":true}"#);
        let body = err.to_error_json();
        assert_eq!(body["error"]["backend_response"]["oops"], true);
        assert_eq!(body["error"]["code"], 500);
    }
}
