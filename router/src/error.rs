//! The wire error envelope.

use serde::{Deserialize, Serialize};

/// Closed set of wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or invalid request.
    BadRequest,
    /// No usable credentials.
    Unauthorized,
    /// Valid credentials, insufficient rights.
    Forbidden,
    /// Unknown resource.
    NotFound,
    /// Too many requests.
    RateLimited,
    /// Anything else.
    Error,
    /// Credentials present but rejected.
    AuthenticationFailed,
}

/// The envelope every error response carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Machine-readable code.
    pub error: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail, e.g. per-field validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// An envelope without details.
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            details: None,
        }
    }

    /// An envelope with a structured details map.
    pub fn with_details(
        error: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error,
            message: message.into(),
            details: Some(details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_snake_case() {
        let err = ApiError::new(ErrorCode::AuthenticationFailed, "bad key");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"authentication_failed\""));
        assert!(!json.contains("details"));
    }
}
