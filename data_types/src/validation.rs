//! Field-level validation results.
//!
//! Validation is a value, not control flow: callers get the full list of
//! problems for a payload and decide how to surface them.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Category of a field-level validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorKind {
    /// A required field is absent or empty.
    MissingRequiredField,
    /// A value is outside its enumerated domain.
    InvalidEnum,
    /// A value has the wrong primitive type.
    InvalidType,
    /// The payload carries a field the schema does not know.
    UnknownField,
}

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// The offending field name.
    pub field: String,
    /// Failure category.
    pub kind: FieldErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl FieldError {
    /// A required field is absent or empty.
    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("required field '{field}' is missing or empty");
        Self {
            field,
            kind: FieldErrorKind::MissingRequiredField,
            message,
        }
    }

    /// A value is outside its enumerated domain.
    pub fn invalid_enum(field: impl Into<String>, value: &str) -> Self {
        let field = field.into();
        let message = format!("'{value}' is not a valid value for '{field}'");
        Self {
            field,
            kind: FieldErrorKind::InvalidEnum,
            message,
        }
    }

    /// A value has the wrong primitive type.
    pub fn invalid_type(field: impl Into<String>, expected: &str) -> Self {
        let field = field.into();
        let message = format!("field '{field}' must be {expected}");
        Self {
            field,
            kind: FieldErrorKind::InvalidType,
            message,
        }
    }

    /// The payload carries a field the schema does not know.
    pub fn unknown(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("unknown field '{field}'");
        Self {
            field,
            kind: FieldErrorKind::UnknownField,
            message,
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
