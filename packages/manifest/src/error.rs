// ABOUTME: Error types for manifest decoding and validation
// ABOUTME: Both variants are terminal for an upload, no partial manifest is returned

use std::fmt;
use thiserror::Error;

/// Why a manifest field was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    Missing,
    Empty,
    Duplicate,
    Invalid(String),
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Empty => write!(f, "empty"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Invalid(detail) => write!(f, "invalid: {}", detail),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Malformed YAML: {0}")]
    Syntax(String),

    #[error(
        "Invalid manifest field '{field}'{}: {reason}",
        container_suffix(.container)
    )]
    Validation {
        field: String,
        reason: ValidationReason,
        container: Option<String>,
    },
}

fn container_suffix(container: &Option<String>) -> String {
    match container {
        Some(name) => format!(" in container '{}'", name),
        None => String::new(),
    }
}

impl ParseError {
    pub fn validation(field: &str, reason: ValidationReason) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason,
            container: None,
        }
    }

    /// Attach the offending container entry to a validation error
    pub fn in_container(self, name: impl Into<String>) -> Self {
        match self {
            Self::Validation { field, reason, .. } => Self::Validation {
                field,
                reason,
                container: Some(name.into()),
            },
            other => other,
        }
    }

    /// Manifest field the error refers to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => Some(field),
            Self::Syntax(_) => None,
        }
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Validation { container, .. } => container.as_deref(),
            Self::Syntax(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;
