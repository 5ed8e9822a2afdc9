//! Error types shared by the engine, the configuration layer and the CLI

use crate::domain::fileops::FileOpError;
use crate::domain::ValueKind;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SorterError>;

#[derive(Debug, Error)]
pub enum SorterError {
    /// The provider has no value for this key. Conditions treat it as a non-match.
    #[error("attribute '{key}' is unavailable for {}", path.display())]
    AttributeUnavailable { key: String, path: PathBuf },

    #[error("type mismatch for '{subject}': expected {expected}, found {found}")]
    TypeMismatch {
        subject: String,
        expected: ValueKind,
        found: String,
    },

    #[error("operator '{operator}' is not supported for {kind} conditions")]
    UnsupportedOperator { operator: String, kind: ValueKind },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("malformed template '{template}' at offset {position}: {reason}")]
    MalformedTemplate {
        template: String,
        position: usize,
        reason: &'static str,
    },

    #[error("template '{template}' nests placeholders deeper than {max_depth}")]
    TemplateTooDeep { template: String, max_depth: usize },

    #[error("invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("no free name for {} after {attempts} attempts", path.display())]
    NameResolutionExhausted { path: PathBuf, attempts: usize },

    #[error(transparent)]
    FileOperation(#[from] FileOpError),

    #[error("command '{program}' failed: {reason}")]
    CommandFailed { program: String, reason: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SorterError {
    /// Errors caused by the rule configuration rather than by the file being processed.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            SorterError::TypeMismatch { .. }
                | SorterError::UnsupportedOperator { .. }
                | SorterError::InvalidPattern { .. }
                | SorterError::MalformedTemplate { .. }
                | SorterError::TemplateTooDeep { .. }
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, SorterError::AttributeUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_classification() {
        let err = SorterError::UnsupportedOperator {
            operator: "between".to_string(),
            kind: ValueKind::String,
        };
        assert!(err.is_configuration_error());

        let err = SorterError::NameResolutionExhausted {
            path: PathBuf::from("/tmp/a.txt"),
            attempts: 3,
        };
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_unavailable_is_not_a_configuration_error() {
        let err = SorterError::AttributeUnavailable {
            key: "pixel_width".to_string(),
            path: PathBuf::from("notes.txt"),
        };
        assert!(err.is_unavailable());
        assert!(!err.is_configuration_error());
        assert_eq!(
            err.to_string(),
            "attribute 'pixel_width' is unavailable for notes.txt"
        );
    }

    #[test]
    fn test_unsupported_operator_message() {
        let err = SorterError::UnsupportedOperator {
            operator: "matches".to_string(),
            kind: ValueKind::Numeric,
        };
        assert_eq!(
            err.to_string(),
            "operator 'matches' is not supported for numeric conditions"
        );
    }
}
