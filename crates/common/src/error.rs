//! Error types for Fleet

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Fleet Error
pub type Result<T> = std::result::Result<T, Error>;

/// Fleet error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Name already registered: {kind} {name}")]
    DuplicateName { kind: String, name: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("{} node(s) failed teardown: {}", .0.len(), format_failures(.0))]
    BulkTeardown(Vec<TeardownFailure>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Error decoded from a remote [`ErrorBody`]; displays the remote message
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn duplicate(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::DuplicateName {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Stable tag for this error, used on the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::DuplicateName { .. } => ErrorKind::DuplicateName,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Provisioning(_) => ErrorKind::Provisioning,
            Error::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Error::InvalidStateTransition { .. } => ErrorKind::InvalidState,
            Error::Runtime(_) => ErrorKind::Runtime,
            Error::BulkTeardown(_) => ErrorKind::Teardown,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Serialization(_) => ErrorKind::Validation,
            Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Remote { kind, .. } => *kind,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A single node that could not be torn down during a bulk sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownFailure {
    pub name: String,
    pub message: String,
}

fn format_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.name, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error kind tags shared by servers and clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicateName,
    Validation,
    Provisioning,
    InvalidQuery,
    InvalidState,
    Runtime,
    Teardown,
    Transport,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::Validation => "validation",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Teardown => "teardown",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        };
        f.write_str(tag)
    }
}

/// Structured error response carried over the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::Remote {
            kind: body.kind,
            message: body.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_snake_case() {
        let body = ErrorBody::from(&Error::not_found("service", "web"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert_eq!(ErrorKind::InvalidQuery.to_string(), "invalid_query");
    }

    #[test]
    fn test_body_maps_back_to_variant() {
        let body = ErrorBody {
            kind: ErrorKind::InvalidQuery,
            message: "empty tag list".to_string(),
        };
        let err = Error::from(body);
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert_eq!(err.to_string(), "empty tag list");

        let body = ErrorBody::from(&Error::not_found("key", "missing"));
        let err = Error::from(body);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Resource not found: key with id missing");
        assert_eq!(ErrorBody::from(&err).message, err.to_string());
    }

    #[test]
    fn test_bulk_teardown_lists_every_failure() {
        let err = Error::BulkTeardown(vec![
            TeardownFailure {
                name: "a".to_string(),
                message: "boom".to_string(),
            },
            TeardownFailure {
                name: "b".to_string(),
                message: "busy".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 node(s)"));
        assert!(msg.contains("a: boom"));
        assert!(msg.contains("b: busy"));
        assert_eq!(err.kind(), ErrorKind::Teardown);
    }
}
