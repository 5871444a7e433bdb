//! Error types for the CoucheStor control plane

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the control plane
#[derive(Error, Debug)]
pub enum Error {
    /// Entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Entity exists with incompatible parameters
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// Not enough pools/nodes/capacity to satisfy a placement
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Stale version supplied on update; re-read and retry
    #[error("Version conflict on {kind} {id}: expected {expected}, found {found}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    /// Node did not answer within the RPC deadline
    #[error("Request to node {node} timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    /// Caller supplied an invalid request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation was superseded (e.g. a delete cancelled an in-flight create)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Node agent replied with an error or an unexpected reply
    #[error("Node {node} rejected {command}: {reason}")]
    NodeRejected {
        node: String,
        command: String,
        reason: String,
    },

    /// Node agent spoke an incompatible protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store unavailable or corrupt; fatal to the process
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Error::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether a retry with backoff may succeed (node unreachable).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::InsufficientResources(_) => "insufficient_resources",
            Error::Conflict { .. } => "conflict",
            Error::Timeout { .. } => "timeout",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::Cancelled(_) => "cancelled",
            Error::NodeRejected { .. } => "node_rejected",
            Error::Protocol(_) => "protocol",
            Error::Kube(_) => "kube",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound { .. } => tonic::Status::not_found(message),
            Error::AlreadyExists { .. } => tonic::Status::already_exists(message),
            Error::InsufficientResources(_) => tonic::Status::resource_exhausted(message),
            Error::Conflict { .. } | Error::Cancelled(_) => tonic::Status::aborted(message),
            Error::Timeout { .. } => tonic::Status::unavailable(message),
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            Error::FailedPrecondition(_) => tonic::Status::failed_precondition(message),
            _ => tonic::Status::internal(message),
        }
    }
}
