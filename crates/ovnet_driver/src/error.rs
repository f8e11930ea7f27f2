//! Driver error types.

use ovnet_core::StoreError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors returned by driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The caller supplied invalid input. Never retried.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A network, endpoint, subnet or peer is unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is valid but not allowed in the current state.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Local or global store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The host networking service rejected a request.
    #[error("Dataplane error: {0}")]
    Dataplane(String),

    /// The sandbox abstraction rejected a request.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Gossip or membership failure.
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// A peer record from the membership channel could not be decoded.
    #[error("Malformed peer record: {0}")]
    MalformedPeer(String),

    /// An internal failure the caller may log and continue past.
    #[error("{0}")]
    Maskable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Broad classification used by the orchestrator to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid input; must be corrected by the caller.
    Configuration,
    /// Something the caller expected to exist does not.
    NotFound,
    /// Not allowed right now.
    Forbidden,
    /// An optimistic store write lost a race.
    Conflict,
    /// An external collaborator failed.
    External,
    /// Bad data from a remote host.
    RemoteData,
    Internal,
}

/// Whether the operation that produced an error can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Log and carry on.
    Recoverable,
    /// Abort the operation in progress.
    Fatal,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::Configuration,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::External,
            Self::Dataplane(_) | Self::Sandbox(_) | Self::Cluster(_) => ErrorKind::External,
            Self::MalformedPeer(_) => ErrorKind::RemoteData,
            Self::Maskable(_) | Self::Internal(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::MalformedPeer(_) | Self::Maskable(_) => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    /// Transient failures the orchestrator may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

// ---------------------------------------------------------------------------
// Best-effort helpers
// ---------------------------------------------------------------------------

/// Makes best-effort call sites explicit instead of silently discarding errors.
pub trait ResultExt<T> {
    /// Log a failure as a warning and continue with `None`.
    fn best_effort(self, what: &str) -> Option<T>;
}

impl<T, E: Into<DriverError>> ResultExt<T> for std::result::Result<T, E> {
    fn best_effort(self, what: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                let e: DriverError = e.into();
                warn!("{what} failed (ignored): {e}");
                None
            }
        }
    }
}
