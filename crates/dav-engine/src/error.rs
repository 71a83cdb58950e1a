//! Error handling and status mapping for the DAV engine.
//!
//! Each layer has its own error type ([`StoreError`] for storage backends,
//! [`TransportError`] for the remote transfer client, [`PathError`] for
//! request path parsing). They all convert into [`DavError`], which carries
//! the HTTP status a handler should answer with via [`DavError::status`].

use crate::locks::ActiveLock;
use crate::path::PathError;
use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors reported by a [`Store`](crate::store::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The handle or name does not refer to a live resource.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A resource with this name already exists in the collection.
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// A collection operation was attempted on a document.
    #[error("Not a collection: {0}")]
    NotACollection(String),

    /// A document operation was attempted on a collection.
    #[error("Not a document: {0}")]
    NotADocument(String),

    /// The name is not acceptable as a member name.
    #[error("Invalid member name: {0:?}")]
    InvalidName(String),

    /// IO error from the backend.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by a remote [`Transport`](crate::transport::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the connection failed.
    #[error("Request to {url} failed: {source}")]
    Request {
        /// Target URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The remote server answered with a non-success status.
    #[error("{url} answered {status}")]
    Status {
        /// Target URL.
        url: String,
        /// Status returned by the remote server.
        status: StatusCode,
    },

    /// The HTTP client could not be set up.
    #[error("HTTP client setup failed: {0}")]
    Client(String),

    /// The URL cannot be used as a transfer destination.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// The originating request was cancelled mid-transfer.
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransportError {
    /// Status returned by the remote server, if the failure was a status reply.
    pub fn remote_status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Top-level engine error surfaced to method handlers.
#[derive(Debug, Error)]
pub enum DavError {
    /// Malformed or escaping request path.
    #[error("Invalid path: {0}")]
    Invalid(#[from] PathError),

    /// Malformed request that is not a path problem.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resolution failure.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource is locked and the caller did not present the token.
    #[error("Resource is locked by {}", .0.token)]
    Locked(Box<ActiveLock>),

    /// Type mismatch, missing parent, or another state conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A conditional request (lock token assertion, overwrite) failed.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The operation is never allowed on this resource (e.g. writing a live property).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The method does not apply to the resource in its current state.
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The originating request was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Storage backend failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DavError {
    /// HTTP status a handler should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::Invalid(_) | DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::NotFound(_) => StatusCode::NOT_FOUND,
            DavError::Locked(_) => StatusCode::LOCKED,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DavError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            DavError::Store(e) => store_error_status(e),
            DavError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether this error belongs to the conflict class (lock contention or
    /// type mismatch).
    pub fn is_conflict(&self) -> bool {
        matches!(self, DavError::Locked(_) | DavError::Conflict(_))
    }
}

/// Map a backend error to the status a handler reports.
fn store_error_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) => StatusCode::METHOD_NOT_ALLOWED,
        StoreError::NotACollection(_) | StoreError::NotADocument(_) => StatusCode::CONFLICT,
        StoreError::InvalidName(_) => StatusCode::BAD_REQUEST,
        StoreError::Io(e) => match e.kind() {
            io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            io::ErrorKind::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Result type for engine operations.
pub type DavResult<T> = Result<T, DavError>;

/// Result type for store backends.
pub type StoreResult<T> = Result<T, StoreError>;
