//! RFC 4918 write locks.
//!
//! This module holds the lock vocabulary ([`LockToken`], [`LockScope`],
//! [`Depth`], [`LockTimeout`], [`ActiveLock`]) and the [`LockManager`] that
//! owns every active lock of an engine instance.
//!
//! # Lock Semantics
//!
//! - **Scope**: an exclusive lock conflicts with any lock whose scope
//!   intersects it; shared locks coexist with each other but not with an
//!   exclusive lock.
//! - **Depth**: a `Depth: 0` lock covers only its path; a `Depth: infinity`
//!   lock covers the path and every descendant.
//! - **Intersection**: two scopes intersect when one lock covers the other's
//!   root path.
//! - **Expiry**: timeouts are deadlines. A lock past its deadline is treated
//!   as absent by every query and purged on the next table access.
//!
//! # Write Access
//!
//! A mutation at a path is allowed when, for every live lock covering the
//! affected scope, the caller presents the token of each exclusive lock and
//! at least one token of the covering shared locks.

mod manager;

pub use manager::{LockManager, LockPolicy};

use crate::path::DavPath;
use http::StatusCode;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque lock token, `urn:uuid:` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh, globally unique token.
    pub fn generate() -> Self {
        LockToken(format!("urn:uuid:{}", Uuid::new_v4()))
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(s: String) -> Self {
        LockToken(s)
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        LockToken(s.to_string())
    }
}

/// Lock scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// No other lock may intersect.
    Exclusive,
    /// Other shared locks may intersect.
    Shared,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Exclusive => f.write_str("exclusive"),
            LockScope::Shared => f.write_str("shared"),
        }
    }
}

/// Parsed `Depth` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Depth {
    /// The resource only.
    Zero,
    /// The resource and its immediate members.
    One,
    /// The resource and all descendants.
    Infinity,
}

impl Depth {
    /// Whether this depth reaches below the resource itself.
    #[inline]
    pub fn reaches_members(self) -> bool {
        !matches!(self, Depth::Zero)
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Depth::Zero => f.write_str("0"),
            Depth::One => f.write_str("1"),
            Depth::Infinity => f.write_str("infinity"),
        }
    }
}

/// Error for an unrecognised `Depth` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid Depth value: {0:?}")]
pub struct InvalidDepth(pub String);

impl FromStr for Depth {
    type Err = InvalidDepth;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(Depth::Zero),
            "1" => Ok(Depth::One),
            v if v.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            other => Err(InvalidDepth(other.to_string())),
        }
    }
}

/// Lock lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTimeout {
    /// Expires after the duration unless refreshed.
    Finite(Duration),
    /// Never expires on its own.
    Infinite,
}

impl fmt::Display for LockTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTimeout::Finite(d) => write!(f, "Second-{}", d.as_secs()),
            LockTimeout::Infinite => f.write_str("Infinite"),
        }
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    /// Token identifying the lock.
    pub token: LockToken,
    /// Root of the locked scope.
    pub path: DavPath,
    /// Client-supplied owner fragment, kept verbatim.
    pub owner: Option<String>,
    /// Exclusive or shared.
    pub scope: LockScope,
    /// `Zero` or `Infinity`.
    pub depth: Depth,
    /// Effective timeout after policy clamping.
    pub timeout: LockTimeout,
    /// Wall-clock time the lock was granted.
    pub issued_at: SystemTime,
    pub(crate) deadline: Option<Instant>,
}

impl ActiveLock {
    /// Whether this lock covers `path`.
    pub fn covers(&self, path: &DavPath) -> bool {
        &self.path == path || (self.depth.reaches_members() && self.path.is_ancestor_of(path))
    }

    /// Whether this lock's scope intersects the scope rooted at `path`.
    pub fn intersects(&self, path: &DavPath, depth: Depth) -> bool {
        self.covers(path) || (depth.reaches_members() && path.is_ancestor_of(&self.path))
    }

    /// Time left before expiry, `None` for infinite locks.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Parameters of a LOCK request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Path to lock.
    pub path: DavPath,
    /// Owner fragment.
    pub owner: Option<String>,
    /// Requested scope.
    pub scope: LockScope,
    /// Requested depth (`One` is not a valid lock depth).
    pub depth: Depth,
    /// Requested timeout; `None` uses the configured default.
    pub timeout: Option<LockTimeout>,
}

impl LockRequest {
    /// An exclusive, depth-infinity request with the default timeout.
    pub fn exclusive(path: DavPath) -> Self {
        Self {
            path,
            owner: None,
            scope: LockScope::Exclusive,
            depth: Depth::Infinity,
            timeout: None,
        }
    }

    /// A shared, depth-infinity request with the default timeout.
    pub fn shared(path: DavPath) -> Self {
        Self {
            scope: LockScope::Shared,
            ..Self::exclusive(path)
        }
    }

    /// Set the depth.
    #[must_use]
    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    /// Set the requested timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the owner fragment.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// The lock was granted.
    Granted(ActiveLock),
    /// An intersecting lock blocks the request.
    Conflict(ActiveLock),
}

/// Why a refresh did not refresh anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The request carried no lock token.
    #[error("refresh request carries no lock token")]
    NoTokens,
    /// None of the presented tokens names a live lock covering the path.
    #[error("no presented lock token matches a lock on the resource")]
    NoMatchingLock,
}

impl RefreshError {
    /// Status for the refresh response.
    pub fn status(self) -> StatusCode {
        match self {
            RefreshError::NoTokens => StatusCode::BAD_REQUEST,
            RefreshError::NoMatchingLock => StatusCode::PRECONDITION_FAILED,
        }
    }
}

/// Outcome of a lock refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshResult {
    /// The listed locks have new deadlines.
    Refreshed(Vec<ActiveLock>),
    /// Nothing was refreshed.
    Error(RefreshError),
}

/// Outcome of a write-access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    /// The caller may mutate the scope.
    Allowed,
    /// This lock blocks the mutation.
    Denied(ActiveLock),
}

impl ConflictCheck {
    /// Returns true if access is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConflictCheck::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_at(path: &str, depth: Depth) -> ActiveLock {
        ActiveLock {
            token: LockToken::generate(),
            path: DavPath::parse(path).unwrap(),
            owner: None,
            scope: LockScope::Exclusive,
            depth,
            timeout: LockTimeout::Infinite,
            issued_at: SystemTime::now(),
            deadline: None,
        }
    }

    #[test]
    fn test_covers() {
        let deep = lock_at("/a", Depth::Infinity);
        let shallow = lock_at("/a", Depth::Zero);
        let child = DavPath::parse("/a/b").unwrap();

        assert!(deep.covers(&child));
        assert!(!shallow.covers(&child));
        assert!(shallow.covers(&DavPath::parse("/a").unwrap()));
    }

    #[test]
    fn test_intersects_descendant_scope() {
        let child_lock = lock_at("/a/b/c", Depth::Zero);
        let a = DavPath::parse("/a").unwrap();
        assert!(child_lock.intersects(&a, Depth::Infinity));
        assert!(!child_lock.intersects(&a, Depth::Zero));
    }

    #[test]
    fn test_token_format() {
        let token = LockToken::generate();
        assert!(token.as_str().starts_with("urn:uuid:"));
        assert_ne!(token, LockToken::generate());
    }

    #[test]
    fn test_depth_parse() {
        assert_eq!("0".parse::<Depth>().unwrap(), Depth::Zero);
        assert_eq!("Infinity".parse::<Depth>().unwrap(), Depth::Infinity);
        assert!("2".parse::<Depth>().is_err());
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(
            LockTimeout::Finite(Duration::from_secs(600)).to_string(),
            "Second-600"
        );
        assert_eq!(LockTimeout::Infinite.to_string(), "Infinite");
    }
}
