//! WebDAV protocol engine.
//!
//! This crate turns parsed WebDAV requests (LOCK, UNLOCK, MOVE, COPY, GET,
//! PUT, DELETE, MKCOL, PROPFIND, PROPPATCH) into coordinated operations over
//! an abstract hierarchical [`Store`](store::Store), enforcing RFC 4918
//! locking along the way.
//!
//! # How It Works
//!
//! A request flows through four layers:
//! 1. [`DavPath`] normalizes the request path and [`traverse`] resolves it
//!    into a chain of collection and document handles
//! 2. The [`LockManager`] validates lock tokens before anything is mutated,
//!    or grants, refreshes and releases locks
//! 3. [`props`] computes live properties and reads or writes dead ones
//! 4. For MOVE and COPY, the [`transfer`] engine classifies the destination
//!    and runs the matching strategy, locally or against another server
//!    through a [`Transport`]
//!
//! [`DavHandler`] wires these together per method. Parsing headers and
//! rendering multistatus bodies stays with the HTTP layer.
//!
//! # Example
//!
//! ```
//! use dav_engine::{DavPath, LockManager, LockPolicy, LockRequest, LockResult};
//!
//! let manager = LockManager::new(LockPolicy::default());
//! let docs = DavPath::parse("/docs").unwrap();
//!
//! let LockResult::Granted(lock) = manager.lock(LockRequest::exclusive(docs.clone())) else {
//!     panic!("first lock must be granted");
//! };
//!
//! // A depth-infinity lock on /docs blocks writers below it without the token.
//! let report = DavPath::parse("/docs/report.txt").unwrap();
//! assert!(!manager.check(&report, dav_engine::Depth::Zero, &[]).is_allowed());
//! assert!(manager.check(&report, dav_engine::Depth::Zero, &[lock.token]).is_allowed());
//! ```
//!
//! # Partial Failure
//!
//! A recursive MOVE or COPY reports one [`ActionResult`] per entry instead
//! of failing as a whole. `OverwriteFailed` leaves the destination
//! unchanged; `CleanupFailed` means the destination is correct but the MOVE
//! source is still there. Neither is retried.

pub mod config;
mod error;
pub mod handlers;
pub mod locks;
pub mod path;
pub mod props;
mod stats;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod traverse;

// Public exports
pub use config::{ConfigError, EngineConfig, RemoteConfig};
pub use error::{DavError, DavResult, StoreError, StoreResult, TransportError};
pub use handlers::{
    DavHandler, DavHandlerBuilder, GetResponse, LockResponse, PropfindEntry, PropfindRequest,
    PutOutcome,
};
pub use locks::{
    ActiveLock, ConflictCheck, Depth, LockManager, LockPolicy, LockRequest, LockResult, LockScope,
    LockTimeout, LockToken, RefreshError, RefreshResult,
};
pub use path::{DavPath, Mount, PathError};
pub use props::{PatchOp, Property, PropertyName};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use transfer::{
    ActionResult, ActionStatus, Destination, Target, TargetKind, TransferKind, TransferRequest,
    TransferResult,
};
pub use transport::{HttpTransport, Transport, UploadOutcome};
