//! MOVE and COPY execution.
//!
//! A transfer first classifies its destination ([`Target`]) and then picks a
//! strategy from the pair `(source kind, target)`. Collections are processed
//! depth-first with members in name order, and every entry processed yields
//! one [`ActionResult`]. Partial success is a normal outcome: a failed entry
//! is recorded and its siblings continue.
//!
//! Destinations on another server go through a [`Transport`](crate::transport::Transport);
//! see the `remote` strategies.

mod classify;
mod local;
mod remote;
mod stream;

pub use classify::{Target, TargetKind, classify};
pub(crate) use stream::{PumpError, pump};

use crate::error::{DavError, DavResult};
use crate::locks::{Depth, LockManager, LockToken};
use crate::path::{DavPath, Mount};
use crate::props::DeadPropertyStore;
use crate::stats::EngineStats;
use crate::store::{Collection, Resource, ResourceId, Store};
use crate::transport::child_url;
use http::StatusCode;
use percent_encoding::percent_decode_str;
use std::fmt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// MOVE or COPY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Source is removed once the destination is written.
    Move,
    /// Source is left untouched.
    Copy,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Move => f.write_str("MOVE"),
            TransferKind::Copy => f.write_str("COPY"),
        }
    }
}

/// Where a transfer writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A path in the same store.
    Local(DavPath),
    /// A URL on another server.
    Remote(Url),
}

impl Destination {
    /// Interpret a `Destination` header value.
    ///
    /// Bare paths and absolute URLs with the same origin as `local_origin`
    /// are local and must lie within `mount`; any other absolute URL is
    /// remote.
    pub fn parse(value: &str, local_origin: Option<&Url>, mount: &Mount) -> DavResult<Self> {
        let locate = |encoded_path: &str| -> DavResult<Self> {
            let decoded = percent_decode_str(encoded_path)
                .decode_utf8()
                .map_err(|e| DavError::BadRequest(format!("Destination is not UTF-8: {e}")))?;
            Ok(Destination::Local(mount.locate(&decoded)?))
        };

        if value.starts_with('/') {
            return locate(value);
        }
        let url = Url::parse(value)
            .map_err(|e| DavError::BadRequest(format!("invalid Destination {value:?}: {e}")))?;
        if local_origin.is_some_and(|origin| origin.origin() == url.origin()) {
            return locate(url.path());
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DavError::BadRequest(format!(
                "unsupported Destination scheme {}",
                url.scheme()
            )));
        }
        Ok(Destination::Remote(url))
    }

    /// The destination of the member `name` below this one.
    pub fn child(&self, name: &str) -> DavResult<Self> {
        Ok(match self {
            Destination::Local(path) => Destination::Local(path.join(name)),
            Destination::Remote(url) => Destination::Remote(child_url(url, name)?),
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local(path) => fmt::Display::fmt(path, f),
            Destination::Remote(url) => fmt::Display::fmt(url, f),
        }
    }
}

/// A parsed MOVE or COPY request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// MOVE or COPY.
    pub kind: TransferKind,
    /// Source path.
    pub source: DavPath,
    /// Destination.
    pub destination: Destination,
    /// `Overwrite: T`.
    pub overwrite: bool,
    /// `Infinity`, or `Zero` for a COPY of a collection without its members.
    pub depth: Depth,
    /// Lock tokens submitted with the request.
    pub tokens: Vec<LockToken>,
}

impl TransferRequest {
    /// A request with `Overwrite: T`, depth infinity and no tokens.
    pub fn new(kind: TransferKind, source: DavPath, destination: Destination) -> Self {
        Self {
            kind,
            source,
            destination,
            overwrite: true,
            depth: Depth::Infinity,
            tokens: Vec::new(),
        }
    }

    /// Set the overwrite flag.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the depth.
    #[must_use]
    pub fn with_depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    /// Add submitted lock tokens.
    #[must_use]
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = LockToken>) -> Self {
        self.tokens.extend(tokens);
        self
    }

    /// Whether members of a source collection are transferred.
    fn recurse(&self) -> bool {
        self.kind == TransferKind::Move || self.depth.reaches_members()
    }
}

/// Outcome of one processed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionStatus {
    /// Written to a previously missing destination.
    Created,
    /// Replaced an existing destination.
    Overwritten,
    /// Refused without touching the destination.
    Conflict,
    /// Writing the destination failed; the destination is unchanged.
    OverwriteFailed,
    /// The destination is correct but the MOVE source could not be removed.
    CleanupFailed,
    /// The request was cancelled while this entry was in flight.
    Cancelled,
    /// Not attempted because the enclosing collection failed.
    Skipped,
}

impl ActionStatus {
    /// Status reported for this entry.
    pub fn status(self) -> StatusCode {
        match self {
            ActionStatus::Created => StatusCode::CREATED,
            ActionStatus::Overwritten => StatusCode::NO_CONTENT,
            ActionStatus::Conflict => StatusCode::CONFLICT,
            ActionStatus::OverwriteFailed | ActionStatus::CleanupFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ActionStatus::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ActionStatus::Skipped => StatusCode::FAILED_DEPENDENCY,
        }
    }

    /// Whether the destination now holds the source content.
    pub fn is_success(self) -> bool {
        matches!(self, ActionStatus::Created | ActionStatus::Overwritten)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of a transfer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    /// Source path of the entry.
    pub source: DavPath,
    /// Destination path or URL.
    pub destination: String,
    /// What was found at the destination.
    pub target: TargetKind,
    /// Outcome.
    pub status: ActionStatus,
    /// Failure detail.
    pub detail: Option<String>,
}

/// Ordered results of a transfer: each collection entry precedes its members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferResult {
    /// Entries in processing order.
    pub entries: Vec<ActionResult>,
}

impl TransferResult {
    /// Whether every entry succeeded.
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_success())
    }

    /// Entries that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &ActionResult> {
        self.entries.iter().filter(|e| !e.status.is_success())
    }

    /// The entry for a destination.
    pub fn entry(&self, destination: &str) -> Option<&ActionResult> {
        self.entries.iter().find(|e| e.destination == destination)
    }

    /// Response status: the top-level entry's status when everything
    /// succeeded or only one entry exists, `207 Multi-Status` otherwise.
    pub fn status(&self) -> StatusCode {
        match self.entries.as_slice() {
            [] => StatusCode::NO_CONTENT,
            [only] => only.status.status(),
            [first, ..] if self.is_success() => first.status.status(),
            _ => StatusCode::MULTI_STATUS,
        }
    }
}

/// Bookkeeping for one running transfer.
struct Run<'r> {
    request: &'r TransferRequest,
    cancel: &'r CancellationToken,
    entries: Vec<ActionResult>,
    cancelled: bool,
}

impl<'r> Run<'r> {
    fn new(request: &'r TransferRequest, cancel: &'r CancellationToken) -> Self {
        Self {
            request,
            cancel,
            entries: Vec::new(),
            cancelled: false,
        }
    }

    fn push(
        &mut self,
        source: &DavPath,
        destination: &Destination,
        target: TargetKind,
        status: ActionStatus,
        detail: Option<String>,
    ) -> usize {
        self.entries.push(ActionResult {
            source: source.clone(),
            destination: destination.to_string(),
            target,
            status,
            detail,
        });
        self.entries.len() - 1
    }

    /// Check for cancellation before starting an entry.
    fn check_cancelled(&mut self) -> bool {
        if !self.cancelled && self.cancel.is_cancelled() {
            self.cancelled = true;
        }
        self.cancelled
    }
}

/// Executes transfers against one store.
///
/// Built per request by the handler; holds only borrowed collaborators.
pub struct TransferEngine<'a> {
    store: &'a dyn Store,
    dead: &'a dyn DeadPropertyStore,
    locks: &'a LockManager,
    stats: &'a EngineStats,
    chunk_size: usize,
}

impl<'a> TransferEngine<'a> {
    /// Bind an engine to its collaborators.
    pub fn new(
        store: &'a dyn Store,
        dead: &'a dyn DeadPropertyStore,
        locks: &'a LockManager,
        stats: &'a EngineStats,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            dead,
            locks,
            stats,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Delete a resource together with its dead properties and every lock
    /// rooted at or below it.
    pub(crate) async fn delete_resource(&self, path: &DavPath, resource: &Resource) -> DavResult<()> {
        let ids = subtree_ids(self.store, resource).await?;
        self.store.delete(resource).await?;
        for id in ids {
            self.dead.forget(id).await?;
        }
        self.locks.remove_under(path);
        Ok(())
    }

    /// Report every member below `collection` as skipped, depth-first.
    async fn skip_members(
        &self,
        run: &mut Run<'_>,
        collection: &Collection,
        source: &DavPath,
        destination: &Destination,
    ) {
        let mut stack = Vec::new();
        if let Ok(members) = self.store.list_children(collection).await {
            push_members(&mut stack, members, source, destination);
        }
        while let Some((member, src, dst)) = stack.pop() {
            run.push(&src, &dst, TargetKind::Unknown, ActionStatus::Skipped, None);
            if let Resource::Collection(c) = &member
                && let Ok(members) = self.store.list_children(c).await
            {
                push_members(&mut stack, members, &src, &dst);
            }
        }
    }

    fn record(&self, status: ActionStatus) {
        match status {
            ActionStatus::Created => self.stats.record_created(),
            ActionStatus::Overwritten => self.stats.record_overwritten(),
            ActionStatus::OverwriteFailed | ActionStatus::CleanupFailed => {
                self.stats.record_partial_failure();
            }
            ActionStatus::Conflict | ActionStatus::Cancelled | ActionStatus::Skipped => {}
        }
    }
}

/// Push members in reverse so they pop off in name order.
fn push_members(
    stack: &mut Vec<(Resource, DavPath, Destination)>,
    members: Vec<Resource>,
    source: &DavPath,
    destination: &Destination,
) {
    for member in members.into_iter().rev() {
        if let Ok(dst) = destination.child(member.name()) {
            let src = source.join(member.name());
            stack.push((member, src, dst));
        }
    }
}

/// Identifiers of a resource and everything below it.
async fn subtree_ids(store: &dyn Store, resource: &Resource) -> DavResult<Vec<ResourceId>> {
    let mut ids = Vec::new();
    let mut stack = vec![resource.clone()];
    while let Some(current) = stack.pop() {
        ids.push(current.id());
        if let Resource::Collection(c) = &current {
            stack.extend(store.list_children(c).await?);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_parse() {
        let mount = Mount::new("/dav").unwrap();
        let origin = Url::parse("http://localhost:8080/").unwrap();

        assert_eq!(
            Destination::parse("/dav/a%20b.txt", Some(&origin), &mount).unwrap(),
            Destination::Local(DavPath::parse("/a b.txt").unwrap())
        );
        assert_eq!(
            Destination::parse("http://localhost:8080/dav/x", Some(&origin), &mount).unwrap(),
            Destination::Local(DavPath::parse("/x").unwrap())
        );
        assert!(matches!(
            Destination::parse("http://other:9000/dav/x", Some(&origin), &mount).unwrap(),
            Destination::Remote(_)
        ));
        assert!(matches!(
            Destination::parse("/elsewhere/x", Some(&origin), &mount),
            Err(DavError::Invalid(_))
        ));
        assert!(matches!(
            Destination::parse("ftp://host/x", None, &mount),
            Err(DavError::BadRequest(_))
        ));
    }

    #[test]
    fn test_destination_child() {
        let local = Destination::Local(DavPath::parse("/dst").unwrap());
        assert_eq!(local.child("a").unwrap().to_string(), "/dst/a");

        let remote = Destination::Remote(Url::parse("http://r/dst/").unwrap());
        assert_eq!(remote.child("a").unwrap().to_string(), "http://r/dst/a");
    }

    #[test]
    fn test_result_status() {
        let entry = |status| ActionResult {
            source: DavPath::root(),
            destination: "/x".to_string(),
            target: TargetKind::Missing,
            status,
            detail: None,
        };
        let single = TransferResult {
            entries: vec![entry(ActionStatus::Created)],
        };
        assert_eq!(single.status(), StatusCode::CREATED);

        let partial = TransferResult {
            entries: vec![entry(ActionStatus::Created), entry(ActionStatus::CleanupFailed)],
        };
        assert_eq!(partial.status(), StatusCode::MULTI_STATUS);
        assert_eq!(partial.failures().count(), 1);
    }
}
