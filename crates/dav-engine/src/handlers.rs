//! Method handlers.
//!
//! [`DavHandler`] is the entry point an HTTP layer calls once it has parsed a
//! request: the path (via [`DavHandler::locate`]), the `Depth`, `Timeout` and
//! `Overwrite` headers, and the lock tokens submitted in the `If` header.
//! Each handler resolves the path, checks locks before touching anything and
//! then drives the store, the property layer or the transfer engine.
//!
//! Rendering responses (multistatus XML, headers) is left to the caller;
//! handlers return typed results that carry their status codes.

use crate::config::{ConfigError, EngineConfig};
use crate::error::{DavError, DavResult, StoreError};
use crate::locks::{
    ActiveLock, Depth, LockManager, LockPolicy, LockRequest, LockResult, LockTimeout, LockToken,
    RefreshResult,
};
use crate::path::{DavPath, Mount};
use crate::props::{
    DeadPropertyStore, LiveContext, MemoryPropertyStore, PatchOp, PatchStatus, Properties,
    Property, PropertyName, etag, http_date,
};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::store::{ByteStream, Collection, Document, Resource, ResourceKind, Store};
use crate::transfer::{
    Destination, PumpError, TransferEngine, TransferRequest, TransferResult, pump,
};
use crate::transport::Transport;
use crate::traverse::{resolve, resolve_parent, try_resolve};
use http::StatusCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Body and headers of a GET response.
pub struct GetResponse {
    /// Document content.
    pub body: ByteStream,
    /// `Content-Length`.
    pub len: u64,
    /// `ETag`, quoted.
    pub etag: String,
    /// `Last-Modified` as an HTTP-date.
    pub last_modified: String,
    /// `Content-Type`, if the store recorded one.
    pub content_type: Option<String>,
}

impl std::fmt::Debug for GetResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetResponse")
            .field("len", &self.len)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Whether a PUT created or replaced its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new document was created.
    Created,
    /// An existing document's content was replaced.
    Replaced,
}

impl PutOutcome {
    /// Response status.
    pub fn status(self) -> StatusCode {
        match self {
            PutOutcome::Created => StatusCode::CREATED,
            PutOutcome::Replaced => StatusCode::NO_CONTENT,
        }
    }
}

/// Outcome of a LOCK request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResponse {
    /// Granted lock or the lock that blocked the request.
    pub result: LockResult,
    /// Whether an empty document was created at an unmapped path.
    pub created: bool,
}

impl LockResponse {
    /// Response status: `201` for a lock that created its resource, `200`
    /// for other grants, `423 Locked` on conflict.
    pub fn status(&self) -> StatusCode {
        match (&self.result, self.created) {
            (LockResult::Granted(_), true) => StatusCode::CREATED,
            (LockResult::Granted(_), false) => StatusCode::OK,
            (LockResult::Conflict(_), _) => StatusCode::LOCKED,
        }
    }
}

/// What a PROPFIND asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropfindRequest {
    /// Every property in the allprop set plus dead properties.
    AllProp,
    /// Names only.
    PropName,
    /// The listed properties.
    Prop(Vec<PropertyName>),
}

/// One resource of a PROPFIND response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropfindEntry {
    /// Path of the resource.
    pub path: DavPath,
    /// Document or collection.
    pub kind: ResourceKind,
    /// Properties with a value (`200`). For a name-only request the values
    /// are empty.
    pub found: Vec<Property>,
    /// Requested names without a value (`404`).
    pub missing: Vec<PropertyName>,
}

/// Handles DAV methods against one store.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use dav_engine::store::MemoryStore;
/// use dav_engine::{DavHandler, EngineConfig, LockRequest};
/// use futures::{StreamExt, stream};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let handler = DavHandler::builder(std::sync::Arc::new(MemoryStore::new()))
///     .config(EngineConfig::default())
///     .build()?;
///
/// let path = handler.locate("/notes.txt")?;
/// let body = stream::iter([Ok(Bytes::from_static(b"hello"))]).boxed();
/// handler.put(&path, body, &[], &CancellationToken::new()).await?;
///
/// let lock = handler.lock(LockRequest::exclusive(path.clone())).await?;
/// assert!(lock.status().is_success());
/// # Ok(())
/// # }
/// ```
pub struct DavHandler {
    store: Arc<dyn Store>,
    dead: Arc<dyn DeadPropertyStore>,
    locks: Arc<LockManager>,
    transport: Option<Arc<dyn Transport>>,
    stats: Arc<EngineStats>,
    mount: Mount,
    local_origin: Option<Url>,
    chunk_size: usize,
    sweeper: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Builder for [`DavHandler`].
pub struct DavHandlerBuilder {
    store: Arc<dyn Store>,
    config: EngineConfig,
    dead: Option<Arc<dyn DeadPropertyStore>>,
    transport: Option<Arc<dyn Transport>>,
    stats: Option<Arc<EngineStats>>,
    local_origin: Option<Url>,
}

impl DavHandlerBuilder {
    /// Use this configuration instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist dead properties here instead of in memory.
    #[must_use]
    pub fn dead_properties(mut self, dead: Arc<dyn DeadPropertyStore>) -> Self {
        self.dead = Some(dead);
        self
    }

    /// Enable transfers to other servers.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Report counters into `stats`.
    #[must_use]
    pub fn stats(mut self, stats: Arc<EngineStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Origin under which this server is reachable; `Destination` URLs with
    /// the same origin are treated as local.
    #[must_use]
    pub fn local_origin(mut self, origin: Url) -> Self {
        self.local_origin = Some(origin);
        self
    }

    /// Validate the configuration and build the handler.
    ///
    /// When a sweep interval is configured and a Tokio runtime is running,
    /// the expired-lock sweeper is started; it stops when the handler is
    /// dropped.
    pub fn build(self) -> Result<DavHandler, ConfigError> {
        self.config.validate()?;
        let mount = self.config.mount()?;
        let stats = self.stats.unwrap_or_default();
        let locks = Arc::new(LockManager::with_stats(
            LockPolicy::from(&self.config),
            Arc::clone(&stats),
        ));

        let sweeper = match self.config.lock_sweep_interval {
            Some(interval) if tokio::runtime::Handle::try_current().is_ok() => {
                let shutdown = CancellationToken::new();
                let handle = locks.spawn_sweeper(interval, shutdown.clone());
                debug!(?interval, "Lock sweeper started");
                Some((shutdown, handle))
            }
            Some(_) => {
                warn!("lock_sweep_interval set but no runtime is running; expired locks are purged lazily");
                None
            }
            None => None,
        };

        Ok(DavHandler {
            store: self.store,
            dead: self
                .dead
                .unwrap_or_else(|| Arc::new(MemoryPropertyStore::new())),
            locks,
            transport: self.transport,
            stats,
            mount,
            local_origin: self.local_origin,
            chunk_size: self.config.transfer_chunk_size,
            sweeper,
        })
    }
}

impl DavHandler {
    /// Start building a handler over `store`.
    pub fn builder(store: Arc<dyn Store>) -> DavHandlerBuilder {
        DavHandlerBuilder {
            store,
            config: EngineConfig::default(),
            dead: None,
            transport: None,
            stats: None,
            local_origin: None,
        }
    }

    /// Translate a decoded request path into a store path.
    pub fn locate(&self, raw: &str) -> DavResult<DavPath> {
        Ok(self.mount.locate(raw)?)
    }

    /// Interpret a `Destination` header.
    pub fn destination(&self, value: &str) -> DavResult<Destination> {
        Destination::parse(value, self.local_origin.as_ref(), &self.mount)
    }

    /// The lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    fn engine(&self) -> TransferEngine<'_> {
        TransferEngine::new(
            &*self.store,
            &*self.dead,
            &self.locks,
            &self.stats,
            self.chunk_size,
        )
    }

    /// GET: stream a document.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub async fn get(&self, path: &DavPath) -> DavResult<GetResponse> {
        let chain = resolve(&*self.store, path).await?;
        let Resource::Document(doc) = &chain.target else {
            return Err(DavError::MethodNotAllowed(format!("{path} is a collection")));
        };
        let metadata = self.store.metadata(&chain.target).await?;
        let body = self.store.open_read(doc).await?;
        Ok(GetResponse {
            body,
            len: metadata.len,
            etag: etag(doc.id(), &metadata),
            last_modified: http_date(metadata.modified),
            content_type: metadata.content_type,
        })
    }

    /// PUT: create or atomically replace a document.
    ///
    /// The parent collection must exist. Replacing requires write access to
    /// the document, creating requires write access to the parent.
    #[instrument(level = "debug", skip(self, body, tokens, cancel), fields(path = %path))]
    pub async fn put(
        &self,
        path: &DavPath,
        body: ByteStream,
        tokens: &[LockToken],
        cancel: &CancellationToken,
    ) -> DavResult<PutOutcome> {
        self.locks.require(path, Depth::Zero, tokens)?;
        let (doc, outcome) = match try_resolve(&*self.store, path).await? {
            Some(chain) => match chain.target {
                Resource::Document(doc) => (doc, PutOutcome::Replaced),
                Resource::Collection(_) => {
                    return Err(DavError::MethodNotAllowed(format!(
                        "{path} is a collection"
                    )));
                }
            },
            None => {
                let (parent, name) = resolve_parent(&*self.store, path).await?;
                if let Some(parent_path) = path.parent() {
                    self.locks.require(&parent_path, Depth::Zero, tokens)?;
                }
                let doc = self.store.create_document(&parent, &name).await?;
                (doc, PutOutcome::Created)
            }
        };

        let written = match self.write_document(&doc, body, cancel).await {
            Ok(n) => n,
            Err(e) => {
                if outcome == PutOutcome::Created
                    && let Err(cleanup) = self.store.delete(&doc.clone().into()).await
                {
                    warn!(%path, error = %cleanup, "Failed to remove document after aborted PUT");
                }
                return Err(e);
            }
        };
        self.stats.record_bytes(written);
        info!(%path, bytes = written, ?outcome, "Document written");
        Ok(outcome)
    }

    async fn write_document(
        &self,
        doc: &Document,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> DavResult<u64> {
        let sink = self.store.open_write(doc).await?;
        pump(body, sink, self.chunk_size, cancel)
            .await
            .map_err(|e| match e {
                PumpError::Cancelled => DavError::Cancelled,
                PumpError::Open(e) | PumpError::Write(e) => DavError::Store(e),
                PumpError::Read(e) => DavError::Store(StoreError::Io(e)),
            })
    }

    /// DELETE: remove a resource, its members, their dead properties and
    /// every lock rooted at or below it.
    #[instrument(level = "debug", skip(self, tokens), fields(path = %path))]
    pub async fn delete(&self, path: &DavPath, tokens: &[LockToken]) -> DavResult<()> {
        if path.is_root() {
            return Err(DavError::MethodNotAllowed(
                "the root collection cannot be deleted".to_string(),
            ));
        }
        let chain = resolve(&*self.store, path).await?;
        self.locks.require(path, Depth::Infinity, tokens)?;
        if let Some(parent) = path.parent() {
            self.locks.require(&parent, Depth::Zero, tokens)?;
        }
        self.engine().delete_resource(path, &chain.target).await?;
        info!(%path, "Resource deleted");
        Ok(())
    }

    /// MKCOL: create a collection.
    #[instrument(level = "debug", skip(self, tokens), fields(path = %path))]
    pub async fn mkcol(&self, path: &DavPath, tokens: &[LockToken]) -> DavResult<Collection> {
        if try_resolve(&*self.store, path).await?.is_some() {
            return Err(DavError::MethodNotAllowed(format!("{path} already exists")));
        }
        let (parent, name) = resolve_parent(&*self.store, path).await?;
        if let Some(parent_path) = path.parent() {
            self.locks.require(&parent_path, Depth::Zero, tokens)?;
        }
        let collection = self.store.create_collection(&parent, &name).await?;
        info!(%path, "Collection created");
        Ok(collection)
    }

    /// PROPFIND: read properties of a resource and, depending on `depth`,
    /// its members. Entries come in depth-first name order.
    #[instrument(level = "debug", skip(self, request), fields(path = %path, depth = %depth))]
    pub async fn propfind(
        &self,
        path: &DavPath,
        depth: Depth,
        request: &PropfindRequest,
    ) -> DavResult<Vec<PropfindEntry>> {
        let chain = resolve(&*self.store, path).await?;
        let mut entries = Vec::new();
        let mut stack = vec![(path.clone(), chain.target, 0usize)];
        while let Some((current, resource, level)) = stack.pop() {
            let descend = match depth {
                Depth::Zero => false,
                Depth::One => level == 0,
                Depth::Infinity => true,
            };
            if descend && let Resource::Collection(c) = &resource {
                let members = self.store.list_children(c).await?;
                for member in members.into_iter().rev() {
                    stack.push((current.join(member.name()), member, level + 1));
                }
            }
            entries.push(self.propfind_entry(current, resource, request).await?);
        }
        debug!(entries = entries.len(), "PROPFIND evaluated");
        Ok(entries)
    }

    async fn propfind_entry(
        &self,
        path: DavPath,
        resource: Resource,
        request: &PropfindRequest,
    ) -> DavResult<PropfindEntry> {
        let ctx = LiveContext::new(&*self.store, &self.locks, &path, &resource);
        let props = Properties::new(ctx, &*self.dead);
        let (found, missing) = match request {
            PropfindRequest::AllProp => (props.get_properties().await?, Vec::new()),
            PropfindRequest::PropName => (
                props
                    .property_names()
                    .await?
                    .into_iter()
                    .map(|name| Property::new(name, ""))
                    .collect(),
                Vec::new(),
            ),
            PropfindRequest::Prop(names) => {
                let selected = props.get_selected(names).await?;
                (selected.found, selected.missing)
            }
        };
        let kind = resource.kind();
        Ok(PropfindEntry {
            path,
            kind,
            found,
            missing,
        })
    }

    /// PROPPATCH: apply dead-property changes as one batch.
    #[instrument(level = "debug", skip(self, ops, tokens), fields(path = %path, ops = ops.len()))]
    pub async fn proppatch(
        &self,
        path: &DavPath,
        ops: Vec<PatchOp>,
        tokens: &[LockToken],
    ) -> DavResult<Vec<PatchStatus>> {
        let chain = resolve(&*self.store, path).await?;
        self.locks.require(path, Depth::Zero, tokens)?;
        let ctx = LiveContext::new(&*self.store, &self.locks, path, &chain.target);
        Properties::new(ctx, &*self.dead).patch(ops).await
    }

    /// LOCK: acquire a new lock.
    ///
    /// Locking an unmapped path whose parent collection exists creates an
    /// empty document there. `Depth: 1` is not a lock depth.
    #[instrument(level = "debug", skip(self, request), fields(path = %request.path, scope = %request.scope))]
    pub async fn lock(&self, request: LockRequest) -> DavResult<LockResponse> {
        if request.depth == Depth::One {
            return Err(DavError::BadRequest(
                "Depth: 1 is not valid for LOCK".to_string(),
            ));
        }
        let path = request.path.clone();
        let missing = match try_resolve(&*self.store, &path).await? {
            Some(_) => None,
            None => Some(resolve_parent(&*self.store, &path).await?),
        };

        let result = self.locks.lock(request);
        let created = match (&result, missing) {
            (LockResult::Granted(lock), Some((parent, name))) => {
                if let Err(e) = self.store.create_document(&parent, &name).await {
                    warn!(%path, error = %e, "Failed to create locked resource; releasing lock");
                    if let Err(unlock_err) = self.locks.unlock(&lock.token) {
                        warn!(%path, error = %unlock_err, "Failed to release lock on uncreated resource");
                    }
                    return Err(e.into());
                }
                debug!(%path, "Created empty document for lock");
                true
            }
            _ => false,
        };
        Ok(LockResponse { result, created })
    }

    /// LOCK refresh: extend the submitted locks covering `path`.
    #[instrument(level = "debug", skip(self, tokens), fields(path = %path))]
    pub async fn refresh_lock(
        &self,
        path: &DavPath,
        tokens: &[LockToken],
        timeout: Option<LockTimeout>,
    ) -> DavResult<RefreshResult> {
        resolve(&*self.store, path).await?;
        Ok(self.locks.refresh(path, tokens, timeout))
    }

    /// UNLOCK: release `token`, which must cover `path`.
    #[instrument(level = "debug", skip(self), fields(path = %path, token = %token))]
    pub async fn unlock(&self, path: &DavPath, token: &LockToken) -> DavResult<ActiveLock> {
        if let Some(lock) = self.locks.get(token)
            && !lock.covers(path)
        {
            return Err(DavError::Conflict(format!(
                "lock {token} does not cover {path}"
            )));
        }
        self.locks.unlock(token)
    }

    /// MOVE or COPY.
    pub async fn transfer(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> DavResult<TransferResult> {
        self.engine()
            .execute(request, self.transport.as_deref(), cancel)
            .await
    }
}

impl Drop for DavHandler {
    fn drop(&mut self) {
        if let Some((shutdown, _)) = self.sweeper.take() {
            shutdown.cancel();
        }
    }
}
