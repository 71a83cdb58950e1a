//! Storage backend abstraction.
//!
//! The engine never touches bytes on disk itself. It drives a [`Store`]
//! through opaque [`Document`] and [`Collection`] handles and expects:
//!
//! - `list_children` to return members in stable name order
//! - `open_write` to return a sink with atomic-replace semantics: nothing is
//!   visible at the destination until [`DocumentSink::commit`] succeeds, and
//!   [`DocumentSink::abort`] discards everything written so far
//! - `delete` to remove a collection together with all its members
//!
//! [`MemoryStore`] is a complete in-process backend.

mod memory;

pub use memory::{FaultOp, MemoryStore};

use crate::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::io;
use std::time::SystemTime;

/// Opaque, never-reused identifier of a stored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Wrap a backend-assigned identifier.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        ResourceId(raw)
    }

    /// The raw identifier.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a document (byte content plus metadata).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Document {
    id: ResourceId,
    name: String,
}

/// Handle to a collection (ordered set of named members).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Collection {
    id: ResourceId,
    name: String,
}

impl Document {
    /// Create a handle; used by backends.
    pub fn new(id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Backend identifier.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Member name within the parent collection.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Collection {
    /// Create a handle; used by backends.
    pub fn new(id: ResourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Backend identifier.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Member name within the parent collection (empty for the root).
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Kind of a stored resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Byte content.
    Document,
    /// Container of named members.
    Collection,
}

/// A document or a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A document handle.
    Document(Document),
    /// A collection handle.
    Collection(Collection),
}

impl Resource {
    /// Backend identifier.
    pub fn id(&self) -> ResourceId {
        match self {
            Resource::Document(d) => d.id(),
            Resource::Collection(c) => c.id(),
        }
    }

    /// Member name.
    pub fn name(&self) -> &str {
        match self {
            Resource::Document(d) => d.name(),
            Resource::Collection(c) => c.name(),
        }
    }

    /// Kind of this resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Document(_) => ResourceKind::Document,
            Resource::Collection(_) => ResourceKind::Collection,
        }
    }

    /// Returns true for collections.
    pub fn is_collection(&self) -> bool {
        matches!(self, Resource::Collection(_))
    }

    /// The document handle, if this is a document.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Resource::Document(d) => Some(d),
            Resource::Collection(_) => None,
        }
    }

    /// The collection handle, if this is a collection.
    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Resource::Collection(c) => Some(c),
            Resource::Document(_) => None,
        }
    }
}

impl From<Document> for Resource {
    fn from(d: Document) -> Self {
        Resource::Document(d)
    }
}

impl From<Collection> for Resource {
    fn from(c: Collection) -> Self {
        Resource::Collection(c)
    }
}

/// Backend metadata used to compute live properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Kind of the resource.
    pub kind: ResourceKind,
    /// Content length in bytes (0 for collections).
    pub len: u64,
    /// Creation time.
    pub created: SystemTime,
    /// Last content modification time.
    pub modified: SystemTime,
    /// MIME type recorded for the document, if any.
    pub content_type: Option<String>,
}

/// Stream of content chunks read from a document.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Pending write to a document.
///
/// Writes are staged until [`commit`](DocumentSink::commit); an aborted or
/// dropped sink leaves the document untouched.
#[async_trait]
pub trait DocumentSink: Send {
    /// Append a chunk to the staged content.
    async fn write(&mut self, chunk: Bytes) -> StoreResult<()>;

    /// Atomically replace the document content with the staged bytes.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard the staged bytes.
    async fn abort(self: Box<Self>);
}

/// Hierarchical document store consumed by the engine.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// The root collection.
    fn root(&self) -> Collection;

    /// Look up a member of a collection by name.
    async fn child(&self, parent: &Collection, name: &str) -> StoreResult<Option<Resource>>;

    /// Members of a collection in stable name order.
    async fn list_children(&self, collection: &Collection) -> StoreResult<Vec<Resource>>;

    /// Current metadata of a resource.
    async fn metadata(&self, resource: &Resource) -> StoreResult<Metadata>;

    /// Open a document for streaming reads.
    async fn open_read(&self, document: &Document) -> StoreResult<ByteStream>;

    /// Open a document for an atomic full-content replace.
    async fn open_write(&self, document: &Document) -> StoreResult<Box<dyn DocumentSink>>;

    /// Create an empty document.
    async fn create_document(&self, parent: &Collection, name: &str) -> StoreResult<Document>;

    /// Create an empty collection.
    async fn create_collection(&self, parent: &Collection, name: &str) -> StoreResult<Collection>;

    /// Delete a resource; collections are removed with all their members.
    async fn delete(&self, resource: &Resource) -> StoreResult<()>;
}
