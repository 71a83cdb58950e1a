//! In-memory [`Store`] backend.
//!
//! Every resource lives in a single node table guarded by a `RwLock`.
//! Writes are staged in the sink and swapped in on commit, so readers never
//! observe a partially written document. Fault injection lets callers make
//! individual operations fail by member name, which is how partial-failure
//! paths of the transfer engine are exercised.

use super::{
    ByteStream, Collection, Document, DocumentSink, Metadata, Resource, ResourceId, ResourceKind,
    Store,
};
use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{StoreError, StoreResult};
use crate::path::{is_valid_member_name, DavPath};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

const ROOT_ID: ResourceId = ResourceId::new(0);

/// Operation that an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    /// `open_read`
    Read,
    /// `DocumentSink::write` and `DocumentSink::commit`
    Write,
    /// `create_document` and `create_collection`
    Create,
    /// `delete`
    Delete,
}

#[derive(Debug)]
struct Node {
    name: String,
    parent: Option<ResourceId>,
    created: SystemTime,
    modified: SystemTime,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Document {
        content: Bytes,
        content_type: Option<String>,
    },
    Collection {
        children: BTreeMap<String, ResourceId>,
    },
}

impl Node {
    fn handle(&self, id: ResourceId) -> Resource {
        match self.kind {
            NodeKind::Document { .. } => Resource::Document(Document::new(id, self.name.clone())),
            NodeKind::Collection { .. } => {
                Resource::Collection(Collection::new(id, self.name.clone()))
            }
        }
    }
}

type NodeTable = HashMap<ResourceId, Node>;

#[derive(Debug)]
struct Inner {
    nodes: RwLock<NodeTable>,
    next_id: AtomicU64,
    chunk_size: usize,
    faults: Mutex<Vec<(FaultOp, String)>>,
}

impl Inner {
    fn check_fault(&self, op: FaultOp, name: &str) -> StoreResult<()> {
        let faults = self.faults.lock();
        if faults.iter().any(|(o, n)| *o == op && n == name) {
            debug!(?op, name, "Injected store fault");
            return Err(StoreError::Io(io::Error::other(format!(
                "injected {op:?} fault on {name}"
            ))));
        }
        Ok(())
    }

    fn allocate_id(&self) -> ResourceId {
        ResourceId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert_child(
        &self,
        nodes: &mut NodeTable,
        parent: ResourceId,
        name: &str,
        kind: NodeKind,
    ) -> StoreResult<ResourceId> {
        if !is_valid_member_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let id = self.allocate_id();
        let parent_node = nodes
            .get_mut(&parent)
            .ok_or_else(|| StoreError::NotFound(parent.to_string()))?;
        let NodeKind::Collection { children } = &mut parent_node.kind else {
            return Err(StoreError::NotACollection(parent_node.name.clone()));
        };
        if children.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        children.insert(name.to_string(), id);
        parent_node.modified = SystemTime::now();

        let now = SystemTime::now();
        nodes.insert(
            id,
            Node {
                name: name.to_string(),
                parent: Some(parent),
                created: now,
                modified: now,
                kind,
            },
        );
        Ok(id)
    }

    fn lookup(nodes: &NodeTable, path: &DavPath) -> Option<ResourceId> {
        let mut current = ROOT_ID;
        for segment in path.components() {
            let NodeKind::Collection { children } = &nodes.get(&current)?.kind else {
                return None;
            };
            current = *children.get(segment)?;
        }
        Some(current)
    }
}

/// In-memory hierarchical store.
///
/// Cloning is cheap; clones share the same tree.
///
/// # Example
///
/// ```
/// use dav_engine::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// store.put("/docs/a.txt", "hello").unwrap();
/// assert_eq!(store.read("/docs/a.txt").unwrap(), "hello");
/// assert!(store.exists("/docs"));
/// ```
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store containing only the root collection.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create an empty store whose read streams yield chunks of `chunk_size`.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let now = SystemTime::now();
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                name: String::new(),
                parent: None,
                created: now,
                modified: now,
                kind: NodeKind::Collection {
                    children: BTreeMap::new(),
                },
            },
        );
        Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(nodes),
                next_id: AtomicU64::new(1),
                chunk_size: chunk_size.max(1),
                faults: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make `op` fail for every resource named `name`.
    pub fn inject_fault(&self, op: FaultOp, name: impl Into<String>) {
        self.inner.faults.lock().push((op, name.into()));
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Create (or replace) a document at `path`, creating missing parents.
    pub fn put(&self, path: &str, content: impl Into<Bytes>) -> StoreResult<Document> {
        let path = parse(path)?;
        let (parent_path, name) = path
            .parent()
            .zip(path.file_name().map(ToString::to_string))
            .ok_or_else(|| StoreError::NotADocument("/".to_string()))?;
        let parent = self.mkdir_all(&parent_path.to_string())?;

        let mut nodes = self.inner.nodes.write();
        let existing = Inner::lookup(&nodes, &path);
        let content = content.into();
        match existing {
            Some(id) => {
                let node = nodes
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                match &mut node.kind {
                    NodeKind::Document { content: current, .. } => *current = content,
                    NodeKind::Collection { .. } => {
                        return Err(StoreError::NotADocument(path.to_string()));
                    }
                }
                node.modified = SystemTime::now();
                Ok(Document::new(id, name))
            }
            None => {
                let id = self.inner.insert_child(
                    &mut nodes,
                    parent.id(),
                    &name,
                    NodeKind::Document {
                        content,
                        content_type: None,
                    },
                )?;
                Ok(Document::new(id, name))
            }
        }
    }

    /// Create every missing collection along `path`.
    pub fn mkdir_all(&self, path: &str) -> StoreResult<Collection> {
        let path = parse(path)?;
        let mut nodes = self.inner.nodes.write();
        let mut current = ROOT_ID;
        let mut name = String::new();
        for segment in path.components() {
            let node = nodes
                .get(&current)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            let NodeKind::Collection { children } = &node.kind else {
                return Err(StoreError::NotACollection(node.name.clone()));
            };
            current = match children.get(segment) {
                Some(id) => *id,
                None => self.inner.insert_child(
                    &mut nodes,
                    current,
                    segment,
                    NodeKind::Collection {
                        children: BTreeMap::new(),
                    },
                )?,
            };
            name = segment.to_string();
        }
        match nodes.get(&current).map(|n| &n.kind) {
            Some(NodeKind::Collection { .. }) => Ok(Collection::new(current, name)),
            _ => Err(StoreError::NotACollection(path.to_string())),
        }
    }

    /// Content of the document at `path`.
    pub fn read(&self, path: &str) -> Option<Bytes> {
        let path = parse(path).ok()?;
        let nodes = self.inner.nodes.read();
        let id = Inner::lookup(&nodes, &path)?;
        match &nodes.get(&id)?.kind {
            NodeKind::Document { content, .. } => Some(content.clone()),
            NodeKind::Collection { .. } => None,
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.kind_at(path).is_some()
    }

    /// Kind of the resource at `path`.
    pub fn kind_at(&self, path: &str) -> Option<ResourceKind> {
        let path = parse(path).ok()?;
        let nodes = self.inner.nodes.read();
        let id = Inner::lookup(&nodes, &path)?;
        Some(match nodes.get(&id)?.kind {
            NodeKind::Document { .. } => ResourceKind::Document,
            NodeKind::Collection { .. } => ResourceKind::Collection,
        })
    }

    /// Set the MIME type reported for a document.
    pub fn set_content_type(&self, path: &str, mime: impl Into<String>) -> StoreResult<()> {
        let parsed = parse(path)?;
        let mut nodes = self.inner.nodes.write();
        let id = Inner::lookup(&nodes, &parsed).ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        match nodes.get_mut(&id).map(|n| &mut n.kind) {
            Some(NodeKind::Document { content_type, .. }) => {
                *content_type = Some(mime.into());
                Ok(())
            }
            _ => Err(StoreError::NotADocument(path.to_string())),
        }
    }

    /// Number of resources, including the root.
    pub fn len(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// Whether the store holds nothing but the root.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }
}

fn parse(path: &str) -> StoreResult<DavPath> {
    DavPath::parse(path).map_err(|e| StoreError::InvalidName(e.to_string()))
}

/// Staged write into a [`MemoryStore`] document.
struct MemorySink {
    inner: Arc<Inner>,
    id: ResourceId,
    name: String,
    staged: BytesMut,
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> StoreResult<()> {
        self.inner.check_fault(FaultOp::Write, &self.name)?;
        trace!(name = %self.name, len = chunk.len(), "Staging chunk");
        self.staged.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.check_fault(FaultOp::Write, &self.name)?;
        let mut nodes = self.inner.nodes.write();
        let node = nodes
            .get_mut(&self.id)
            .ok_or_else(|| StoreError::NotFound(self.name.clone()))?;
        let NodeKind::Document { content, .. } = &mut node.kind else {
            return Err(StoreError::NotADocument(self.name.clone()));
        };
        *content = self.staged.freeze();
        node.modified = SystemTime::now();
        debug!(name = %self.name, len = content.len(), "Committed document content");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        debug!(name = %self.name, staged = self.staged.len(), "Discarded staged content");
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn root(&self) -> Collection {
        Collection::new(ROOT_ID, "")
    }

    async fn child(&self, parent: &Collection, name: &str) -> StoreResult<Option<Resource>> {
        let nodes = self.inner.nodes.read();
        let node = nodes
            .get(&parent.id())
            .ok_or_else(|| StoreError::NotFound(parent.name().to_string()))?;
        let NodeKind::Collection { children } = &node.kind else {
            return Err(StoreError::NotACollection(parent.name().to_string()));
        };
        Ok(children
            .get(name)
            .and_then(|id| nodes.get(id).map(|n| n.handle(*id))))
    }

    async fn list_children(&self, collection: &Collection) -> StoreResult<Vec<Resource>> {
        let nodes = self.inner.nodes.read();
        let node = nodes
            .get(&collection.id())
            .ok_or_else(|| StoreError::NotFound(collection.name().to_string()))?;
        let NodeKind::Collection { children } = &node.kind else {
            return Err(StoreError::NotACollection(collection.name().to_string()));
        };
        Ok(children
            .values()
            .filter_map(|id| nodes.get(id).map(|n| n.handle(*id)))
            .collect())
    }

    async fn metadata(&self, resource: &Resource) -> StoreResult<Metadata> {
        let nodes = self.inner.nodes.read();
        let node = nodes
            .get(&resource.id())
            .ok_or_else(|| StoreError::NotFound(resource.name().to_string()))?;
        Ok(match &node.kind {
            NodeKind::Document {
                content,
                content_type,
            } => Metadata {
                kind: ResourceKind::Document,
                len: content.len() as u64,
                created: node.created,
                modified: node.modified,
                content_type: content_type.clone(),
            },
            NodeKind::Collection { .. } => Metadata {
                kind: ResourceKind::Collection,
                len: 0,
                created: node.created,
                modified: node.modified,
                content_type: None,
            },
        })
    }

    async fn open_read(&self, document: &Document) -> StoreResult<ByteStream> {
        self.inner.check_fault(FaultOp::Read, document.name())?;
        let content = {
            let nodes = self.inner.nodes.read();
            match nodes.get(&document.id()).map(|n| &n.kind) {
                Some(NodeKind::Document { content, .. }) => content.clone(),
                Some(NodeKind::Collection { .. }) => {
                    return Err(StoreError::NotADocument(document.name().to_string()));
                }
                None => return Err(StoreError::NotFound(document.name().to_string())),
            }
        };
        let chunk_size = self.inner.chunk_size;
        let chunks: Vec<io::Result<Bytes>> = (0..content.len())
            .step_by(chunk_size)
            .map(|start| Ok(content.slice(start..(start + chunk_size).min(content.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn open_write(&self, document: &Document) -> StoreResult<Box<dyn DocumentSink>> {
        {
            let nodes = self.inner.nodes.read();
            match nodes.get(&document.id()).map(|n| &n.kind) {
                Some(NodeKind::Document { .. }) => {}
                Some(NodeKind::Collection { .. }) => {
                    return Err(StoreError::NotADocument(document.name().to_string()));
                }
                None => return Err(StoreError::NotFound(document.name().to_string())),
            }
        }
        Ok(Box::new(MemorySink {
            inner: Arc::clone(&self.inner),
            id: document.id(),
            name: document.name().to_string(),
            staged: BytesMut::new(),
        }))
    }

    async fn create_document(&self, parent: &Collection, name: &str) -> StoreResult<Document> {
        self.inner.check_fault(FaultOp::Create, name)?;
        let mut nodes = self.inner.nodes.write();
        let id = self.inner.insert_child(
            &mut nodes,
            parent.id(),
            name,
            NodeKind::Document {
                content: Bytes::new(),
                content_type: None,
            },
        )?;
        Ok(Document::new(id, name))
    }

    async fn create_collection(&self, parent: &Collection, name: &str) -> StoreResult<Collection> {
        self.inner.check_fault(FaultOp::Create, name)?;
        let mut nodes = self.inner.nodes.write();
        let id = self.inner.insert_child(
            &mut nodes,
            parent.id(),
            name,
            NodeKind::Collection {
                children: BTreeMap::new(),
            },
        )?;
        Ok(Collection::new(id, name))
    }

    async fn delete(&self, resource: &Resource) -> StoreResult<()> {
        self.inner.check_fault(FaultOp::Delete, resource.name())?;
        if resource.id() == ROOT_ID {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "the root collection cannot be deleted",
            )));
        }
        let mut nodes = self.inner.nodes.write();
        let node = nodes
            .remove(&resource.id())
            .ok_or_else(|| StoreError::NotFound(resource.name().to_string()))?;

        if let Some(parent) = node.parent.and_then(|p| nodes.get_mut(&p))
            && let NodeKind::Collection { children } = &mut parent.kind
        {
            children.remove(&node.name);
            parent.modified = SystemTime::now();
        }

        let mut stack: Vec<ResourceId> = match node.kind {
            NodeKind::Collection { children } => children.into_values().collect(),
            NodeKind::Document { .. } => Vec::new(),
        };
        while let Some(id) = stack.pop() {
            if let Some(Node {
                kind: NodeKind::Collection { children },
                ..
            }) = nodes.remove(&id)
            {
                stack.extend(children.into_values());
            }
        }
        debug!(name = %resource.name(), "Deleted resource");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn read_all(store: &MemoryStore, doc: &Document) -> Vec<u8> {
        let chunks: Vec<Bytes> = store.open_read(doc).await.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_children_are_name_ordered() {
        let store = MemoryStore::new();
        store.put("/dir/zebra", "z").unwrap();
        store.put("/dir/alpha", "a").unwrap();
        store.put("/dir/middle", "m").unwrap();

        let dir = store.mkdir_all("/dir").unwrap();
        let names: Vec<String> = store
            .list_children(&dir)
            .await
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["alpha", "middle", "zebra"]);
    }

    #[tokio::test]
    async fn test_read_is_chunked() {
        let store = MemoryStore::with_chunk_size(4);
        let doc = store.put("/file.bin", vec![7u8; 10]).unwrap();

        let chunks: Vec<Bytes> = store.open_read(&doc).await.unwrap().try_collect().await.unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_sink_is_atomic() {
        let store = MemoryStore::new();
        let doc = store.put("/file.txt", "original").unwrap();

        let mut sink = store.open_write(&doc).await.unwrap();
        sink.write(Bytes::from_static(b"new ")).await.unwrap();
        // Staged bytes are invisible until commit.
        assert_eq!(store.read("/file.txt").unwrap(), "original");
        sink.write(Bytes::from_static(b"content")).await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(read_all(&store, &doc).await, b"new content");

        let mut sink = store.open_write(&doc).await.unwrap();
        sink.write(Bytes::from_static(b"discarded")).await.unwrap();
        sink.abort().await;
        assert_eq!(store.read("/file.txt").unwrap(), "new content");
    }

    #[tokio::test]
    async fn test_create_conflicts() {
        let store = MemoryStore::new();
        let root = store.root();
        store.create_document(&root, "a").await.unwrap();

        assert!(matches!(
            store.create_collection(&root, "a").await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.create_document(&root, "bad/name").await,
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_recursive() {
        let store = MemoryStore::new();
        store.put("/tree/a/b/c.txt", "c").unwrap();
        store.put("/tree/d.txt", "d").unwrap();
        store.put("/keep.txt", "k").unwrap();
        assert_eq!(store.len(), 7);

        let tree = store.mkdir_all("/tree").unwrap();
        store.delete(&tree.into()).await.unwrap();

        assert!(!store.exists("/tree"));
        assert!(store.exists("/keep.txt"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = MemoryStore::new();
        let doc = store.put("/victim.txt", "data").unwrap();
        store.inject_fault(FaultOp::Delete, "victim.txt");

        assert!(store.delete(&doc.clone().into()).await.is_err());
        assert!(store.exists("/victim.txt"));

        store.clear_faults();
        store.delete(&doc.into()).await.unwrap();
        assert!(!store.exists("/victim.txt"));
    }

    #[tokio::test]
    async fn test_root_cannot_be_deleted() {
        let store = MemoryStore::new();
        let root = store.root();
        assert!(store.delete(&root.into()).await.is_err());
    }
}
