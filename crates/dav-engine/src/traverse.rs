//! Path resolution against a [`Store`].
//!
//! Resolution is read-only: it walks `child` lookups from the store root and
//! never creates anything. Walking through a document is treated the same as
//! a missing member.

use crate::error::{DavError, DavResult};
use crate::path::DavPath;
use crate::store::{Collection, Resource, Store};
use tracing::trace;

/// Resolved handles for every segment of a path.
#[derive(Debug, Clone)]
pub struct ResourceChain {
    /// Collections from the root down to the target's parent.
    pub ancestors: Vec<Collection>,
    /// The resource the path names.
    pub target: Resource,
}

impl ResourceChain {
    /// The collection holding the target, `None` for the root.
    pub fn parent(&self) -> Option<&Collection> {
        self.ancestors.last()
    }
}

/// Resolve `path` into the chain of handles from the store root.
pub async fn resolve<S: Store + ?Sized>(store: &S, path: &DavPath) -> DavResult<ResourceChain> {
    let mut ancestors = Vec::with_capacity(path.depth());
    let mut current = Resource::Collection(store.root());

    for segment in path.components() {
        let Resource::Collection(collection) = current else {
            trace!(%path, segment, "Traversal hit a document");
            return Err(DavError::NotFound(path.to_string()));
        };
        let next = store
            .child(&collection, segment)
            .await?
            .ok_or_else(|| DavError::NotFound(path.to_string()))?;
        ancestors.push(collection);
        current = next;
    }

    Ok(ResourceChain {
        ancestors,
        target: current,
    })
}

/// Resolve `path` if it exists.
pub async fn try_resolve<S: Store + ?Sized>(
    store: &S,
    path: &DavPath,
) -> DavResult<Option<ResourceChain>> {
    match resolve(store, path).await {
        Ok(chain) => Ok(Some(chain)),
        Err(DavError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Resolve the parent collection of `path` for a create operation.
///
/// Returns the parent handle and the member name. A missing parent, or a
/// parent that is a document, is a `Conflict`; the root has no parent and is
/// `MethodNotAllowed`.
pub async fn resolve_parent<S: Store + ?Sized>(
    store: &S,
    path: &DavPath,
) -> DavResult<(Collection, String)> {
    let (Some(parent_path), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(DavError::MethodNotAllowed(
            "the root collection cannot be created or replaced".to_string(),
        ));
    };
    let parent = match resolve(store, &parent_path).await {
        Ok(chain) => chain.target,
        Err(DavError::NotFound(_)) => {
            return Err(DavError::Conflict(format!(
                "parent collection {parent_path} does not exist"
            )));
        }
        Err(e) => return Err(e),
    };
    match parent {
        Resource::Collection(c) => Ok((c, name.to_string())),
        Resource::Document(_) => Err(DavError::Conflict(format!(
            "parent {parent_path} is not a collection"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn p(s: &str) -> DavPath {
        DavPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_returns_chain() {
        let store = MemoryStore::new();
        store.put("/a/b/c.txt", "x").unwrap();

        let chain = resolve(&store, &p("/a/b/c.txt")).await.unwrap();
        let names: Vec<&str> = chain.ancestors.iter().map(Collection::name).collect();
        assert_eq!(names, vec!["", "a", "b"]);
        assert_eq!(chain.target.name(), "c.txt");
        assert!(!chain.target.is_collection());
    }

    #[tokio::test]
    async fn test_resolve_root() {
        let store = MemoryStore::new();
        let chain = resolve(&store, &DavPath::root()).await.unwrap();
        assert!(chain.ancestors.is_empty());
        assert!(chain.parent().is_none());
        assert!(chain.target.is_collection());
    }

    #[tokio::test]
    async fn test_resolve_missing_and_through_document() {
        let store = MemoryStore::new();
        store.put("/file.txt", "x").unwrap();

        assert!(matches!(
            resolve(&store, &p("/missing")).await,
            Err(DavError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&store, &p("/file.txt/child")).await,
            Err(DavError::NotFound(_))
        ));
        assert!(try_resolve(&store, &p("/missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_parent() {
        let store = MemoryStore::new();
        store.put("/dir/file.txt", "x").unwrap();

        let (parent, name) = resolve_parent(&store, &p("/dir/new.txt")).await.unwrap();
        assert_eq!(parent.name(), "dir");
        assert_eq!(name, "new.txt");

        assert!(matches!(
            resolve_parent(&store, &p("/nope/new.txt")).await,
            Err(DavError::Conflict(_))
        ));
        assert!(matches!(
            resolve_parent(&store, &p("/dir/file.txt/new")).await,
            Err(DavError::Conflict(_))
        ));
        assert!(matches!(
            resolve_parent(&store, &DavPath::root()).await,
            Err(DavError::MethodNotAllowed(_))
        ));
    }
}
