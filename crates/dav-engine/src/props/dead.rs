//! Dead property persistence.

use super::{Property, PropertyName};
use crate::error::StoreResult;
use crate::store::ResourceId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// One step of a property patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Set (or replace) a property.
    Set(Property),
    /// Remove a property; removing an absent property is not an error.
    Remove(PropertyName),
}

impl PatchOp {
    /// The property name the step touches.
    pub fn name(&self) -> &PropertyName {
        match self {
            PatchOp::Set(p) => &p.name,
            PatchOp::Remove(n) => n,
        }
    }
}

/// Storage for client-supplied properties, keyed by resource identity.
///
/// Values are persisted independently of content and stay bound to the
/// resource until removed or until the resource is deleted.
#[async_trait]
pub trait DeadPropertyStore: Send + Sync + 'static {
    /// A single property.
    async fn get(&self, id: ResourceId, name: &PropertyName) -> StoreResult<Option<Property>>;

    /// Every property of a resource, in name order.
    async fn list(&self, id: ResourceId) -> StoreResult<Vec<Property>>;

    /// Set one property.
    async fn set(&self, id: ResourceId, property: Property) -> StoreResult<()>;

    /// Remove one property, returning it if it existed.
    async fn remove(&self, id: ResourceId, name: &PropertyName) -> StoreResult<Option<Property>>;

    /// Apply every step or none.
    async fn apply(&self, id: ResourceId, ops: Vec<PatchOp>) -> StoreResult<()>;

    /// Replace the properties of `to` with a copy of those of `from`.
    async fn copy_all(&self, from: ResourceId, to: ResourceId) -> StoreResult<()>;

    /// Drop every property of a deleted resource.
    async fn forget(&self, id: ResourceId) -> StoreResult<()>;
}

type PropertyMap = BTreeMap<PropertyName, Property>;

/// In-memory [`DeadPropertyStore`].
///
/// Each resource has its own lock; readers get a snapshot copy so no lock is
/// held after a call returns.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    resources: DashMap<ResourceId, Arc<RwLock<PropertyMap>>>,
}

impl MemoryPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: ResourceId) -> Arc<RwLock<PropertyMap>> {
        self.resources.entry(id).or_default().clone()
    }

    fn existing(&self, id: ResourceId) -> Option<Arc<RwLock<PropertyMap>>> {
        self.resources.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Number of resources that have at least one property.
    pub fn resource_count(&self) -> usize {
        self.resources
            .iter()
            .filter(|e| !e.value().read().is_empty())
            .count()
    }
}

#[async_trait]
impl DeadPropertyStore for MemoryPropertyStore {
    async fn get(&self, id: ResourceId, name: &PropertyName) -> StoreResult<Option<Property>> {
        Ok(self
            .existing(id)
            .and_then(|props| props.read().get(name).cloned()))
    }

    async fn list(&self, id: ResourceId) -> StoreResult<Vec<Property>> {
        Ok(self
            .existing(id)
            .map(|props| props.read().values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set(&self, id: ResourceId, property: Property) -> StoreResult<()> {
        trace!(%id, name = %property.name, "Setting dead property");
        self.entry(id)
            .write()
            .insert(property.name.clone(), property);
        Ok(())
    }

    async fn remove(&self, id: ResourceId, name: &PropertyName) -> StoreResult<Option<Property>> {
        Ok(self.existing(id).and_then(|props| props.write().remove(name)))
    }

    async fn apply(&self, id: ResourceId, ops: Vec<PatchOp>) -> StoreResult<()> {
        let props = self.entry(id);
        let mut guard = props.write();
        let mut next = guard.clone();
        for op in ops {
            match op {
                PatchOp::Set(p) => {
                    next.insert(p.name.clone(), p);
                }
                PatchOp::Remove(name) => {
                    next.remove(&name);
                }
            }
        }
        *guard = next;
        Ok(())
    }

    async fn copy_all(&self, from: ResourceId, to: ResourceId) -> StoreResult<()> {
        let snapshot = self
            .existing(from)
            .map(|props| props.read().clone())
            .unwrap_or_default();
        if snapshot.is_empty() {
            self.resources.remove(&to);
        } else {
            *self.entry(to).write() = snapshot;
        }
        Ok(())
    }

    async fn forget(&self, id: ResourceId) -> StoreResult<()> {
        self.resources.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(local: &str) -> PropertyName {
        PropertyName::new("urn:test", local)
    }

    #[tokio::test]
    async fn test_list_is_name_ordered() {
        let store = MemoryPropertyStore::new();
        let id = ResourceId::new(1);
        store.set(id, Property::new(name("zeta"), "z")).await.unwrap();
        store.set(id, Property::new(name("alpha"), "a")).await.unwrap();

        let names: Vec<String> = store
            .list(id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name.local)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_copy_all_replaces_destination() {
        let store = MemoryPropertyStore::new();
        let (src, dst) = (ResourceId::new(1), ResourceId::new(2));
        store.set(src, Property::new(name("a"), "1")).await.unwrap();
        store.set(dst, Property::new(name("old"), "x")).await.unwrap();

        store.copy_all(src, dst).await.unwrap();
        let copied = store.list(dst).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].name, name("a"));

        // The source keeps its properties.
        assert_eq!(store.list(src).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forget() {
        let store = MemoryPropertyStore::new();
        let id = ResourceId::new(7);
        store
            .set(id, Property::new(name("a"), "1").with_language("en"))
            .await
            .unwrap();
        assert_eq!(store.resource_count(), 1);

        store.forget(id).await.unwrap();
        assert!(store.list(id).await.unwrap().is_empty());
        assert_eq!(store.resource_count(), 0);
    }
}
