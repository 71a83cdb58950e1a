//! Live and dead properties.
//!
//! [`Properties`] is the per-resource view handlers use. Live properties
//! ([`LiveProperty`]) are computed from store metadata and the lock table at
//! read time and can never be written. Dead properties are opaque
//! client-supplied values held by a [`DeadPropertyStore`] and returned
//! verbatim.
//!
//! Every property has a cost. Selected reads evaluate the requested names
//! cheapest first and never compute a property nobody asked for.

mod dead;
mod live;

pub use dead::{DeadPropertyStore, MemoryPropertyStore, PatchOp};
pub use live::{LiveContext, LiveProperty, etag};
pub(crate) use live::http_date;

use crate::error::{DavError, DavResult};
use http::StatusCode;
use std::fmt;
use tracing::debug;

/// The WebDAV namespace.
pub const DAV_NAMESPACE: &str = "DAV:";

/// Cost assigned to reading a dead property.
pub const DEAD_PROPERTY_COST: u32 = 1;

/// Namespaced property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyName {
    /// Namespace URI.
    pub namespace: String,
    /// Local name.
    pub local: String,
}

impl PropertyName {
    /// Create a property name.
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    /// A name in the `DAV:` namespace.
    pub fn dav(local: impl Into<String>) -> Self {
        Self::new(DAV_NAMESPACE, local)
    }

    /// Whether the name lives in the `DAV:` namespace.
    pub fn is_dav(&self) -> bool {
        self.namespace == DAV_NAMESPACE
    }
}

/// Clark notation: `{namespace}local`.
impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

/// A property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property name.
    pub name: PropertyName,
    /// `xml:lang` of the value, if any.
    pub language: Option<String>,
    /// Value; an opaque XML fragment for dead properties.
    pub value: String,
}

impl Property {
    /// A property without a language tag.
    pub fn new(name: PropertyName, value: impl Into<String>) -> Self {
        Self {
            name,
            language: None,
            value: value.into(),
        }
    }

    /// Set the language tag.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Result of a selected-property read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selected {
    /// Properties found, in request order.
    pub found: Vec<Property>,
    /// Requested names with no value on this resource, in request order.
    pub missing: Vec<PropertyName>,
}

/// Per-name status of a property patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStatus {
    /// Property name.
    pub name: PropertyName,
    /// `200`, `403` or `424`.
    pub status: StatusCode,
}

/// Read cost of a property name.
pub fn cost_of(name: &PropertyName) -> u32 {
    LiveProperty::from_name(name).map_or(DEAD_PROPERTY_COST, LiveProperty::cost)
}

/// Property access for one resource.
pub struct Properties<'a> {
    ctx: LiveContext<'a>,
    dead: &'a dyn DeadPropertyStore,
}

impl<'a> Properties<'a> {
    /// Bind property access to a resource.
    pub fn new(ctx: LiveContext<'a>, dead: &'a dyn DeadPropertyStore) -> Self {
        Self { ctx, dead }
    }

    /// Every property with a value: live properties of the allprop set
    /// first, then dead properties in name order.
    pub async fn get_properties(&self) -> DavResult<Vec<Property>> {
        let mut out = Vec::new();
        for live in LiveProperty::ALL {
            if !live.in_allprop() {
                continue;
            }
            if let Some(value) = live.compute(&self.ctx).await? {
                out.push(Property::new(live.name(), value));
            }
        }
        out.extend(self.dead.list(self.ctx.resource().id()).await?);
        Ok(out)
    }

    /// Names of every property with a value, including live properties
    /// outside the allprop set.
    pub async fn property_names(&self) -> DavResult<Vec<PropertyName>> {
        let kind = self.ctx.resource().kind();
        let mut names: Vec<PropertyName> = LiveProperty::ALL
            .iter()
            .filter(|l| l.applies_to(kind))
            .map(|l| l.name())
            .collect();
        names.extend(
            self.dead
                .list(self.ctx.resource().id())
                .await?
                .into_iter()
                .map(|p| p.name),
        );
        Ok(names)
    }

    /// Value of a single property.
    pub async fn get_value(&self, name: &PropertyName) -> DavResult<Option<Property>> {
        match LiveProperty::from_name(name) {
            Some(live) => Ok(live
                .compute(&self.ctx)
                .await?
                .map(|value| Property::new(live.name(), value))),
            None => Ok(self.dead.get(self.ctx.resource().id(), name).await?),
        }
    }

    /// Read the requested names, cheapest first.
    pub async fn get_selected(&self, names: &[PropertyName]) -> DavResult<Selected> {
        let mut order: Vec<usize> = (0..names.len()).collect();
        order.sort_by_key(|&i| cost_of(&names[i]));

        let mut slots: Vec<Option<Property>> = vec![None; names.len()];
        for i in order {
            slots[i] = self.get_value(&names[i]).await?;
        }

        let mut selected = Selected::default();
        for (name, slot) in names.iter().zip(slots) {
            match slot {
                Some(property) => selected.found.push(property),
                None => selected.missing.push(name.clone()),
            }
        }
        Ok(selected)
    }

    /// Set a dead property.
    pub async fn set_value(&self, property: Property) -> DavResult<()> {
        reject_live(&property.name)?;
        self.dead.set(self.ctx.resource().id(), property).await?;
        Ok(())
    }

    /// Remove a dead property.
    pub async fn remove(&self, name: &PropertyName) -> DavResult<Property> {
        reject_live(name)?;
        self.dead
            .remove(self.ctx.resource().id(), name)
            .await?
            .ok_or_else(|| DavError::NotFound(format!("property {name}")))
    }

    /// Apply a batch of sets and removes atomically.
    ///
    /// If any operation names a live property nothing is applied: live names
    /// report `403 Forbidden` and every other name `424 Failed Dependency`.
    pub async fn patch(&self, ops: Vec<PatchOp>) -> DavResult<Vec<PatchStatus>> {
        let any_live = ops
            .iter()
            .any(|op| LiveProperty::from_name(op.name()).is_some());
        if any_live {
            debug!(path = %self.ctx.path(), "Property patch touches live properties");
            return Ok(ops
                .iter()
                .map(|op| PatchStatus {
                    name: op.name().clone(),
                    status: if LiveProperty::from_name(op.name()).is_some() {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::FAILED_DEPENDENCY
                    },
                })
                .collect());
        }

        let statuses = ops
            .iter()
            .map(|op| PatchStatus {
                name: op.name().clone(),
                status: StatusCode::OK,
            })
            .collect();
        self.dead.apply(self.ctx.resource().id(), ops).await?;
        Ok(statuses)
    }
}

fn reject_live(name: &PropertyName) -> DavResult<()> {
    if LiveProperty::from_name(name).is_some() {
        return Err(DavError::Forbidden(format!(
            "{name} is a live property and cannot be modified"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{LockManager, LockPolicy};
    use crate::path::DavPath;
    use crate::store::{MemoryStore, Resource};

    struct Fixture {
        store: MemoryStore,
        locks: LockManager,
        dead: MemoryPropertyStore,
        path: DavPath,
        resource: Resource,
    }

    impl Fixture {
        async fn document(content: &'static str) -> Self {
            let store = MemoryStore::new();
            let doc = store.put("/doc.txt", content).unwrap();
            Self {
                store,
                locks: LockManager::new(LockPolicy::default()),
                dead: MemoryPropertyStore::new(),
                path: DavPath::parse("/doc.txt").unwrap(),
                resource: doc.into(),
            }
        }

        fn props(&self) -> Properties<'_> {
            let ctx = LiveContext::new(&self.store, &self.locks, &self.path, &self.resource);
            Properties::new(ctx, &self.dead)
        }
    }

    fn custom(local: &str) -> PropertyName {
        PropertyName::new("urn:example", local)
    }

    #[tokio::test]
    async fn test_live_first_then_dead() {
        let fx = Fixture::document("hello").await;
        let props = fx.props();
        props
            .set_value(Property::new(custom("color"), "<x:color>red</x:color>"))
            .await
            .unwrap();

        let all = props.get_properties().await.unwrap();
        let last = all.last().unwrap();
        assert_eq!(last.name, custom("color"));
        assert!(all[0].name.is_dav());
        assert!(all.iter().any(|p| p.name == PropertyName::dav("getcontentlength") && p.value == "5"));
        // quota-used-bytes is a collection property and outside allprop.
        assert!(!all.iter().any(|p| p.name.local == "quota-used-bytes"));
    }

    #[tokio::test]
    async fn test_selected_keeps_request_order() {
        let fx = Fixture::document("hello").await;
        let props = fx.props();
        props.set_value(Property::new(custom("a"), "1")).await.unwrap();

        let names = vec![
            PropertyName::dav("lockdiscovery"),
            custom("missing"),
            custom("a"),
            PropertyName::dav("resourcetype"),
        ];
        let selected = props.get_selected(&names).await.unwrap();
        let found: Vec<&PropertyName> = selected.found.iter().map(|p| &p.name).collect();
        assert_eq!(found, vec![&names[0], &names[2], &names[3]]);
        assert_eq!(selected.missing, vec![custom("missing")]);
    }

    #[tokio::test]
    async fn test_live_properties_are_read_only() {
        let fx = Fixture::document("x").await;
        let props = fx.props();

        let err = props
            .set_value(Property::new(PropertyName::dav("getetag"), "\"forged\""))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(matches!(
            props.remove(&PropertyName::dav("displayname")).await,
            Err(DavError::Forbidden(_))
        ));
        assert!(matches!(
            props.remove(&custom("absent")).await,
            Err(DavError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_patch_is_atomic() {
        let fx = Fixture::document("x").await;
        let props = fx.props();
        props.set_value(Property::new(custom("keep"), "1")).await.unwrap();

        let statuses = props
            .patch(vec![
                PatchOp::Set(Property::new(custom("new"), "2")),
                PatchOp::Remove(custom("keep")),
                PatchOp::Set(Property::new(PropertyName::dav("getcontentlength"), "9")),
            ])
            .await
            .unwrap();
        let codes: Vec<StatusCode> = statuses.iter().map(|s| s.status).collect();
        assert_eq!(
            codes,
            vec![
                StatusCode::FAILED_DEPENDENCY,
                StatusCode::FAILED_DEPENDENCY,
                StatusCode::FORBIDDEN
            ]
        );
        assert!(props.get_value(&custom("keep")).await.unwrap().is_some());
        assert!(props.get_value(&custom("new")).await.unwrap().is_none());

        props
            .patch(vec![
                PatchOp::Set(Property::new(custom("new"), "2")),
                PatchOp::Remove(custom("keep")),
            ])
            .await
            .unwrap();
        assert!(props.get_value(&custom("keep")).await.unwrap().is_none());
        assert_eq!(props.get_value(&custom("new")).await.unwrap().unwrap().value, "2");
    }

    #[tokio::test]
    async fn test_property_names_include_quota_for_collections() {
        let store = MemoryStore::new();
        store.put("/dir/a", "abc").unwrap();
        store.put("/dir/sub/b", "de").unwrap();
        let locks = LockManager::new(LockPolicy::default());
        let dead = MemoryPropertyStore::new();
        let path = DavPath::parse("/dir").unwrap();
        let resource: Resource = store.mkdir_all("/dir").unwrap().into();

        let ctx = LiveContext::new(&store, &locks, &path, &resource);
        let props = Properties::new(ctx, &dead);
        let names = props.property_names().await.unwrap();
        assert!(names.contains(&PropertyName::dav("quota-used-bytes")));
        assert!(!names.contains(&PropertyName::dav("getcontentlength")));

        let quota = props
            .get_value(&PropertyName::dav("quota-used-bytes"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.value, "5");
    }
}
