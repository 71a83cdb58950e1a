//! Computed (live) properties.

use super::PropertyName;
use crate::error::DavResult;
use crate::locks::{ActiveLock, LockManager, LockScope};
use crate::path::DavPath;
use crate::store::{Metadata, Resource, ResourceId, ResourceKind, Store};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;

/// HTTP-date format used by `getlastmodified`.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Everything a live property may be computed from.
///
/// Store metadata is fetched at most once per context, on first use.
pub struct LiveContext<'a> {
    store: &'a dyn Store,
    locks: &'a LockManager,
    path: &'a DavPath,
    resource: &'a Resource,
    metadata: OnceCell<Metadata>,
}

impl<'a> LiveContext<'a> {
    /// Bind a context to a resolved resource.
    pub fn new(
        store: &'a dyn Store,
        locks: &'a LockManager,
        path: &'a DavPath,
        resource: &'a Resource,
    ) -> Self {
        Self {
            store,
            locks,
            path,
            resource,
            metadata: OnceCell::new(),
        }
    }

    /// The resource the properties belong to.
    pub fn resource(&self) -> &Resource {
        self.resource
    }

    /// Path of the resource.
    pub fn path(&self) -> &DavPath {
        self.path
    }

    async fn metadata(&self) -> DavResult<&Metadata> {
        Ok(self
            .metadata
            .get_or_try_init(|| self.store.metadata(self.resource))
            .await?)
    }
}

/// The live properties the engine computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiveProperty {
    /// `DAV:resourcetype`
    ResourceType,
    /// `DAV:displayname`
    DisplayName,
    /// `DAV:supportedlock`
    SupportedLock,
    /// `DAV:getcontentlength`
    GetContentLength,
    /// `DAV:getcontenttype`
    GetContentType,
    /// `DAV:getlastmodified`
    GetLastModified,
    /// `DAV:creationdate`
    CreationDate,
    /// `DAV:getetag`
    GetEtag,
    /// `DAV:lockdiscovery`
    LockDiscovery,
    /// `DAV:quota-used-bytes` (RFC 4331)
    QuotaUsedBytes,
}

impl LiveProperty {
    /// Every live property, cheapest first.
    pub const ALL: [LiveProperty; 10] = [
        LiveProperty::ResourceType,
        LiveProperty::DisplayName,
        LiveProperty::SupportedLock,
        LiveProperty::GetContentLength,
        LiveProperty::GetContentType,
        LiveProperty::GetLastModified,
        LiveProperty::CreationDate,
        LiveProperty::GetEtag,
        LiveProperty::LockDiscovery,
        LiveProperty::QuotaUsedBytes,
    ];

    /// Local name in the `DAV:` namespace.
    pub fn local_name(self) -> &'static str {
        match self {
            LiveProperty::ResourceType => "resourcetype",
            LiveProperty::DisplayName => "displayname",
            LiveProperty::SupportedLock => "supportedlock",
            LiveProperty::GetContentLength => "getcontentlength",
            LiveProperty::GetContentType => "getcontenttype",
            LiveProperty::GetLastModified => "getlastmodified",
            LiveProperty::CreationDate => "creationdate",
            LiveProperty::GetEtag => "getetag",
            LiveProperty::LockDiscovery => "lockdiscovery",
            LiveProperty::QuotaUsedBytes => "quota-used-bytes",
        }
    }

    /// Full property name.
    pub fn name(self) -> PropertyName {
        PropertyName::dav(self.local_name())
    }

    /// Look up the live property with this name.
    pub fn from_name(name: &PropertyName) -> Option<Self> {
        if !name.is_dav() {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|p| p.local_name() == name.local)
    }

    /// Relative cost of computing the value.
    pub fn cost(self) -> u32 {
        match self {
            LiveProperty::ResourceType | LiveProperty::DisplayName | LiveProperty::SupportedLock => 0,
            LiveProperty::GetContentLength
            | LiveProperty::GetContentType
            | LiveProperty::GetLastModified
            | LiveProperty::CreationDate => 1,
            LiveProperty::GetEtag => 2,
            LiveProperty::LockDiscovery => 3,
            LiveProperty::QuotaUsedBytes => 10,
        }
    }

    /// Whether the property has a value for resources of `kind`.
    pub fn applies_to(self, kind: ResourceKind) -> bool {
        match self {
            LiveProperty::GetContentLength
            | LiveProperty::GetContentType
            | LiveProperty::GetEtag => kind == ResourceKind::Document,
            LiveProperty::QuotaUsedBytes => kind == ResourceKind::Collection,
            _ => true,
        }
    }

    /// Whether `allprop` includes this property.
    pub fn in_allprop(self) -> bool {
        !matches!(self, LiveProperty::QuotaUsedBytes)
    }

    /// Compute the value, `None` when the property does not apply.
    pub async fn compute(self, ctx: &LiveContext<'_>) -> DavResult<Option<String>> {
        let kind = ctx.resource.kind();
        if !self.applies_to(kind) {
            return Ok(None);
        }
        let value = match self {
            LiveProperty::ResourceType => match kind {
                ResourceKind::Collection => "<D:collection/>".to_string(),
                ResourceKind::Document => String::new(),
            },
            LiveProperty::DisplayName => ctx.resource.name().to_string(),
            LiveProperty::SupportedLock => supported_lock(),
            LiveProperty::GetContentLength => ctx.metadata().await?.len.to_string(),
            LiveProperty::GetContentType => ctx
                .metadata()
                .await?
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            LiveProperty::GetLastModified => http_date(ctx.metadata().await?.modified),
            LiveProperty::CreationDate => DateTime::<Utc>::from(ctx.metadata().await?.created)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            LiveProperty::GetEtag => etag(ctx.resource.id(), ctx.metadata().await?),
            LiveProperty::LockDiscovery => lock_discovery(&ctx.locks.discover(ctx.path)),
            LiveProperty::QuotaUsedBytes => used_bytes(ctx.store, ctx.resource).await?.to_string(),
        };
        Ok(Some(value))
    }
}

/// Format a timestamp as an HTTP-date.
pub(crate) fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE).to_string()
}

/// Strong entity tag derived from identity, length and modification time.
pub fn etag(id: ResourceId, metadata: &Metadata) -> String {
    let modified = metadata
        .modified
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let mut hasher = Sha256::new();
    hasher.update(id.get().to_le_bytes());
    hasher.update(metadata.len.to_le_bytes());
    hasher.update(modified.to_le_bytes());
    let digest = hasher.finalize();
    format!("\"{}\"", hex::encode(&digest[..8]))
}

fn supported_lock() -> String {
    [LockScope::Exclusive, LockScope::Shared]
        .iter()
        .fold(String::new(), |mut out, scope| {
            let _ = write!(
                out,
                "<D:lockentry><D:lockscope><D:{scope}/></D:lockscope>\
                 <D:locktype><D:write/></D:locktype></D:lockentry>"
            );
            out
        })
}

fn lock_discovery(locks: &[ActiveLock]) -> String {
    let mut out = String::new();
    for lock in locks {
        let _ = write!(
            out,
            "<D:activelock><D:locktype><D:write/></D:locktype>\
             <D:lockscope><D:{}/></D:lockscope><D:depth>{}</D:depth>",
            lock.scope, lock.depth
        );
        if let Some(owner) = &lock.owner {
            let _ = write!(out, "<D:owner>{owner}</D:owner>");
        }
        let timeout = match lock.remaining() {
            Some(left) => format!("Second-{}", left.as_secs()),
            None => "Infinite".to_string(),
        };
        let _ = write!(
            out,
            "<D:timeout>{timeout}</D:timeout>\
             <D:locktoken><D:href>{}</D:href></D:locktoken>\
             <D:lockroot><D:href>{}</D:href></D:lockroot></D:activelock>",
            lock.token, lock.path
        );
    }
    out
}

/// Total content length of every document below `resource`.
async fn used_bytes(store: &dyn Store, resource: &Resource) -> DavResult<u64> {
    let mut total = 0;
    let mut stack = vec![resource.clone()];
    while let Some(current) = stack.pop() {
        match &current {
            Resource::Document(_) => total += store.metadata(&current).await?.len,
            Resource::Collection(c) => stack.extend(store.list_children(c).await?),
        }
    }
    Ok(total)
}
