//! Destination classification.

use crate::error::DavResult;
use crate::path::DavPath;
use crate::store::{Collection, Document, Resource, Store};
use crate::traverse::{resolve_parent, try_resolve};
use std::fmt;

/// What a transfer finds at its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Nothing there yet; the transfer creates `name` inside `parent`.
    Missing {
        /// Existing parent collection.
        parent: Collection,
        /// Member name to create.
        name: String,
    },
    /// A document, replaceable only with overwrite.
    ExistingDocument(Document),
    /// A collection, replaceable only as a whole.
    ExistingCollection(Collection),
}

impl Target {
    /// The kind of this target.
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Missing { .. } => TargetKind::Missing,
            Target::ExistingDocument(_) => TargetKind::ExistingDocument,
            Target::ExistingCollection(_) => TargetKind::ExistingCollection,
        }
    }
}

/// [`Target`] without handles, as reported in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// Destination did not exist.
    Missing,
    /// Destination was a document.
    ExistingDocument,
    /// Destination was a collection.
    ExistingCollection,
    /// Not determined (skipped entries, failed remote requests).
    Unknown,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Classify the destination `path`.
///
/// A missing destination whose parent does not exist is a `Conflict`.
pub async fn classify(store: &dyn Store, path: &DavPath) -> DavResult<Target> {
    if let Some(chain) = try_resolve(store, path).await? {
        return Ok(match chain.target {
            Resource::Document(d) => Target::ExistingDocument(d),
            Resource::Collection(c) => Target::ExistingCollection(c),
        });
    }
    let (parent, name) = resolve_parent(store, path).await?;
    Ok(Target::Missing { parent, name })
}
