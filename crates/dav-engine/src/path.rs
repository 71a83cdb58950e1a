//! Normalized logical paths inside a DAV store.
//!
//! A [`DavPath`] is the request path after normalization: relative to the
//! store root, `/`-separated, with no empty, `.` or `..` segments. Lock
//! scopes, property ownership and transfer destinations are all keyed by it.

use relative_path::{RelativePath, RelativePathBuf};
use std::fmt;
use thiserror::Error;

/// Reasons a raw request path is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A `..` segment would leave the store root.
    #[error("path escapes the store root: {0}")]
    Escape(String),

    /// A segment contains a character the engine refuses to store.
    #[error("segment {segment:?} contains disallowed character {character:?}")]
    DisallowedCharacter {
        /// The offending segment.
        segment: String,
        /// The offending character.
        character: char,
    },

    /// A MOVE/COPY destination equals or lies inside its source.
    #[error("destination {to} overlaps source {from}")]
    Overlapping {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },

    /// The request path does not start with the configured mount prefix.
    #[error("path {path} is outside the mount {mount}")]
    OutsideMount {
        /// The request path.
        path: String,
        /// The configured mount prefix.
        mount: String,
    },
}

/// Normalized path within a DAV store.
///
/// # Examples
///
/// ```
/// use dav_engine::DavPath;
///
/// let path = DavPath::parse("/docs//./drafts/../report.txt").unwrap();
/// assert_eq!(path.as_str(), "docs/report.txt");
/// assert_eq!(path.to_string(), "/docs/report.txt");
///
/// assert!(DavPath::parse("/../etc/passwd").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DavPath(RelativePathBuf);

impl DavPath {
    /// The store root.
    #[inline]
    pub fn root() -> Self {
        DavPath(RelativePathBuf::new())
    }

    /// Parse and normalize a raw (already percent-decoded) request path.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::Escape(raw.to_string()));
                    }
                }
                name => {
                    validate_segment(name)?;
                    segments.push(name);
                }
            }
        }
        Ok(DavPath(RelativePathBuf::from(segments.join("/"))))
    }

    /// Check if this is the store root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    /// Root-relative string form (no leading slash, empty for the root).
    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the underlying `RelativePath`.
    #[inline]
    pub fn as_relative_path(&self) -> &RelativePath {
        &self.0
    }

    /// Join a single member name onto this path.
    ///
    /// The name must be a valid segment; callers pass names that came from
    /// the store or from a parsed path.
    pub fn join(&self, name: impl AsRef<str>) -> Self {
        DavPath(self.0.join(name.as_ref()))
    }

    /// Parent path, `None` for the root.
    pub fn parent(&self) -> Option<DavPath> {
        self.0.parent().map(|p| DavPath(p.to_relative_path_buf()))
    }

    /// Final segment, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    /// Iterate over the segments of this path.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// Number of segments (0 for the root).
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Every proper ancestor, from the root down to the parent.
    pub fn ancestors(&self) -> Vec<DavPath> {
        let mut out = Vec::with_capacity(self.depth());
        let mut current = self.parent();
        while let Some(p) = current {
            current = p.parent();
            out.push(p);
        }
        out.reverse();
        out
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other
            .as_str()
            .strip_prefix(self.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Whether `other` equals `self` or lies beneath it.
    pub fn contains(&self, other: &DavPath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Re-root `self` from `from` onto `to`.
    ///
    /// Returns `None` when `self` does not lie within `from`.
    pub fn rebase(&self, from: &DavPath, to: &DavPath) -> Option<DavPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let rest = if from.is_root() {
            self.as_str()
        } else {
            &self.as_str()[from.as_str().len() + 1..]
        };
        Some(DavPath(to.0.join(rest)))
    }
}

/// Reject control characters (including NUL) and backslashes.
fn validate_segment(segment: &str) -> Result<(), PathError> {
    if let Some(character) = segment.chars().find(|c| c.is_control() || *c == '\\') {
        return Err(PathError::DisallowedCharacter {
            segment: segment.to_string(),
            character,
        });
    }
    Ok(())
}

/// Whether `name` is acceptable as a single member name.
pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && validate_segment(name).is_ok()
}

impl AsRef<str> for DavPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Locates request paths inside the configured mount prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    prefix: DavPath,
}

impl Mount {
    /// Create a mount from a prefix such as `/dav`.
    pub fn new(prefix: &str) -> Result<Self, PathError> {
        Ok(Self {
            prefix: DavPath::parse(prefix)?,
        })
    }

    /// The normalized mount prefix.
    pub fn prefix(&self) -> &DavPath {
        &self.prefix
    }

    /// Translate a raw request path into a store path.
    pub fn locate(&self, raw: &str) -> Result<DavPath, PathError> {
        let full = DavPath::parse(raw)?;
        full.rebase(&self.prefix, &DavPath::root())
            .ok_or_else(|| PathError::OutsideMount {
                path: raw.to_string(),
                mount: self.prefix.to_string(),
            })
    }
}

impl Default for Mount {
    fn default() -> Self {
        Self {
            prefix: DavPath::root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_normalization() {
        assert_eq!(DavPath::parse("/").unwrap(), DavPath::root());
        assert_eq!(DavPath::parse("").unwrap(), DavPath::root());
        assert_eq!(DavPath::parse("//a///b/").unwrap().as_str(), "a/b");
        assert_eq!(DavPath::parse("/a/./b/../c").unwrap().as_str(), "a/c");
    }

    #[test]
    fn test_parse_rejects_escape() {
        assert!(matches!(DavPath::parse("/.."), Err(PathError::Escape(_))));
        assert!(matches!(
            DavPath::parse("/a/../../b"),
            Err(PathError::Escape(_))
        ));
    }

    #[test]
    fn test_parse_rejects_control_characters() {
        let err = DavPath::parse("/a/b\0c").unwrap_err();
        assert_eq!(
            err,
            PathError::DisallowedCharacter {
                segment: "b\0c".to_string(),
                character: '\0'
            }
        );
        assert!(DavPath::parse("/a\\b").is_err());
        assert!(DavPath::parse("/line\nbreak").is_err());
    }

    #[test]
    fn test_ancestors() {
        let path = DavPath::parse("/a/b/c").unwrap();
        let ancestors: Vec<String> = path.ancestors().iter().map(ToString::to_string).collect();
        assert_eq!(ancestors, vec!["/", "/a", "/a/b"]);
        assert!(DavPath::root().ancestors().is_empty());
    }

    #[test]
    fn test_is_ancestor_of() {
        let a = DavPath::parse("/a").unwrap();
        let ab = DavPath::parse("/a/b").unwrap();
        let ax = DavPath::parse("/ax").unwrap();

        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&ax));
        assert!(!a.is_ancestor_of(&a));
        assert!(DavPath::root().is_ancestor_of(&a));
        assert!(a.contains(&a));
        assert!(!ab.contains(&a));
    }

    #[test]
    fn test_rebase() {
        let from = DavPath::parse("/src").unwrap();
        let to = DavPath::parse("/dst/inner").unwrap();
        let path = DavPath::parse("/src/x/y.txt").unwrap();
        assert_eq!(path.rebase(&from, &to).unwrap().as_str(), "dst/inner/x/y.txt");
        assert_eq!(from.rebase(&from, &to).unwrap(), to);
        assert!(to.rebase(&from, &DavPath::root()).is_none());
    }

    #[test]
    fn test_mount_locate() {
        let mount = Mount::new("/dav").unwrap();
        assert_eq!(mount.locate("/dav/a/b").unwrap().as_str(), "a/b");
        assert!(mount.locate("/dav").unwrap().is_root());
        assert!(matches!(
            mount.locate("/other/a"),
            Err(PathError::OutsideMount { .. })
        ));
        // `..` cannot climb out of the mount either.
        assert!(mount.locate("/dav/../secret").is_err());
    }

    #[test]
    fn test_member_names() {
        assert!(is_valid_member_name("report.txt"));
        assert!(!is_valid_member_name(""));
        assert!(!is_valid_member_name(".."));
        assert!(!is_valid_member_name("a/b"));
    }

    proptest! {
        #[test]
        fn prop_parse_is_idempotent(raw in "(/[a-z.]{0,3}){0,6}") {
            if let Ok(path) = DavPath::parse(&raw) {
                let reparsed = DavPath::parse(&path.to_string()).unwrap();
                prop_assert_eq!(reparsed, path);
            }
        }

        #[test]
        fn prop_parent_is_ancestor(raw in "(/[a-z]{1,3}){1,6}") {
            let path = DavPath::parse(&raw).unwrap();
            let parent = path.parent().unwrap();
            prop_assert!(parent.is_ancestor_of(&path));
            prop_assert_eq!(parent.join(path.file_name().unwrap()), path);
        }
    }
}
