//! Hierarchical `/`-separated identifiers.
//!
//! A `PathId` names an app or a group inside the tree, e.g. `/prod/db/pg`.
//! Relative ids (no leading slash, possibly containing `..`) appear only
//! in dependency declarations and are resolved against the declaring
//! node's path before use.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when parsing or resolving a path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("invalid path segment {0:?}")]
    InvalidSegment(String),

    #[error("relative path {0:?} escapes the root")]
    EscapesRoot(String),

    #[error("expected an absolute path, got {0:?}")]
    NotAbsolute(String),
}

fn segment_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("segment regex"))
}

/// Validate one path segment. Dots separate sub-names inside a single
/// segment; each sub-name must match `[a-z0-9]([a-z0-9-]*[a-z0-9])?`.
fn valid_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    segment.split('.').all(|part| segment_part_re().is_match(part))
}

/// A hierarchical identifier. Equality is by canonical form: two ids
/// are equal when their segments and absoluteness match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId {
    segments: Vec<String>,
    absolute: bool,
}

impl PathId {
    /// The root path `/`.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            absolute: true,
        }
    }

    /// Parse a path, validating every segment. `..` and `.` segments
    /// are accepted only in relative paths.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let absolute = raw.starts_with('/');
        let trimmed = raw.trim_matches('/');
        let mut segments = Vec::new();
        if !trimmed.is_empty() {
            for segment in trimmed.split('/') {
                let traversal = segment == ".." || segment == ".";
                if traversal && absolute {
                    return Err(PathError::InvalidSegment(segment.to_string()));
                }
                if !traversal && !valid_segment(segment) {
                    return Err(PathError::InvalidSegment(segment.to_string()));
                }
                segments.push(segment.to_string());
            }
        }
        Ok(Self { segments, absolute })
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The enclosing path. The root is its own parent.
    pub fn parent(&self) -> PathId {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            segments,
            absolute: self.absolute,
        }
    }

    /// Append one segment.
    pub fn append(&self, segment: &str) -> Result<PathId, PathError> {
        if !valid_segment(segment) {
            return Err(PathError::InvalidSegment(segment.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self {
            segments,
            absolute: self.absolute,
        })
    }

    /// Resolve this path against a base. Absolute paths resolve to
    /// themselves; relative paths are walked from the base with `..`
    /// popping one level.
    pub fn resolve(&self, base: &PathId) -> Result<PathId, PathError> {
        if self.absolute {
            return Ok(self.clone());
        }
        let mut segments = base.segments.clone();
        for segment in &self.segments {
            match segment.as_str() {
                "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::EscapesRoot(self.to_string()));
                    }
                }
                other => segments.push(other.to_string()),
            }
        }
        Ok(PathId {
            segments,
            absolute: true,
        })
    }

    /// Whether `other` is this path or lives underneath it.
    pub fn contains(&self, other: &PathId) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Storage-safe rendering: segments joined by `_` (underscore is
    /// outside the segment alphabet, so the encoding is unambiguous).
    pub fn safe_path(&self) -> String {
        self.segments.join("_")
    }

    /// Inverse of [`safe_path`](Self::safe_path).
    pub fn from_safe_path(safe: &str) -> Result<Self, PathError> {
        if safe.is_empty() {
            return Ok(Self::root());
        }
        let joined = format!("/{}", safe.split('_').collect::<Vec<_>>().join("/"));
        Self::parse(&joined)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute {
            write!(f, "/{}", self.segments.join("/"))
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl std::str::FromStr for PathId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> PathId {
        PathId::parse(raw).unwrap()
    }

    #[test]
    fn parses_absolute_paths() {
        let p = path("/prod/db/pg");
        assert!(p.is_absolute());
        assert_eq!(p.segments(), &["prod", "db", "pg"]);
        assert_eq!(p.to_string(), "/prod/db/pg");
    }

    #[test]
    fn trailing_slash_is_canonicalized_away() {
        assert_eq!(path("/prod/db/"), path("/prod/db"));
    }

    #[test]
    fn root_round_trips() {
        let root = PathId::root();
        assert!(root.is_root());
        assert_eq!(root.to_string(), "/");
        assert_eq!(path("/"), root);
    }

    #[test]
    fn rejects_empty_and_bad_segments() {
        assert!(PathId::parse("/a//b").is_err());
        assert!(PathId::parse("/UPPER").is_err());
        assert!(PathId::parse("/-dash").is_err());
        assert!(PathId::parse("/dash-").is_err());
        assert!(PathId::parse("/under_score").is_err());
    }

    #[test]
    fn dots_allowed_inside_a_segment() {
        let p = path("/prod/app.v2");
        assert_eq!(p.name(), Some("app.v2"));
        assert!(PathId::parse("/prod/.hidden").is_err());
        assert!(PathId::parse("/prod/app..v2").is_err());
    }

    #[test]
    fn parent_and_append() {
        let p = path("/a/b/c");
        assert_eq!(p.parent(), path("/a/b"));
        assert_eq!(PathId::root().parent(), PathId::root());
        assert_eq!(path("/a/b").append("c").unwrap(), p);
        assert!(path("/a").append("B").is_err());
    }

    #[test]
    fn relative_resolution() {
        let base = path("/prod/db");
        assert_eq!(path("pg").resolve(&base).unwrap(), path("/prod/db/pg"));
        assert_eq!(
            PathId::parse("../cache/redis").unwrap().resolve(&base).unwrap(),
            path("/prod/cache/redis")
        );
        assert_eq!(path("/other").resolve(&base).unwrap(), path("/other"));
    }

    #[test]
    fn relative_resolution_cannot_escape_root() {
        let base = path("/prod");
        let rel = PathId::parse("../../oops").unwrap();
        assert_eq!(
            rel.resolve(&base),
            Err(PathError::EscapesRoot("../../oops".to_string()))
        );
    }

    #[test]
    fn traversal_segments_rejected_in_absolute_paths() {
        assert!(PathId::parse("/a/../b").is_err());
    }

    #[test]
    fn containment() {
        assert!(path("/prod").contains(&path("/prod/db")));
        assert!(path("/prod").contains(&path("/prod")));
        assert!(!path("/prod/db").contains(&path("/prod")));
        assert!(PathId::root().contains(&path("/anything")));
    }

    #[test]
    fn safe_path_round_trips() {
        let p = path("/prod/app.v2/web");
        assert_eq!(p.safe_path(), "prod_app.v2_web");
        assert_eq!(PathId::from_safe_path("prod_app.v2_web").unwrap(), p);
    }

    #[test]
    fn serde_uses_display_form() {
        let p = path("/prod/db");
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"/prod/db\"");
        let back: PathId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
