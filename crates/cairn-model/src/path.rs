//! Hierarchical item paths (`/software/items/finger`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// A normalized, absolute item path.
///
/// The root is `/`. A single trailing slash is accepted and dropped.
/// Segments are non-empty and limited to ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemPath(String);

impl ItemPath {
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    /// Parse and normalize a raw path.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::invalid_location(format!("Invalid path: {raw:?}"));

        let Some(rest) = raw.strip_prefix('/') else {
            return Err(invalid());
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if !rest.split('/').all(is_valid_segment) {
            return Err(invalid());
        }
        Ok(Self(format!("/{rest}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The last segment (the item id); empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[pos + 1..],
            None => "",
        }
    }

    pub fn parent(&self) -> Option<ItemPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(pos) => Some(Self(self.0[..pos].to_owned())),
            None => None,
        }
    }

    /// Append one segment.
    pub fn join(&self, segment: &str) -> Result<ItemPath, ModelError> {
        if !is_valid_segment(segment) {
            return Err(ModelError::invalid_location(format!(
                "Invalid path segment {segment:?} under {self}"
            )));
        }
        if self.is_root() {
            Ok(Self(format!("/{segment}")))
        } else {
            Ok(Self(format!("{}/{segment}", self.0)))
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// True if `self` equals `ancestor` or lies below it.
    pub fn is_within(&self, ancestor: &ItemPath) -> bool {
        if ancestor.is_root() || self == ancestor {
            return true;
        }
        self.0
            .strip_prefix(ancestor.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemPath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemPath {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ItemPath> for String {
    fn from(path: ItemPath) -> Self {
        path.0
    }
}

impl AsRef<str> for ItemPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn p(raw: &str) -> ItemPath {
        ItemPath::parse(raw).unwrap()
    }

    #[test]
    fn parses_root_and_trailing_slash() {
        assert!(p("/").is_root());
        assert_eq!(p("/deployments/").as_str(), "/deployments");
        assert_eq!(p("/software/items/finger").depth(), 3);
    }

    #[test]
    fn rejects_malformed_paths() {
        for raw in ["", "software", "/a//b", "/a/b c", "/a/$x", "//"] {
            let err = ItemPath::parse(raw).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidLocation, "{raw:?}");
        }
    }

    #[test]
    fn parent_and_name() {
        let path = p("/software/items/finger");
        assert_eq!(path.name(), "finger");
        assert_eq!(path.parent(), Some(p("/software/items")));
        assert_eq!(p("/software").parent(), Some(ItemPath::root()));
        assert_eq!(ItemPath::root().parent(), None);
        assert_eq!(ItemPath::root().name(), "");
    }

    #[test]
    fn join_validates_segment() {
        assert_eq!(ItemPath::root().join("ms").unwrap(), p("/ms"));
        assert_eq!(p("/ms").join("items").unwrap(), p("/ms/items"));
        assert!(p("/ms").join("a/b").is_err());
    }

    #[test]
    fn is_within_respects_segment_boundaries() {
        assert!(p("/a/b").is_within(&p("/a")));
        assert!(p("/a").is_within(&p("/a")));
        assert!(p("/a").is_within(&ItemPath::root()));
        assert!(!p("/ab").is_within(&p("/a")));
        assert!(!p("/a").is_within(&p("/a/b")));
    }

    #[test]
    fn serde_uses_plain_string() {
        let json = serde_json::to_string(&p("/ms/items")).unwrap();
        assert_eq!(json, "\"/ms/items\"");
        let back: ItemPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("/ms/items"));
        assert!(serde_json::from_str::<ItemPath>("\"no-slash\"").is_err());
    }
}
