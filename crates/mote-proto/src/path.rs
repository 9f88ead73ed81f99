//! LwM2M resource paths: `/object/instance/resource/resource-instance`.

use std::fmt;

use crate::errors::{ProtocolError, Result};

/// Deepest path LwM2M defines (object, instance, resource, resource instance).
pub const MAX_DEPTH: usize = 4;

/// Path into the object tree. An empty path is the root `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourcePath(Vec<u16>);

impl ResourcePath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build from numeric segments.
    pub fn new(segments: &[u16]) -> Result<Self> {
        if segments.len() > MAX_DEPTH {
            return Err(ProtocolError::InvalidPath(format!("{} segments", segments.len())));
        }
        Ok(Self(segments.to_vec()))
    }

    /// Parse a textual path such as `/3/0/1`.
    ///
    /// A trailing slash is tolerated; empty interior segments are not.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.strip_prefix('/').unwrap_or(text);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let segments = trimmed
            .split('/')
            .map(|s| s.parse::<u16>().map_err(|_| ProtocolError::InvalidPath(text.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Self::new(&segments)
    }

    /// Build from Uri-Path option values.
    pub fn from_uri_segments<'a>(segments: impl IntoIterator<Item = &'a [u8]>) -> Result<Self> {
        let mut out = Vec::new();
        for raw in segments {
            if raw.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::InvalidPath("non-UTF-8 segment".to_string()))?;
            let id = text.parse::<u16>().map_err(|_| ProtocolError::InvalidPath(text.to_string()))?;
            out.push(id);
        }
        Self::new(&out)
    }

    /// Numeric segments.
    pub fn segments(&self) -> &[u16] {
        &self.0
    }

    /// Number of segments (0 for root).
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// `/`
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Object ID.
    pub fn object(&self) -> Option<u16> {
        self.0.first().copied()
    }

    /// Object instance ID.
    pub fn instance(&self) -> Option<u16> {
        self.0.get(1).copied()
    }

    /// Resource ID.
    pub fn resource(&self) -> Option<u16> {
        self.0.get(2).copied()
    }

    /// Extend with one more segment.
    pub fn child(&self, id: u16) -> Result<Self> {
        let mut segments = self.0.clone();
        segments.push(id);
        Self::new(&segments)
    }

    /// `self` is a prefix of (or equal to) `other`.
    pub fn contains(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Segments rendered as Uri-Path option values.
    pub fn uri_segments(&self) -> Vec<Vec<u8>> {
        self.0.iter().map(|s| s.to_string().into_bytes()).collect()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path = ResourcePath::parse("/3/0/1").unwrap();
        assert_eq!(path.segments(), &[3, 0, 1]);
        assert_eq!(path.object(), Some(3));
        assert_eq!(path.instance(), Some(0));
        assert_eq!(path.resource(), Some(1));
        assert_eq!(path.to_string(), "/3/0/1");

        assert!(ResourcePath::parse("/").unwrap().is_root());
        assert_eq!(ResourcePath::root().to_string(), "/");
        assert_eq!(ResourcePath::parse("1/0/").unwrap().segments(), &[1, 0]);
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(ResourcePath::parse("/3/x").is_err());
        assert!(ResourcePath::parse("/1/2/3/4/5").is_err());
        assert!(ResourcePath::parse("/3//1").is_err());
        assert!(ResourcePath::parse("/70000").is_err());
    }

    #[test]
    fn prefix_containment() {
        let object = ResourcePath::parse("/3").unwrap();
        let resource = ResourcePath::parse("/3/0/1").unwrap();
        assert!(object.contains(&resource));
        assert!(!resource.contains(&object));
        assert!(ResourcePath::root().contains(&object));
    }

    #[test]
    fn uri_segments_roundtrip() {
        let path = ResourcePath::parse("/1/0/1").unwrap();
        let segments = path.uri_segments();
        let parsed = ResourcePath::from_uri_segments(segments.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(parsed, path);
    }
}
