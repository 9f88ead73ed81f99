//! CoRE link format (RFC 6690) as used in LwM2M register and discover
//! payloads: `</1/0>,</3/0>;ver=1.1,</5>`.

use std::fmt;

use crate::{
    errors::{ProtocolError, Result},
    path::ResourcePath,
};

/// A `key` or `key=value` attribute attached to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAttribute {
    /// Attribute name.
    pub key: String,
    /// Attribute value, if any. Quotes are stripped on parse.
    pub value: Option<String>,
}

impl LinkAttribute {
    /// `key=value` attribute.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: Some(value.into()) }
    }

    /// Valueless attribute.
    pub fn flag(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: None }
    }
}

/// A single link target plus attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Target path.
    pub path: ResourcePath,
    /// Attributes in document order.
    pub attributes: Vec<LinkAttribute>,
}

impl Link {
    /// Link without attributes.
    pub fn new(path: ResourcePath) -> Self {
        Self { path, attributes: Vec::new() }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with(mut self, attribute: LinkAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Value of the first attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|a| a.key == key).and_then(|a| a.value.as_deref())
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.path)?;
        for attribute in &self.attributes {
            match &attribute.value {
                Some(value) => write!(f, ";{}={}", attribute.key, value)?,
                None => write!(f, ";{}", attribute.key)?,
            }
        }
        Ok(())
    }
}

/// Serialize links as a comma-separated document.
pub fn encode_links(links: &[Link]) -> String {
    links.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// Parse a link-format document.
///
/// Commas inside quoted attribute values do not split links.
pub fn parse_links(text: &str) -> Result<Vec<Link>> {
    let mut links = Vec::new();
    for entry in split_unquoted(text, ',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        links.push(parse_link(entry)?);
    }
    Ok(links)
}

fn parse_link(entry: &str) -> Result<Link> {
    let rest = entry
        .strip_prefix('<')
        .ok_or_else(|| ProtocolError::InvalidLinkFormat(format!("missing '<' in {entry}")))?;
    let (target, params) = rest
        .split_once('>')
        .ok_or_else(|| ProtocolError::InvalidLinkFormat(format!("missing '>' in {entry}")))?;

    let path = ResourcePath::parse(target)?;
    let mut attributes = Vec::new();
    for param in split_unquoted(params, ';') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        attributes.push(match param.split_once('=') {
            Some((key, value)) => {
                LinkAttribute::new(key.trim(), value.trim().trim_matches('"'))
            },
            None => LinkAttribute::flag(param),
        });
    }

    Ok(Link { path, attributes })
}

fn split_unquoted(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            },
            _ => {},
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_registration_payload() {
        let links = vec![
            Link::new(ResourcePath::parse("/1/0").unwrap()),
            Link::new(ResourcePath::parse("/3/0").unwrap()).with(LinkAttribute::new("ver", "1.1")),
            Link::new(ResourcePath::parse("/5").unwrap()),
        ];
        assert_eq!(encode_links(&links), "</1/0>,</3/0>;ver=1.1,</5>");
    }

    #[test]
    fn parse_with_quoted_values() {
        let links = parse_links(r#"</>;rt="oma.lwm2m";ct=11543,</3/0>;pmin=10,</3/0/1>;dim"#).unwrap();
        assert_eq!(links.len(), 3);
        assert!(links[0].path.is_root());
        assert_eq!(links[0].attribute("rt"), Some("oma.lwm2m"));
        assert_eq!(links[1].attribute("pmin"), Some("10"));
        assert_eq!(links[2].attributes, vec![LinkAttribute::flag("dim")]);
    }

    #[test]
    fn rejects_missing_brackets() {
        assert!(parse_links("/3/0").is_err());
        assert!(parse_links("</3/0").is_err());
    }
}
