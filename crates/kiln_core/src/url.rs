use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UrlError {
    #[error("Invalid object url '{0}': expected 'file:<path>' or 'content:<path>'")]
    Malformed(String),
}

/** Where the path of an [`ObjectUrl`] lives */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UrlType {
    /// A path on the local filesystem
    File,
    /// A logical path inside the content database (resolved through the index map)
    Content,
}

impl UrlType {
    fn prefix(self) -> &'static str {
        match self {
            UrlType::File => "file",
            UrlType::Content => "content",
        }
    }
}

/**
 * Typed location of an input or output object.
 * Equality, hashing and ordering are by (type, path).
 */
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectUrl {
    pub url_type: UrlType,
    pub path: String,
}

impl ObjectUrl {
    pub fn new(url_type: UrlType, path: impl Into<String>) -> Self {
        Self {
            url_type,
            path: path.into(),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(UrlType::File, path)
    }

    pub fn content(path: impl Into<String>) -> Self {
        Self::new(UrlType::Content, path)
    }

    pub fn is_content(&self) -> bool {
        self.url_type == UrlType::Content
    }
}

impl fmt::Display for ObjectUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url_type.prefix(), self.path)
    }
}

impl FromStr for ObjectUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("file", path)) if !path.is_empty() => Ok(Self::file(path)),
            Some(("content", path)) if !path.is_empty() => Ok(Self::content(path)),
            _ => Err(UrlError::Malformed(s.to_string())),
        }
    }
}

// Serialized as a string so urls can key JSON maps
impl Serialize for ObjectUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let url: ObjectUrl = "content:textures/grass".parse().unwrap();
        assert_eq!(url, ObjectUrl::content("textures/grass"));
        assert_eq!(url.to_string(), "content:textures/grass");

        // Only the first colon separates the type
        let url: ObjectUrl = "file:C:/assets/grass.png".parse().unwrap();
        assert_eq!(url.path, "C:/assets/grass.png");
        assert_eq!(url.url_type, UrlType::File);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        assert!("http:foo".parse::<ObjectUrl>().is_err());
        assert!("content:".parse::<ObjectUrl>().is_err());
        assert!("no-colon".parse::<ObjectUrl>().is_err());
    }

    #[test]
    fn test_same_path_different_type_are_distinct() {
        assert_ne!(ObjectUrl::file("a"), ObjectUrl::content("a"));
    }
}
