use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size in bytes of an [`ObjectId`] (a SHA-256 digest).
pub const OBJECT_ID_LEN: usize = 32;

#[derive(Error, Debug, PartialEq)]
pub enum ObjectIdError {
    #[error("Invalid object id '{0}': expected {expected} hex characters", expected = OBJECT_ID_LEN * 2)]
    InvalidLength(String),
    #[error("Invalid object id '{0}': {1}")]
    InvalidHex(String, hex::FromHexError),
}

/**
 * Content digest identifying a blob of bytes.
 *
 * Used both as the key of the object database and as the version of a
 * file or url at a point in time. Ordering is byte-wise so iteration over
 * ordered collections is deterministic.
 */
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// The all-zero id; stands for "no content" (missing input).
    pub const EMPTY: ObjectId = ObjectId([0; OBJECT_ID_LEN]);

    pub const fn from_bytes(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OBJECT_ID_LEN * 2 {
            return Err(ObjectIdError::InvalidLength(s.to_string()));
        }
        let mut bytes = [0u8; OBJECT_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ObjectIdError::InvalidHex(s.to_string(), e))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_and_display() {
        let mut bytes = [0u8; OBJECT_ID_LEN];
        bytes[0] = 0xab;
        bytes[31] = 0x01;
        let id = ObjectId::from_bytes(bytes);

        let text = id.to_string();
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("ab"));
        assert_eq!(text.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "abc".parse::<ObjectId>(),
            Err(ObjectIdError::InvalidLength(_))
        ));
        let not_hex = "zz".repeat(OBJECT_ID_LEN);
        assert!(matches!(
            not_hex.parse::<ObjectId>(),
            Err(ObjectIdError::InvalidHex(_, _))
        ));
    }

    #[test]
    fn test_parse_errors_compare_by_value() {
        assert_eq!(
            "abc".parse::<ObjectId>(),
            Err(ObjectIdError::InvalidLength("abc".to_string()))
        );
        let not_hex = "zz".repeat(OBJECT_ID_LEN);
        assert_eq!(
            not_hex.parse::<ObjectId>(),
            Err(ObjectIdError::InvalidHex(
                not_hex.clone(),
                hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 }
            ))
        );
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let low = ObjectId::from_bytes([1; OBJECT_ID_LEN]);
        let high = ObjectId::from_bytes([2; OBJECT_ID_LEN]);
        assert!(ObjectId::EMPTY < low);
        assert!(low < high);
        assert!(ObjectId::EMPTY.is_empty());
    }
}
