use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::SHA1_LEN;

/// A 20-byte identifier. Used both for torrent info hashes and for peer ids,
/// compared by byte value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id20(pub [u8; SHA1_LEN]);

pub type InfoHash = Id20;
pub type PeerId = Id20;

impl Id20 {
    pub const fn new(from: [u8; SHA1_LEN]) -> Id20 {
        Id20(from)
    }

    /// Copies the id out of a slice. Returns `None` unless the slice is exactly 20 bytes.
    pub fn from_slice(b: &[u8]) -> Option<Id20> {
        let arr: [u8; SHA1_LEN] = b.try_into().ok()?;
        Some(Id20(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SHA1_LEN] {
        &self.0
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; SHA1_LEN]> for Id20 {
    fn from(value: [u8; SHA1_LEN]) -> Self {
        Id20(value)
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; SHA1_LEN];
        if s.len() != SHA1_LEN * 2 {
            anyhow::bail!("expected a hex string of length {}", SHA1_LEN * 2)
        };
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}

impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            return serializer.serialize_str(&self.as_string());
        }
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = Id20;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(formatter, "a 20 byte slice or a 40 character hex string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != SHA1_LEN * 2 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; SHA1_LEN];
                match hex::decode_to_slice(v, &mut out) {
                    Ok(_) => Ok(Id20(out)),
                    Err(e) => Err(E::custom(e)),
                }
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Id20::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_from_str_and_back() {
        let s = "cab507494d02ebb1178b38f2e9d7be299c86b862";
        let id = Id20::from_str(s).unwrap();
        assert_eq!(id.as_string(), s);
        assert_eq!(format!("{id:?}"), s);
    }

    #[test]
    fn test_from_str_wrong_len() {
        assert!(Id20::from_str("cab5").is_err());
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(Id20::from_slice(&[7u8; 20]), Some(Id20([7u8; 20])));
        assert_eq!(Id20::from_slice(&[7u8; 19]), None);
        assert_eq!(Id20::from_slice(&[7u8; 21]), None);
    }

    #[test]
    fn test_serde_json_is_hex() {
        let id = Id20([0xab; 20]);
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, format!("\"{}\"", "ab".repeat(20)));
        let back: Id20 = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }
}
