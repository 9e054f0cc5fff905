//! 160-bit keys and their 40-digit hex form.
//!
//! Decoding is the only validation gate for names supplied from outside, so
//! every external key goes through [`Key::decode`] before any table is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{StoreError, KEY_LEN, KEY_STRLEN};

/// 160-bit key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// The all-zero key stored in FREE entries.
    pub const ZERO: Key = Key([0u8; KEY_LEN]);

    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse exactly 40 hex digits, high nibble first. Either case is accepted.
    pub fn decode(s: &str) -> crate::Result<Self> {
        if s.len() != KEY_STRLEN {
            return Err(StoreError::InvalidKeyFormat(s.to_string()));
        }
        let mut out = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut out)
            .map_err(|_| StoreError::InvalidKeyFormat(s.to_string()))?;
        Ok(Self(out))
    }

    /// Render as 40 lowercase hex digits.
    pub fn encode(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl FromStr for Key {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.encode())
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_packs_high_nibble_first() {
        let key = Key::decode("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(key.as_bytes()[0], 0x01);
        assert_eq!(key.as_bytes()[1], 0x23);
        assert_eq!(key.as_bytes()[19], 0x67);
    }

    #[test]
    fn test_encode_is_lowercase_canonical() {
        let upper = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";
        let key: Key = upper.parse().unwrap();
        assert_eq!(key.encode(), upper.to_lowercase());
        assert_eq!(key.to_string(), upper.to_lowercase());
    }

    #[test]
    fn test_roundtrip_bytes() {
        let mut bytes = [0u8; KEY_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(0xf0);
        }
        let key = Key::from_bytes(bytes);
        assert_eq!(Key::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(
            Key::decode("abcd"),
            Err(StoreError::InvalidKeyFormat(_))
        ));
        let long = "a".repeat(KEY_STRLEN + 2);
        assert!(matches!(
            Key::decode(&long),
            Err(StoreError::InvalidKeyFormat(_))
        ));
        assert!(Key::decode("").is_err());
    }

    #[test]
    fn test_rejects_non_hex() {
        let bad = "g".repeat(KEY_STRLEN);
        assert!(matches!(
            Key::decode(&bad),
            Err(StoreError::InvalidKeyFormat(_))
        ));
        let mut almost = "0".repeat(KEY_STRLEN - 1);
        almost.push('z');
        assert!(Key::decode(&almost).is_err());
    }

    #[test]
    fn test_rejects_multibyte_of_right_length() {
        // 40 bytes, but not 40 hex digits
        let s = format!("{}é", "0".repeat(KEY_STRLEN - 2));
        assert_eq!(s.len(), KEY_STRLEN);
        assert!(Key::decode(&s).is_err());
    }

    #[test]
    fn test_zero_key() {
        assert!(Key::ZERO.is_zero());
        assert_eq!(Key::ZERO.encode(), "0".repeat(KEY_STRLEN));
    }
}
