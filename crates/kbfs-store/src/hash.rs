//! Content hashing for dedup keys.

use crate::{Key, KEY_LEN};

/// Compute the 160-bit content key of the given bytes.
///
/// This is the first 160 bits of the BLAKE3 digest over exactly `data`, so a
/// partial buffer and the same buffer zero-padded to a full block hash
/// differently.
#[inline]
pub fn content_hash(data: &[u8]) -> Key {
    let digest = blake3::hash(data);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
    Key::from_bytes(out)
}
