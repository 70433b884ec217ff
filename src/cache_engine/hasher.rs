//! Key hashing and fixed-width digest arithmetic
//!
//! Cache keys are hashed with SHA-256. The same 256-bit big-endian value type
//! names both data files (digests) and tree directories (boundaries), so
//! comparing two names as strings and comparing them as numbers agree.

use sha2::{Digest, Sha256};
use std::fmt;

use super::types::{CacheError, Result};

/// Width of a digest in bytes.
pub const DIGEST_BYTES: usize = 32;

/// Width of a digest or boundary name in hex characters.
pub const DIGEST_HEX_LEN: usize = DIGEST_BYTES * 2;

/// A 256-bit value naming either a cache entry or a tree boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyHash([u8; DIGEST_BYTES]);

impl KeyHash {
    pub const MIN: KeyHash = KeyHash([0x00; DIGEST_BYTES]);
    pub const MAX: KeyHash = KeyHash([0xff; DIGEST_BYTES]);

    /// Hash a cache key over its UTF-8 bytes.
    pub fn from_key(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; DIGEST_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a lowercase hex name of exactly [`DIGEST_HEX_LEN`] characters.
    pub fn parse_hex(name: &str) -> Result<Self> {
        if name.len() != DIGEST_HEX_LEN
            || !name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(CacheError::InvalidDigest(name.to_string()));
        }
        let mut bytes = [0u8; DIGEST_BYTES];
        hex::decode_to_slice(name, &mut bytes)
            .map_err(|_| CacheError::InvalidDigest(name.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `self + 1`, or `None` on overflow past [`KeyHash::MAX`].
    pub fn successor(&self) -> Option<Self> {
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;
            if !overflow {
                return Some(Self(out));
            }
        }
        None
    }

    /// `start + (end - start) / 2`, rounding down. Requires `start <= end`.
    pub fn midpoint(start: &Self, end: &Self) -> Self {
        debug_assert!(start <= end);

        let mut diff = [0u8; DIGEST_BYTES];
        let mut borrow = 0u16;
        for i in (0..DIGEST_BYTES).rev() {
            let lhs = u16::from(end.0[i]);
            let rhs = u16::from(start.0[i]) + borrow;
            if lhs >= rhs {
                diff[i] = (lhs - rhs) as u8;
                borrow = 0;
            } else {
                diff[i] = (lhs + 0x100 - rhs) as u8;
                borrow = 1;
            }
        }

        let mut carry_bit = 0u8;
        for byte in diff.iter_mut() {
            let next_carry = *byte & 1;
            *byte = (*byte >> 1) | (carry_bit << 7);
            carry_bit = next_carry;
        }

        let mut out = [0u8; DIGEST_BYTES];
        let mut carry = 0u16;
        for i in (0..DIGEST_BYTES).rev() {
            let sum = u16::from(start.0[i]) + u16::from(diff[i]) + carry;
            out[i] = (sum & 0xff) as u8;
            carry = sum >> 8;
        }
        Self(out)
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", self.to_hex())
    }
}

/// Hex digest of a cache key.
pub fn digest_key(key: &str) -> String {
    KeyHash::from_key(key).to_hex()
}
