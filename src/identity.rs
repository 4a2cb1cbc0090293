//! # Identity and XOR Distance
//!
//! Peers are named by a 32-byte [`PeerId`]. Routing never compares peer ids
//! directly: both peers and lookup keys are first hashed into a [`KadKey`]
//! with BLAKE3, and the routing table orders everything by the XOR
//! [`Distance`] between kad keys.
//!
//! ## Properties
//!
//! - `distance(a, a)` is zero and `distance(a, b) == distance(b, a)`
//! - [`Distance`] orders big-endian, so byte-wise comparison is numeric comparison
//! - A peer's kad key equals the kad key of its raw id bytes, so a
//!   `FIND_NODE` for a peer id and a lookup for that peer land on the same point

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Length in bytes of peer ids and kad keys.
pub const KEY_LEN: usize = 32;

/// Number of bits in a kad key, and therefore the deepest possible bucket.
pub const KEY_BITS: usize = KEY_LEN * 8;

/// 32-byte peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; KEY_LEN]);

impl PeerId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive a peer id from arbitrary seed material.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    /// Kad key used to place this peer in the routing table.
    #[inline]
    pub fn kad_key(&self) -> KadKey {
        KadKey::for_peer(self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("peer id is not valid hex")?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow!("peer id must be {KEY_LEN} bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Fixed-length hashed identifier that XOR distance is measured over.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KadKey([u8; KEY_LEN]);

impl KadKey {
    /// Use already-hashed bytes as a kad key.
    #[inline]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash an arbitrary lookup key (content id, record key, raw peer id).
    pub fn from_raw(key: &[u8]) -> Self {
        Self(*blake3::hash(key).as_bytes())
    }

    pub fn for_peer(peer: &PeerId) -> Self {
        Self::from_raw(peer.as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Bit `index` counted from the most significant bit of the first byte.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < KEY_BITS, "bit index out of range");
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn distance(&self, other: &KadKey) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Display for KadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for KadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KadKey({})", hex::encode(&self.0[..8]))
    }
}

/// XOR distance between two kad keys, ordered as a 256-bit big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0; KEY_LEN]);
    pub const MAX: Distance = Distance([0xff; KEY_LEN]);

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Number of leading zero bits, i.e. the length of the shared prefix.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        KEY_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}
