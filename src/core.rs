#![forbid(unsafe_code)]

//! Core primitives shared by every layer: the 384-bit hash type, SHA-384
//! helpers, consensus timestamps and account identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

/// Size of every digest produced or checked by the mirror (SHA-384).
pub const HASH_LEN: usize = 48;

pub type Hash48 = [u8; HASH_LEN];

/// SHA-384 of a single buffer.
pub fn sha384(data: &[u8]) -> Hash48 {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&Sha384::digest(data));
    out
}

/// SHA-384 over the concatenation of `parts`.
pub fn sha384_concat(parts: &[&[u8]]) -> Hash48 {
    let mut h = Sha384::new();
    for p in parts {
        h.update(p);
    }
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&h.finalize());
    out
}

/// Hash of the zero-length input. Used as the padding leaf of every tree and
/// as the stand-in for hashes that are legitimately empty (genesis).
pub fn empty_hash() -> &'static Hash48 {
    static EMPTY: OnceLock<Hash48> = OnceLock::new();
    EMPTY.get_or_init(|| sha384(&[]))
}

/// Copies a byte slice into a [`Hash48`] if it has the right length.
pub fn to_hash48(bytes: &[u8]) -> Option<Hash48> {
    <Hash48>::try_from(bytes).ok()
}

/* ===== Timestamps ===== */

/// Consensus timestamp with nanosecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub const fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            seconds: nanos.div_euclid(1_000_000_000),
            nanos: nanos.rem_euclid(1_000_000_000) as i32,
        }
    }

    /// Nanoseconds since the epoch, saturating on overflow.
    pub fn to_nanos(&self) -> i64 {
        self.seconds
            .saturating_mul(1_000_000_000)
            .saturating_add(i64::from(self.nanos))
    }

    /// Canonical byte form used when a timestamp is hashed: seconds (i64 BE)
    /// followed by nanos (i32 BE).
    pub fn to_hash_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..8].copy_from_slice(&self.seconds.to_be_bytes());
        out[8..].copy_from_slice(&self.nanos.to_be_bytes());
        out
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/* ===== Account ids ===== */

/// `shard.realm.num` entity identifier, e.g. `0.0.3` for a node account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

impl AccountId {
    pub const fn new(shard: u64, realm: u64, num: u64) -> Self {
        Self { shard, realm, num }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for AccountId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("invalid account id '{s}': expected shard.realm.num"));
        }
        let parse = |p: &str| {
            p.parse::<u64>()
                .map_err(|e| format!("invalid account id '{s}': {e}"))
        };
        Ok(Self {
            shard: parse(parts[0])?,
            realm: parse(parts[1])?,
            num: parse(parts[2])?,
        })
    }
}
