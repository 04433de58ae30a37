//! # Core Chain Entities
//!
//! Identifiers, account names and the three clocks the chain uses:
//!
//! - [`TimePoint`]: wall-clock microseconds since the Unix epoch
//! - [`TimePointSec`]: second precision, used for transaction expiration
//! - [`BlockTimestamp`]: half-second production slots since 2000-01-01

use crate::digest::DigestEncode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

/// A 32-byte SHA-256 hash.
pub type Hash = [u8; 32];

/// Generic content digest.
pub type Digest = Hash;

/// Block identifier. The first four bytes carry the block number.
pub type BlockId = Hash;

/// Transaction identifier.
pub type TransactionId = Hash;

/// Chain identifier, derived from the genesis state.
pub type ChainId = Hash;

/// Opaque public key bytes. Key formats are owned by the crypto layer.
pub type PublicKey = Vec<u8>;

/// Opaque signature bytes.
pub type Signature = Vec<u8>;

/// Extract the block number encoded in a block id.
pub fn block_num_from_id(id: &BlockId) -> u32 {
    u32::from_be_bytes([id[0], id[1], id[2], id[3]])
}

/// TaPoS prefix of a block id (bytes 8..12, little endian).
pub fn ref_block_prefix(id: &BlockId) -> u32 {
    u32::from_le_bytes([id[8], id[9], id[10], id[11]])
}

/// Short hex rendering for logs.
pub fn short_id(id: &Hash) -> String {
    hex::encode(&id[..8])
}

/// Account, permission and action name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Name(pub String);

impl Name {
    /// Create a name from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl DigestEncode for Name {
    fn feed(&self, hasher: &mut Sha256) {
        self.0.feed(hasher);
    }
}

/// Signed duration in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Microseconds(pub i64);

impl Microseconds {
    /// Largest representable duration.
    pub const MAX: Self = Self(i64::MAX);

    /// Duration from whole milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms.saturating_mul(1_000))
    }

    /// Duration from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// Raw microsecond count.
    pub const fn count(self) -> i64 {
        self.0
    }
}

/// Wall-clock instant in microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct TimePoint(pub i64);

impl TimePoint {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_micros())
    }

    /// The instant that never arrives.
    pub const fn maximum() -> Self {
        Self(i64::MAX)
    }

    /// Microseconds since the Unix epoch.
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Saturating addition of a duration.
    pub fn add(self, delta: Microseconds) -> Self {
        Self(self.0.saturating_add(delta.0))
    }

    /// Saturating subtraction of a duration.
    pub fn sub(self, delta: Microseconds) -> Self {
        Self(self.0.saturating_sub(delta.0))
    }

    /// Elapsed duration from `earlier` to `self`.
    pub fn since(self, earlier: TimePoint) -> Microseconds {
        Microseconds(self.0.saturating_sub(earlier.0))
    }
}

/// Second-precision instant, used by transaction expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct TimePointSec(pub u32);

impl TimePointSec {
    /// Seconds since the Unix epoch.
    pub const fn secs(self) -> u32 {
        self.0
    }

    /// Widen to a microsecond time point.
    pub fn to_time_point(self) -> TimePoint {
        TimePoint(i64::from(self.0) * 1_000_000)
    }

    /// Truncate a time point to whole seconds.
    pub fn from_time_point(tp: TimePoint) -> Self {
        Self((tp.0 / 1_000_000).clamp(0, i64::from(u32::MAX)) as u32)
    }
}

impl DigestEncode for TimePointSec {
    fn feed(&self, hasher: &mut Sha256) {
        self.0.feed(hasher);
    }
}

/// Half-second production slot counted from 2000-01-01T00:00:00Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct BlockTimestamp {
    /// Slot index.
    pub slot: u32,
}

impl BlockTimestamp {
    /// Slot length in milliseconds.
    pub const INTERVAL_MS: i64 = 500;
    /// Slot zero in milliseconds since the Unix epoch.
    pub const EPOCH_MS: i64 = 946_684_800_000;

    /// Timestamp at a given slot.
    pub const fn from_slot(slot: u32) -> Self {
        Self { slot }
    }

    /// The latest representable slot.
    pub const fn maximum() -> Self {
        Self { slot: u32::MAX }
    }

    /// The slot following this one.
    pub fn next(self) -> Self {
        Self {
            slot: self.slot.saturating_add(1),
        }
    }

    /// Start of this slot as a wall-clock instant.
    pub fn to_time_point(self) -> TimePoint {
        let ms = i64::from(self.slot) * Self::INTERVAL_MS + Self::EPOCH_MS;
        TimePoint(ms * 1_000)
    }

    /// Slot containing the given instant, rounded down.
    pub fn from_time_point(tp: TimePoint) -> Self {
        let ms = tp.0 / 1_000 - Self::EPOCH_MS;
        let slot = (ms / Self::INTERVAL_MS).clamp(0, i64::from(u32::MAX));
        Self { slot: slot as u32 }
    }
}

impl DigestEncode for BlockTimestamp {
    fn feed(&self, hasher: &mut Sha256) {
        self.slot.feed(hasher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_num_from_id_reads_big_endian_prefix() {
        let mut id = [0xffu8; 32];
        id[..4].copy_from_slice(&42u32.to_be_bytes());
        assert_eq!(block_num_from_id(&id), 42);
    }

    #[test]
    fn test_block_timestamp_round_trips_through_time_point() {
        let ts = BlockTimestamp::from_slot(1_000);
        assert_eq!(BlockTimestamp::from_time_point(ts.to_time_point()), ts);
        assert_eq!(
            ts.next().to_time_point().since(ts.to_time_point()),
            Microseconds::from_millis(500)
        );
    }

    #[test]
    fn test_time_point_sec_truncates() {
        let tp = TimePoint(5_999_999);
        assert_eq!(TimePointSec::from_time_point(tp), TimePointSec(5));
    }

    #[test]
    fn test_time_point_saturates() {
        assert_eq!(TimePoint::maximum().add(Microseconds(10)), TimePoint::maximum());
    }
}
