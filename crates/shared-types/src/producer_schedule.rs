//! # Producer Authority Schedules

use crate::digest::DigestEncode;
use crate::entities::{BlockTimestamp, Name, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Number of consecutive blocks each producer signs in a round.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// A weighted signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWeight {
    /// Public key bytes.
    pub key: PublicKey,
    /// Weight toward the threshold.
    pub weight: u16,
}

/// Threshold authority that may sign a producer's blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockSigningAuthority {
    /// Sum of weights required.
    pub threshold: u32,
    /// Keys and weights.
    pub keys: Vec<KeyWeight>,
}

impl BlockSigningAuthority {
    /// Single-key authority with threshold one.
    pub fn single(key: PublicKey) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight { key, weight: 1 }],
        }
    }

    /// A threshold of zero or above the total weight can never be met.
    pub fn is_valid(&self) -> bool {
        let total: u32 = self.keys.iter().map(|k| u32::from(k.weight)).sum();
        self.threshold > 0 && self.threshold <= total
    }

    /// Whether the given keys reach the threshold.
    pub fn satisfied_by(&self, signing_keys: &[PublicKey]) -> bool {
        let weight: u32 = self
            .keys
            .iter()
            .filter(|k| signing_keys.contains(&k.key))
            .map(|k| u32::from(k.weight))
            .sum();
        weight >= self.threshold
    }
}

/// A producer and its signing authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerAuthority {
    /// Producer account.
    pub producer_name: Name,
    /// Signing authority.
    pub authority: BlockSigningAuthority,
}

/// Versioned ordered list of producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProducerAuthoritySchedule {
    /// Monotonic version.
    pub version: u32,
    /// Producers in round order.
    pub producers: Vec<ProducerAuthority>,
}

impl ProducerAuthoritySchedule {
    /// Producer responsible for the slot of `timestamp`.
    pub fn scheduled_producer(&self, timestamp: BlockTimestamp) -> Option<&ProducerAuthority> {
        if self.producers.is_empty() {
            return None;
        }
        let index = (timestamp.slot / PRODUCER_REPETITIONS) as usize % self.producers.len();
        self.producers.get(index)
    }

    /// Position of a producer in the schedule.
    pub fn index_of(&self, producer: &Name) -> Option<usize> {
        self.producers
            .iter()
            .position(|p| &p.producer_name == producer)
    }

    /// Same producers and authorities, ignoring the version.
    pub fn same_producers(&self, other: &Self) -> bool {
        self.producers == other.producers
    }
}

impl DigestEncode for ProducerAuthoritySchedule {
    fn feed(&self, hasher: &mut Sha256) {
        self.version.feed(hasher);
        (self.producers.len() as u32).feed(hasher);
        for producer in &self.producers {
            producer.producer_name.feed(hasher);
            producer.authority.threshold.feed(hasher);
            (producer.authority.keys.len() as u32).feed(hasher);
            for key in &producer.authority.keys {
                key.key.feed(hasher);
                key.weight.feed(hasher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(names: &[&str]) -> ProducerAuthoritySchedule {
        ProducerAuthoritySchedule {
            version: 1,
            producers: names
                .iter()
                .map(|n| ProducerAuthority {
                    producer_name: (*n).into(),
                    authority: BlockSigningAuthority::single(n.as_bytes().to_vec()),
                })
                .collect(),
        }
    }

    #[test]
    fn test_scheduled_producer_rotates_every_twelve_slots() {
        let s = schedule(&["a", "b", "c"]);
        let at = |slot| s.scheduled_producer(BlockTimestamp::from_slot(slot)).map(|p| p.producer_name.to_string());
        assert_eq!(at(0).as_deref(), Some("a"));
        assert_eq!(at(11).as_deref(), Some("a"));
        assert_eq!(at(12).as_deref(), Some("b"));
        assert_eq!(at(36).as_deref(), Some("a"));
    }

    #[test]
    fn test_authority_threshold() {
        let auth = BlockSigningAuthority::single(vec![1]);
        assert!(auth.is_valid());
        assert!(auth.satisfied_by(&[vec![1]]));
        assert!(!auth.satisfied_by(&[vec![2]]));
        assert!(!BlockSigningAuthority::default().is_valid());
    }
}
