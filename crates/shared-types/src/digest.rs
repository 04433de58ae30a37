//! # Digests and Merkle Roots
//!
//! Every consensus-relevant structure is hashed field by field into a
//! SHA-256 state. Encoding never fails, so ids can be computed anywhere
//! without threading a `Result`.

use crate::entities::Hash;
use sha2::{Digest as _, Sha256};

/// Feeds a value into a running SHA-256 state.
pub trait DigestEncode {
    /// Append the canonical encoding of `self`.
    fn feed(&self, hasher: &mut Sha256);

    /// SHA-256 over the canonical encoding.
    fn digest(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        hasher.finalize().into()
    }
}

/// SHA-256 of raw bytes.
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// SHA-256 of two concatenated hashes.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn make_canonical_left(value: &Hash) -> Hash {
    let mut out = *value;
    out[0] &= 0x7f;
    out
}

fn make_canonical_right(value: &Hash) -> Hash {
    let mut out = *value;
    out[0] |= 0x80;
    out
}

/// Canonical merkle root over a list of digests.
///
/// Left nodes have the top bit cleared, right nodes have it set, and an
/// odd trailing node is paired with itself. An empty list yields the zero
/// hash.
pub fn merkle(mut ids: Vec<Hash>) -> Hash {
    if ids.is_empty() {
        return [0u8; 32];
    }

    while ids.len() > 1 {
        if ids.len() % 2 == 1 {
            if let Some(last) = ids.last().copied() {
                ids.push(last);
            }
        }

        ids = ids
            .chunks_exact(2)
            .map(|pair| {
                hash_pair(
                    &make_canonical_left(&pair[0]),
                    &make_canonical_right(&pair[1]),
                )
            })
            .collect();
    }

    ids[0]
}

impl DigestEncode for u8 {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update([*self]);
    }
}

impl DigestEncode for u16 {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.to_le_bytes());
    }
}

impl DigestEncode for u32 {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.to_le_bytes());
    }
}

impl DigestEncode for u64 {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self.to_le_bytes());
    }
}

impl DigestEncode for Hash {
    fn feed(&self, hasher: &mut Sha256) {
        hasher.update(self);
    }
}

impl DigestEncode for String {
    fn feed(&self, hasher: &mut Sha256) {
        (self.len() as u32).feed(hasher);
        hasher.update(self.as_bytes());
    }
}

impl<T: DigestEncode> DigestEncode for [T] {
    fn feed(&self, hasher: &mut Sha256) {
        (self.len() as u32).feed(hasher);
        for item in self {
            item.feed(hasher);
        }
    }
}

impl<T: DigestEncode> DigestEncode for Vec<T> {
    fn feed(&self, hasher: &mut Sha256) {
        self.as_slice().feed(hasher);
    }
}

impl<T: DigestEncode> DigestEncode for Option<T> {
    fn feed(&self, hasher: &mut Sha256) {
        match self {
            Some(value) => {
                1u8.feed(hasher);
                value.feed(hasher);
            }
            None => 0u8.feed(hasher),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_merkle_empty_is_zero() {
        assert_eq!(merkle(Vec::new()), [0u8; 32]);
    }

    #[test]
    fn test_merkle_single_is_identity() {
        let leaf = sha256(b"leaf");
        assert_eq!(merkle(vec![leaf]), leaf);
    }

    #[test]
    fn test_merkle_pairs_canonically() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let expected = hash_pair(&make_canonical_left(&a), &make_canonical_right(&b));
        assert_eq!(merkle(vec![a, b]), expected);
    }

    #[test]
    fn test_merkle_odd_count_duplicates_last() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let c = sha256(b"c");
        assert_eq!(merkle(vec![a, b, c]), merkle(vec![a, b, c, c]));
    }

    proptest! {
        #[test]
        fn test_merkle_order_sensitive(seeds in proptest::collection::vec(any::<u8>(), 2..16)) {
            let leaves: Vec<Hash> = seeds.iter().enumerate().map(|(i, s)| sha256(&[i as u8, *s])).collect();
            let mut reversed = leaves.clone();
            reversed.reverse();
            prop_assert_eq!(merkle(leaves.clone()), merkle(leaves.clone()));
            prop_assert_ne!(merkle(leaves), merkle(reversed));
        }
    }
}
