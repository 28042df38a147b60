// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use xxhash_rust::xxh3::xxh3_128;

/// Standard bloom filter over the keys of a run
///
/// Point lookups with an equality scan consult the filter before touching
/// pages, short-circuiting misses.
#[derive(Clone)]
pub struct BloomFilter {
    /// Raw bits
    bits: Box<[u8]>,

    /// Bit count
    m: u64,

    /// Number of hash functions
    k: u32,
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BloomFilter(m={}, k={})", self.m, self.k)
    }
}

impl BloomFilter {
    /// Sizes a filter for `n` keys at the given false-positive rate.
    #[must_use]
    pub fn with_fpr(n: usize, fpr: f32) -> Self {
        let n = n.max(1) as f64;
        let fpr = f64::from(fpr.clamp(0.000_1, 0.5));

        let ln2 = std::f64::consts::LN_2;
        let m = ((-(n * fpr.ln()) / (ln2 * ln2)).ceil()).max(8.0);
        let k = ((m / n * ln2).round()).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let m = m as u64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let k = k as u32;

        Self {
            bits: vec![0u8; (m as usize).div_ceil(8)].into_boxed_slice(),
            m,
            k,
        }
    }

    /// Hash pair of a key; the writer collects these while streaming rows
    /// and sizes the filter afterwards.
    #[must_use]
    pub fn hash_key(key: &[u8]) -> (u64, u64) {
        let h = xxh3_128(key);

        #[allow(clippy::cast_possible_truncation)]
        let h1 = h as u64;
        let h2 = (h >> 64) as u64;
        (h1, h2)
    }

    /// Adds a pre-hashed key.
    pub fn insert_hash(&mut self, (mut h1, h2): (u64, u64)) {
        for _ in 0..self.k {
            let idx = (h1 % self.m) as usize;
            if let Some(byte) = self.bits.get_mut(idx / 8) {
                *byte |= 1 << (idx % 8);
            }
            h1 = h1.wrapping_add(h2);
        }
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let (mut h1, h2) = Self::hash_key(key);
        for _ in 0..self.k {
            let idx = (h1 % self.m) as usize;
            if let Some(byte) = self.bits.get_mut(idx / 8) {
                *byte |= 1 << (idx % 8);
            }
            h1 = h1.wrapping_add(h2);
        }
    }

    /// Returns `false` if the key is definitely absent.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let (mut h1, h2) = Self::hash_key(key);
        for _ in 0..self.k {
            let idx = (h1 % self.m) as usize;
            let Some(byte) = self.bits.get(idx / 8) else {
                return true;
            };
            if byte & (1 << (idx % 8)) == 0 {
                return false;
            }
            h1 = h1.wrapping_add(h2);
        }
        true
    }
}

impl Encode for BloomFilter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.m)?;
        writer.write_u32::<BigEndian>(self.k)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.bits.len() as u32)?;
        writer.write_all(&self.bits)?;
        Ok(())
    }
}

impl Decode for BloomFilter {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let m = reader.read_u64::<BigEndian>()?;
        let k = reader.read_u32::<BigEndian>()?;
        let len = reader.read_u32::<BigEndian>()?;

        if m == 0 || k == 0 {
            return Err(DecodeError::InvalidHeader("bloom filter"));
        }

        let mut bits = vec![0u8; len as usize];
        reader.read_exact(&mut bits)?;

        Ok(Self {
            bits: bits.into_boxed_slice(),
            m,
            k,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bloom_no_false_negatives() {
        let mut filter = BloomFilter::with_fpr(1_000, 0.01);
        for i in 0u32..1_000 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0u32..1_000 {
            assert!(filter.contains(&i.to_be_bytes()));
        }
    }

    #[test]
    fn bloom_fpr_is_sane() {
        let mut filter = BloomFilter::with_fpr(1_000, 0.01);
        for i in 0u32..1_000 {
            filter.insert(&i.to_be_bytes());
        }

        let false_positives = (1_000u32..11_000)
            .filter(|i| filter.contains(&i.to_be_bytes()))
            .count();

        // 1% configured; accept up to 3% to keep the test stable.
        assert!(false_positives < 300, "fpr too high: {false_positives}");
    }

    #[test]
    fn bloom_roundtrip() {
        let mut filter = BloomFilter::with_fpr(100, 0.05);
        filter.insert(b"hello");
        filter.insert(b"world");

        let bytes = filter.encode_into_vec();
        let decoded = BloomFilter::decode_from(&mut &bytes[..]).unwrap();

        assert!(decoded.contains(b"hello"));
        assert!(decoded.contains(b"world"));
    }
}
