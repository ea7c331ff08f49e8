//! Bloom filters over u128 identities.
//!
//! Keys are already uniformly distributed (BLAKE3 output), so no re-hashing
//! happens: the key is split into two 64-bit halves and probe positions
//! come from enhanced double hashing.
//!
//! Two halves live here. [`BloomFilter`] is the owned builder used by the
//! segment writer. [`BloomView`] is a borrowed, already-validated window
//! into a segment's bytes, used at read time without copying the bit array.
//!
//! Binary format:
//! ```text
//! [num_bits: u64 LE]           // 8 bytes
//! [num_hashes: u32 LE]         // 4 bytes
//! [reserved: u32 LE = 0]       // 4 bytes
//! [bits: u64 LE x word_count]  // word_count = num_bits / 64
//! ```

use std::io::Write;

use crate::error::{GraphError, Result};
use crate::storage::types::{le_u32, le_u64, BLOOM_BITS_PER_KEY, BLOOM_NUM_HASHES};

/// num_bits(8) + num_hashes(4) + reserved(4).
const BLOOM_HEADER_SIZE: usize = 16;

/// Upper bound on hash count accepted from disk.
const MAX_NUM_HASHES: usize = 32;

#[inline]
fn probe_positions(key: u128, num_hashes: usize, num_bits: usize) -> impl Iterator<Item = usize> {
    let h1 = key as u64;
    // odd stride is coprime with the power-of-two word layout
    let h2 = ((key >> 64) as u64) | 1;
    let m = num_bits as u64;
    (0..num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
}

// ── Builder ───────────────────────────────────────────────────────

/// Owned bloom filter, built once per segment.
#[derive(Debug)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Sized for `num_keys` insertions. At least one 64-bit word.
    pub fn with_capacity(num_keys: usize) -> Self {
        let num_bits = (num_keys.saturating_mul(BLOOM_BITS_PER_KEY).max(64) + 63) & !63;
        Self {
            words: vec![0u64; num_bits / 64],
            num_bits,
            num_hashes: BLOOM_NUM_HASHES,
        }
    }

    /// Build directly from an iterator of keys.
    pub fn from_keys<I: IntoIterator<Item = u128>>(num_keys: usize, keys: I) -> Self {
        let mut bloom = Self::with_capacity(num_keys);
        for key in keys {
            bloom.insert(key);
        }
        bloom
    }

    pub fn insert(&mut self, key: u128) {
        for pos in probe_positions(key, self.num_hashes, self.num_bits) {
            self.words[pos / 64] |= 1u64 << (pos % 64);
        }
    }

    pub fn maybe_contains(&self, key: u128) -> bool {
        probe_positions(key, self.num_hashes, self.num_bits)
            .all(|pos| self.words[pos / 64] & (1u64 << (pos % 64)) != 0)
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn serialized_size(&self) -> usize {
        BLOOM_HEADER_SIZE + self.words.len() * 8
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.num_bits as u64).to_le_bytes())?;
        writer.write_all(&(self.num_hashes as u32).to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        for word in &self.words {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }
}

// ── Read-side view ────────────────────────────────────────────────

/// Location of a validated bloom filter inside segment bytes.
///
/// Holds no reference to the bytes themselves so the owning segment can
/// keep the mapping and the view side by side.
#[derive(Debug, Clone, Copy)]
pub struct BloomView {
    bits_offset: usize,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomView {
    /// Validate the filter at `data[offset..end]`.
    pub fn parse(data: &[u8], offset: usize, end: usize) -> Result<Self> {
        if offset > end || end > data.len() || end - offset < BLOOM_HEADER_SIZE {
            return Err(GraphError::Integrity(format!(
                "Bloom filter at {} is truncated",
                offset
            )));
        }
        let num_bits = le_u64(&data[offset..offset + 8]) as usize;
        let num_hashes = le_u32(&data[offset + 8..offset + 12]) as usize;

        if num_bits == 0 || num_bits % 64 != 0 {
            return Err(GraphError::Integrity(format!(
                "Bloom filter has invalid bit count {}",
                num_bits
            )));
        }
        if num_hashes == 0 || num_hashes > MAX_NUM_HASHES {
            return Err(GraphError::Integrity(format!(
                "Bloom filter has invalid hash count {}",
                num_hashes
            )));
        }
        let bits_offset = offset + BLOOM_HEADER_SIZE;
        let needed = num_bits / 8;
        if end - bits_offset < needed {
            return Err(GraphError::Integrity(format!(
                "Bloom filter at {} is truncated",
                offset
            )));
        }
        Ok(Self {
            bits_offset,
            num_bits,
            num_hashes,
        })
    }

    /// `false` means definitely absent.
    ///
    /// `data` must be the same bytes the view was parsed from.
    #[inline]
    pub fn maybe_contains(&self, data: &[u8], key: u128) -> bool {
        probe_positions(key, self.num_hashes, self.num_bits).all(|pos| {
            let byte = data[self.bits_offset + (pos / 64) * 8 + (pos % 64) / 8];
            byte & (1u8 << (pos % 8)) != 0
        })
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(i: u128) -> u128 {
        i.wrapping_mul(0x9e3779b97f4a7c15_u128) ^ (i << 64)
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let bf = BloomFilter::with_capacity(0);
        assert_eq!(bf.num_bits(), 64);
        assert!((0u128..100).all(|i| !bf.maybe_contains(spread(i))));
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<u128> = (0..1000).map(spread).collect();
        let bf = BloomFilter::from_keys(keys.len(), keys.iter().copied());
        for &k in &keys {
            assert!(bf.maybe_contains(k), "false negative for key {}", k);
        }
    }

    #[test]
    fn test_view_agrees_with_builder() {
        let keys: Vec<u128> = (0..500).map(spread).collect();
        let bf = BloomFilter::from_keys(keys.len(), keys.iter().copied());

        // leading garbage checks that offsets are honoured
        let mut buf = vec![0xAAu8; 7];
        bf.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 7 + bf.serialized_size());

        let view = BloomView::parse(&buf, 7, buf.len()).unwrap();
        assert_eq!(view.num_bits(), bf.num_bits());
        for i in 0..5000u128 {
            let k = spread(i);
            assert_eq!(view.maybe_contains(&buf, k), bf.maybe_contains(k));
        }
    }

    #[test]
    fn test_view_rejects_truncation() {
        let bf = BloomFilter::with_capacity(100);
        let mut buf = Vec::new();
        bf.write_to(&mut buf).unwrap();

        let err = BloomView::parse(&buf, 0, buf.len() - 8).unwrap_err();
        assert!(err.to_string().contains("truncated"), "unexpected error: {}", err);

        let err = BloomView::parse(&buf, 0, 12).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_view_rejects_bad_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let err = BloomView::parse(&buf, 0, buf.len()).unwrap_err();
        assert!(err.to_string().contains("invalid bit count"));

        let mut buf = Vec::new();
        buf.extend_from_slice(&64u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        let err = BloomView::parse(&buf, 0, buf.len()).unwrap_err();
        assert!(err.to_string().contains("invalid hash count"));
    }

    #[test]
    fn test_fpr_under_2_percent() {
        let n = 10_000;
        let bf = BloomFilter::from_keys(n, (0..n as u128).map(spread));
        let probes = 100_000u128;
        let false_positives = (0..probes)
            .filter(|i| bf.maybe_contains(spread(i + 1_000_000)))
            .count();
        let fpr = false_positives as f64 / probes as f64;
        assert!(fpr < 0.02, "FPR too high: {:.4}%", fpr * 100.0);
    }
}
