//! Probabilistic set of revoked certificate fingerprints.
//!
//! The filter only ever grows. Its serialization is hashed into every relay
//! block, so the hash keys are fixed and the encoding is canonical:
//!
//! ```text
//! hash count (u32, big endian) || bit count (u64, big endian) || bitmap
//! ```
use crate::{
    constants::{BLOOM_EXPECTED_ITEMS, BLOOM_FALSE_POSITIVE_RATE},
    types::Fingerprint,
};
use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hash keys shared by every relay and light client.
const SIP_KEYS: [(u64, u64); 2] = [
    (0x6770_6368_6169_6e31, 0x7265_766f_6b65_6431),
    (0x626c_6f6f_6d5f_6b65, 0x7973_5f76_315f_3031),
];

const HEADER_LEN: usize = 4 + 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BloomError {
    #[error("Invalid filter parameters: {0}")]
    InvalidParameters(String),
    #[error("Malformed serialized filter: {0}")]
    Malformed(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Sizing of a new filter.
pub struct BloomParameters {
    pub expected_items:      usize,
    pub false_positive_rate: f64,
}

impl Default for BloomParameters {
    fn default() -> Self {
        Self {
            expected_items:      BLOOM_EXPECTED_ITEMS,
            false_positive_rate: BLOOM_FALSE_POSITIVE_RATE,
        }
    }
}

pub struct BloomFilterState {
    filter: Bloom<[u8]>,
}

impl BloomFilterState {
    /// An empty filter sized for `params`.
    pub fn new(params: &BloomParameters) -> Result<Self, BloomError> {
        if params.expected_items == 0 {
            return Err(BloomError::InvalidParameters(
                "expected item count must be positive".into(),
            ));
        }
        let rate = params.false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(BloomError::InvalidParameters(format!(
                "false positive rate {rate} is not in (0, 1)"
            )));
        }
        let bitmap_len = Bloom::<[u8]>::compute_bitmap_size(params.expected_items, rate);
        let bit_count = bitmap_len as u64 * 8;
        let ideal = bit_count as f64 / params.expected_items as f64 * std::f64::consts::LN_2;
        let hash_count = (ideal.ceil() as u32).max(1);
        Ok(Self {
            filter: Bloom::from_existing(&vec![0u8; bitmap_len], bit_count, hash_count, SIP_KEYS),
        })
    }

    pub fn insert(&mut self, fingerprint: &Fingerprint) { self.filter.set(fingerprint.as_ref()) }

    /// Whether the fingerprint may have been inserted. Never `false` for an
    /// inserted fingerprint.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool { self.filter.check(fingerprint.as_ref()) }

    pub fn bit_count(&self) -> u64 { self.filter.number_of_bits() }

    pub fn hash_count(&self) -> u32 { self.filter.number_of_hash_functions() }

    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.filter.bitmap();
        let mut out = Vec::with_capacity(HEADER_LEN + bitmap.len());
        out.extend_from_slice(&self.hash_count().to_be_bytes());
        out.extend_from_slice(&self.bit_count().to_be_bytes());
        out.extend_from_slice(&bitmap);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() < HEADER_LEN {
            return Err(BloomError::Malformed(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let (k, rest) = bytes.split_at(4);
        let (bits, bitmap) = rest.split_at(8);
        let mut k_buf = [0u8; 4];
        k_buf.copy_from_slice(k);
        let mut bits_buf = [0u8; 8];
        bits_buf.copy_from_slice(bits);
        let hash_count = u32::from_be_bytes(k_buf);
        let bit_count = u64::from_be_bytes(bits_buf);
        if hash_count == 0 || bit_count == 0 {
            return Err(BloomError::Malformed("empty filter geometry".into()));
        }
        if bit_count != bitmap.len() as u64 * 8 {
            return Err(BloomError::Malformed(format!(
                "{bit_count} bits announced, {} bytes of bitmap",
                bitmap.len()
            )));
        }
        Ok(Self {
            filter: Bloom::from_existing(bitmap, bit_count, hash_count, SIP_KEYS),
        })
    }

    /// Hash committed to by relay blocks.
    pub fn hash(&self) -> [u8; 32] { Sha256::digest(self.to_bytes()).into() }
}

impl Clone for BloomFilterState {
    fn clone(&self) -> Self {
        Self {
            filter: Bloom::from_existing(
                &self.filter.bitmap(),
                self.bit_count(),
                self.hash_count(),
                SIP_KEYS,
            ),
        }
    }
}

impl std::fmt::Debug for BloomFilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilterState")
            .field("bit_count", &self.bit_count())
            .field("hash_count", &self.hash_count())
            .finish()
    }
}
