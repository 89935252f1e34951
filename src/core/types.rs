use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

use crate::core::error::VerificationError;
use crate::core::params::NetworkParameters;
use crate::pow;

/// A 32-byte hash used throughout the system.
///
/// Bytes are kept in display order (the double-SHA256 digest reversed), so the
/// numeric value used for proof-of-work is the big-endian reading of `0`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

/// Null hash (all zeros): "no parent" for genesis, "no successor" for a branch head
pub const NULL_HASH: Hash256 = Hash256([0u8; 32]);

impl Hash256 {
    pub const SIZE: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_HASH
    }

    /// The hash read as an unsigned big-endian integer.
    pub fn as_uint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash256(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash256(bytes)
    }
}

/// sha256(sha256(data))
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated input: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header
///
/// Wire layout (44 bytes): prev_hash(32) | time(4) | bits(4) | nonce(4),
/// integers little-endian. `bits == 0` marks an unset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_hash: Hash256,
    pub time: u32,
    /// Compact-encoded difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 44;

    pub fn new(prev_hash: Hash256, time: u32, bits: u32, nonce: u32) -> Self {
        Self { prev_hash, time, bits, nonce }
    }

    pub fn is_null(&self) -> bool {
        self.bits == 0
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..32].copy_from_slice(self.prev_hash.as_bytes());
        buf[32..36].copy_from_slice(&self.time.to_le_bytes());
        buf[36..40].copy_from_slice(&self.bits.to_le_bytes());
        buf[40..44].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Decode the first 44 bytes of `data`.
    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::SIZE {
            return Err(DecodeError::Truncated { expected: Self::SIZE, got: data.len() });
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&data[0..32]);
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        Ok(Self {
            prev_hash: Hash256(prev),
            time: word(32),
            bits: word(36),
            nonce: word(40),
        })
    }

    /// Canonical identity: reverse(sha256(sha256(serialize(header))))
    pub fn hash(&self) -> Hash256 {
        let mut digest = double_sha256(&self.serialize());
        digest.reverse();
        Hash256(digest)
    }

    /// Decoded target, validated against `0 < target <= proof_of_work_limit`.
    pub fn target(&self, params: &NetworkParameters) -> Result<BigUint, VerificationError> {
        match pow::decode_compact(self.bits) {
            Some(target) if target > BigUint::default() && target <= params.proof_of_work_limit => Ok(target),
            _ => Err(VerificationError::InvalidDifficultyTarget { bits: self.bits }),
        }
    }
}

/// A complete block. Only the header is carried for now; the hash is computed
/// once and cached since the header never changes after construction.
#[derive(Clone, Default)]
pub struct Block {
    header: BlockHeader,
    hash: OnceLock<Hash256>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Self { header, hash: OnceLock::new() }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.header.prev_hash
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }

    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    pub fn nonce(&self) -> u32 {
        self.header.nonce
    }

    pub fn hash(&self) -> Hash256 {
        *self.hash.get_or_init(|| self.header.hash())
    }

    pub fn serialize(&self) -> [u8; BlockHeader::SIZE] {
        self.header.serialize()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        BlockHeader::deserialize(data).map(Block::new)
    }

    /// Expected hashing effort: 2^256 / (target + 1)
    pub fn work(&self, params: &NetworkParameters) -> Result<BigUint, VerificationError> {
        Ok(pow::work(&self.header.target(params)?))
    }

    /// True iff the block hash, read as an integer, does not exceed the target.
    pub fn verify_proof_of_work(&self, params: &NetworkParameters) -> Result<bool, VerificationError> {
        let target = self.header.target(params)?;
        Ok(self.hash().as_uint() <= target)
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl Eq for Block {}

impl From<BlockHeader> for Block {
    fn from(header: BlockHeader) -> Self {
        Block::new(header)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash().to_hex())
            .field("prev", &self.header.prev_hash.to_hex())
            .field("time", &self.header.time)
            .field("bits", &format_args!("{:#010x}", self.header.bits))
            .field("nonce", &self.header.nonce)
            .finish()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block [{}] prev={} bits={:#010x} ts={} nonce={}",
            self.hash(),
            self.header.prev_hash.short(),
            self.header.bits,
            self.header.time,
            self.header.nonce,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHeader {
        BlockHeader::new(Hash256([7u8; 32]), 1_556_000_000, 0x1d07fff8, 42)
    }

    #[test]
    fn test_header_size() {
        assert_eq!(BlockHeader::new(NULL_HASH, 1, 2, 3).serialize().len(), BlockHeader::SIZE);
        assert_eq!(Block::default().serialize().len(), 44);
    }

    #[test]
    fn test_header_layout_little_endian() {
        let bytes = BlockHeader::new(NULL_HASH, 1, 2, 0x0403_0201).serialize();
        assert_eq!(&bytes[32..36], &[1, 0, 0, 0]);
        assert_eq!(&bytes[36..40], &[2, 0, 0, 0]);
        assert_eq!(&bytes[40..44], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_header_roundtrip() {
        let h = sample();
        assert_eq!(BlockHeader::deserialize(&h.serialize()).unwrap(), h);
    }

    #[test]
    fn test_deserialize_rejects_short_buffer() {
        let bytes = sample().serialize();
        assert_eq!(
            BlockHeader::deserialize(&bytes[..43]),
            Err(DecodeError::Truncated { expected: 44, got: 43 })
        );
    }

    #[test]
    fn test_hash_is_reversed_double_sha() {
        let h = sample();
        let mut expected = double_sha256(&h.serialize());
        expected.reverse();
        assert_eq!(h.hash(), Hash256(expected));
        assert_eq!(h.hash(), h.hash());
    }

    #[test]
    fn test_hash_changes_with_every_field() {
        let base = sample();
        let mut variants = vec![base];
        variants.push(BlockHeader { nonce: base.nonce + 1, ..base });
        variants.push(BlockHeader { time: base.time + 1, ..base });
        variants.push(BlockHeader { bits: base.bits - 1, ..base });
        variants.push(BlockHeader { prev_hash: NULL_HASH, ..base });
        let hashes: std::collections::HashSet<Hash256> = variants.iter().map(|h| h.hash()).collect();
        assert_eq!(hashes.len(), variants.len());
    }

    #[test]
    fn test_block_hash_cached() {
        let block = Block::new(sample());
        assert_eq!(block.hash(), sample().hash());
        let cloned = block.clone();
        assert_eq!(cloned.hash(), block.hash());
        assert_eq!(cloned, block);
    }

    #[test]
    fn test_null_header() {
        assert!(BlockHeader::default().is_null());
        assert!(!sample().is_null());
    }

    #[test]
    fn test_target_bounds() {
        let params = NetworkParameters::testnet();
        assert!(sample().target(&params).is_ok());
        // zero target
        let zero = BlockHeader { bits: 0, ..sample() };
        assert!(matches!(zero.target(&params), Err(VerificationError::InvalidDifficultyTarget { .. })));
        // above the limit
        let easy = BlockHeader { bits: 0x207fffff, ..sample() };
        assert!(matches!(easy.target(&params), Err(VerificationError::InvalidDifficultyTarget { .. })));
        // negative mantissa
        let negative = BlockHeader { bits: 0x1d800001, ..sample() };
        assert!(negative.target(&params).is_err());
    }

    #[test]
    fn test_hash_hex() {
        let h = Hash256([0xab; 32]);
        assert_eq!(Hash256::from_hex(&h.to_hex()), Some(h));
        assert_eq!(Hash256::from_hex("abcd"), None);
        assert_eq!(h.short().len(), 16);
        assert!(NULL_HASH.is_null());
    }
}
