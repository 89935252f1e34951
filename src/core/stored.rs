use num_bigint::BigUint;
use std::fmt;

use crate::core::error::VerificationError;
use crate::core::params::NetworkParameters;
use crate::core::types::*;
use crate::storage::{ChainIndex, StorageError};

/// Bytes reserved for cumulative work in a record
const CHAIN_WORK_BYTES: usize = 16;

/// A block together with what the index knows about it: height, cumulative
/// work from genesis, and the forward link along the branch it sits on.
///
/// Only `next` changes after creation, and only the chain engine changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    block: Block,
    chain_work: BigUint,
    height: i32,
    next: Hash256,
}

impl StoredBlock {
    /// Record layout: height(4, BE) | chain_work(16, BE) | next(32) | header(44)
    pub const SIZE: usize = 4 + CHAIN_WORK_BYTES + Hash256::SIZE + BlockHeader::SIZE;

    /// Records written before forward links existed
    pub const LEGACY_SIZE: usize = 4 + CHAIN_WORK_BYTES + BlockHeader::SIZE;

    pub fn new(block: Block, chain_work: BigUint, height: i32) -> Self {
        Self { block, chain_work, height, next: NULL_HASH }
    }

    /// Index entry for the network's genesis block.
    pub fn genesis(params: &NetworkParameters) -> Result<Self, VerificationError> {
        let block = params.genesis_block();
        let work = block.work(params)?;
        Ok(Self::new(block, work, 0))
    }

    /// Entry for `block` as a child of `self`.
    pub fn extend(&self, block: Block, params: &NetworkParameters) -> Result<Self, VerificationError> {
        let chain_work = &self.chain_work + block.work(params)?;
        Ok(Self::new(block, chain_work, self.height + 1))
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn header(&self) -> &BlockHeader {
        self.block.header()
    }

    pub fn hash(&self) -> Hash256 {
        self.block.hash()
    }

    pub fn prev_hash(&self) -> Hash256 {
        self.block.prev_hash()
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn chain_work(&self) -> &BigUint {
        &self.chain_work
    }

    pub fn next(&self) -> Hash256 {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: Hash256) {
        self.next = next;
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn more_work_than(&self, other: &StoredBlock) -> bool {
        self.chain_work > other.chain_work
    }

    pub fn previous<I: ChainIndex + ?Sized>(&self, index: &I) -> Result<Option<StoredBlock>, StorageError> {
        if self.prev_hash().is_null() {
            return Ok(None);
        }
        index.get(&self.prev_hash())
    }

    pub fn successor<I: ChainIndex + ?Sized>(&self, index: &I) -> Result<Option<StoredBlock>, StorageError> {
        if self.next.is_null() {
            return Ok(None);
        }
        index.get(&self.next)
    }

    // ─── Record codec ───────────────────────────────────────────────

    pub fn serialize(&self) -> Result<[u8; Self::SIZE], StorageError> {
        let work = self.chain_work.to_bytes_be();
        if work.len() > CHAIN_WORK_BYTES {
            return Err(StorageError::ChainWorkOverflow(self.hash()));
        }
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.height.to_be_bytes());
        // left-pad chain work to its fixed width
        buf[4 + CHAIN_WORK_BYTES - work.len()..4 + CHAIN_WORK_BYTES].copy_from_slice(&work);
        let at = 4 + CHAIN_WORK_BYTES;
        buf[at..at + 32].copy_from_slice(self.next.as_bytes());
        buf[at + 32..].copy_from_slice(&self.block.serialize());
        Ok(buf)
    }

    /// Decode a current (96-byte) or legacy (64-byte, no forward link) record.
    pub fn deserialize(data: &[u8]) -> Result<Self, StorageError> {
        let has_next = match data.len() {
            Self::SIZE => true,
            Self::LEGACY_SIZE => false,
            n => return Err(StorageError::Corrupt(format!("stored block record of {} bytes", n))),
        };
        let height = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let chain_work = BigUint::from_bytes_be(&data[4..4 + CHAIN_WORK_BYTES]);
        let mut at = 4 + CHAIN_WORK_BYTES;
        let next = if has_next {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&data[at..at + 32]);
            at += 32;
            Hash256(hash)
        } else {
            NULL_HASH
        };
        let block = Block::deserialize(&data[at..])?;
        Ok(Self { block, chain_work, height, next })
    }
}

impl fmt::Display for StoredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block {} at height {}: {}", self.hash(), self.height, self.block)
    }
}
