//! Regtest fixtures shared by the unit tests.
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;

use crate::core::chain::{Accepted, BlockChain};
use crate::core::params::NetworkParameters;
use crate::core::stored::StoredBlock;
use crate::core::types::*;
use crate::miner::{self, MineResult};
use crate::pow;
use crate::storage::{ChainIndex, MemoryIndex, StorageError};

pub fn regtest_chain() -> BlockChain<MemoryIndex> {
    let params = NetworkParameters::regtest();
    let index = MemoryIndex::new(&params).unwrap();
    BlockChain::new(index, params).unwrap()
}

/// Regtest chain over an index that can be told to fail writes.
pub fn failing_chain() -> BlockChain<FailingIndex> {
    let params = NetworkParameters::regtest();
    let index = FailingIndex::new(&params);
    BlockChain::new(index, params).unwrap()
}

/// Memory index whose writes touching one chosen hash fail.
pub struct FailingIndex {
    inner: MemoryIndex,
    fail_on: Mutex<Option<Hash256>>,
}

impl FailingIndex {
    pub fn new(params: &NetworkParameters) -> Self {
        Self { inner: MemoryIndex::new(params).unwrap(), fail_on: Mutex::new(None) }
    }

    pub fn fail_on(&self, hash: Option<Hash256>) {
        *self.fail_on.lock() = hash;
    }

    fn check(&self, hash: Hash256) -> Result<(), StorageError> {
        if *self.fail_on.lock() == Some(hash) {
            return Err(StorageError::Db("disk full".to_string()));
        }
        Ok(())
    }
}

impl ChainIndex for FailingIndex {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.check(block.hash())?;
        self.inner.put(block)
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        self.inner.get(hash)
    }

    fn get_chain_tip(&self) -> Result<StoredBlock, StorageError> {
        self.inner.get_chain_tip()
    }

    fn set_chain_tip(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.check(block.hash())?;
        self.inner.set_chain_tip(block)
    }

    fn commit(&self, updates: &[StoredBlock], new_tip: Option<&StoredBlock>) -> Result<(), StorageError> {
        for block in updates.iter().chain(new_tip) {
            self.check(block.hash())?;
        }
        self.inner.commit(updates, new_tip)
    }
}

/// Solve a header on `prev` claiming `bits`.
pub fn mine_with_bits_on(prev: Hash256, time: u32, bits: u32) -> Block {
    let header = BlockHeader::new(prev, time, bits, 0);
    let target = pow::decode_compact(bits).unwrap();
    match miner::search(header, &target, 0..=u32::MAX, &AtomicBool::new(false)) {
        MineResult::Found(block) => block,
        other => panic!("no solution for {:?}: {:?}", header, other),
    }
}

pub fn mine_with_bits(parent: &StoredBlock, time: u32, bits: u32) -> Block {
    mine_with_bits_on(parent.hash(), time, bits)
}

/// Valid child of `parent`, `offset` seconds later.
pub fn mine_child<I: ChainIndex>(chain: &BlockChain<I>, parent: &StoredBlock, offset: u32) -> Block {
    let bits = chain.next_bits_after(parent).unwrap();
    mine_with_bits(parent, parent.header().time + offset, bits)
}

/// Child of `parent` with correct bits but a hash above its target.
pub fn unsolved_child<I: ChainIndex>(chain: &BlockChain<I>, parent: &StoredBlock, offset: u32) -> Block {
    let bits = chain.next_bits_after(parent).unwrap();
    let target = pow::decode_compact(bits).unwrap();
    (0..)
        .map(|nonce| BlockHeader::new(parent.hash(), parent.header().time + offset, bits, nonce))
        .find(|header| header.hash().as_uint() > target)
        .map(Block::new)
        .unwrap()
}

/// Extend the tip by `n` blocks spaced `spacing` seconds apart.
pub fn grow<I: ChainIndex>(chain: &BlockChain<I>, n: usize, spacing: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(n);
    for _ in 0..n {
        let tip = chain.get_tip();
        let block = mine_child(chain, &tip, spacing);
        let accepted = chain.add(block.clone(), true).unwrap();
        assert!(matches!(accepted, Accepted::Extended { .. }), "unexpected {:?}", accepted);
        blocks.push(block);
    }
    blocks
}

/// Walk the canonical chain from genesis and check every link.
pub fn assert_chain_monotonic<I: ChainIndex>(chain: &BlockChain<I>) {
    let path = chain.canonical_from(&chain.genesis_hash(), usize::MAX).unwrap();
    assert_eq!(path.len() as i32, chain.get_height() + 1);
    for pair in path.windows(2) {
        assert_eq!(pair[1].height(), pair[0].height() + 1);
        assert_eq!(pair[1].prev_hash(), pair[0].hash());
        assert!(pair[1].more_work_than(&pair[0]));
    }
    assert_eq!(path.last().map(|b| b.hash()), Some(chain.get_tip().hash()));
}
