use parking_lot::RwLock;
use sled::Db;
use std::collections::HashMap;
use std::path::Path;

use crate::core::params::NetworkParameters;
use crate::core::stored::StoredBlock;
use crate::core::types::{DecodeError, Hash256};

/// Key prefix for stored block records in sled
const PREFIX_BLOCK: &[u8] = b"blk:";
const META_TIP: &[u8] = b"meta:tip";
const META_NETWORK: &[u8] = b"meta:network";

/// Key-value persistence of [`StoredBlock`]s by hash plus a single chain-tip
/// pointer.
///
/// `get` after `put` of the same hash must return an equal value. The engine
/// calls these from whichever thread holds its write lock, while readers may
/// call `get` concurrently, so implementations synchronize internally.
pub trait ChainIndex: Send + Sync {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError>;

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError>;

    fn get_chain_tip(&self) -> Result<StoredBlock, StorageError>;

    fn set_chain_tip(&self, block: &StoredBlock) -> Result<(), StorageError>;

    /// Write `updates` and, if given, move the tip pointer, as one unit.
    ///
    /// The default applies the writes one at a time; a crash part way through
    /// leaves some forward links rewritten and others not. Backends that can
    /// batch should override it.
    fn commit(&self, updates: &[StoredBlock], new_tip: Option<&StoredBlock>) -> Result<(), StorageError> {
        for block in updates {
            self.put(block)?;
        }
        if let Some(tip) = new_tip {
            self.set_chain_tip(tip)?;
        }
        Ok(())
    }
}

// ─── In-memory index ────────────────────────────────────────────────

/// Index held in a hash map. Used by tests and short-lived tooling.
pub struct MemoryIndex {
    inner: RwLock<MemoryState>,
}

struct MemoryState {
    blocks: HashMap<Hash256, StoredBlock>,
    tip: Hash256,
}

impl MemoryIndex {
    /// New index holding only the genesis block of `params`.
    pub fn new(params: &NetworkParameters) -> Result<Self, StorageError> {
        let genesis = StoredBlock::genesis(params).map_err(|e| StorageError::Genesis(e.to_string()))?;
        let tip = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(tip, genesis);
        Ok(Self { inner: RwLock::new(MemoryState { blocks, tip }) })
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }
}

impl ChainIndex for MemoryIndex {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.inner.write().blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn get_chain_tip(&self) -> Result<StoredBlock, StorageError> {
        let state = self.inner.read();
        state.blocks.get(&state.tip).cloned().ok_or(StorageError::MissingBlock(state.tip))
    }

    fn set_chain_tip(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.inner.write().tip = block.hash();
        Ok(())
    }

    fn commit(&self, updates: &[StoredBlock], new_tip: Option<&StoredBlock>) -> Result<(), StorageError> {
        let mut state = self.inner.write();
        for block in updates {
            state.blocks.insert(block.hash(), block.clone());
        }
        if let Some(tip) = new_tip {
            state.tip = tip.hash();
        }
        Ok(())
    }
}

// ─── sled index ─────────────────────────────────────────────────────

/// Persistent index backed by the sled embedded database.
pub struct SledIndex {
    db: Db,
}

impl SledIndex {
    /// Open or create a database at the given path, seeding it with the
    /// genesis block of `params` if it has no tip yet.
    pub fn open<P: AsRef<Path>>(path: P, params: &NetworkParameters) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Db(e.to_string()))?;
        Self::from_db(db, params)
    }

    /// Throwaway database removed on drop.
    pub fn temporary(params: &NetworkParameters) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Db(e.to_string()))?;
        Self::from_db(db, params)
    }

    fn from_db(db: Db, params: &NetworkParameters) -> Result<Self, StorageError> {
        let index = SledIndex { db };
        index.init_if_needed(params)?;
        Ok(index)
    }

    fn init_if_needed(&self, params: &NetworkParameters) -> Result<(), StorageError> {
        if let Some(stored_id) = self.db.get(META_NETWORK).map_err(db_err)? {
            if stored_id.as_ref() != params.id.as_bytes() {
                return Err(StorageError::NetworkMismatch {
                    expected: params.id.to_string(),
                    found: String::from_utf8_lossy(&stored_id).into_owned(),
                });
            }
        }
        if self.has_chain_data() {
            return Ok(());
        }
        let genesis = StoredBlock::genesis(params).map_err(|e| StorageError::Genesis(e.to_string()))?;
        self.db.insert(META_NETWORK, params.id.as_bytes()).map_err(db_err)?;
        self.commit(&[genesis.clone()], Some(&genesis))?;
        self.flush()?;
        tracing::info!("💾 Initialized block index with genesis {}", genesis.hash().short());
        Ok(())
    }

    /// Check if the database has existing chain data
    pub fn has_chain_data(&self) -> bool {
        self.db.contains_key(META_TIP).unwrap_or(false)
    }

    /// Number of stored block records
    pub fn len(&self) -> usize {
        self.db.scan_prefix(PREFIX_BLOCK).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }
}

impl ChainIndex for SledIndex {
    fn put(&self, block: &StoredBlock) -> Result<(), StorageError> {
        let value = block.serialize()?;
        self.db.insert(block_key(&block.hash()), value.as_slice()).map_err(db_err)?;
        Ok(())
    }

    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        match self.db.get(block_key(hash)).map_err(db_err)? {
            Some(bytes) => Ok(Some(StoredBlock::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_chain_tip(&self) -> Result<StoredBlock, StorageError> {
        let bytes = self.db.get(META_TIP).map_err(db_err)?.ok_or(StorageError::MissingTip)?;
        let hash: [u8; 32] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| StorageError::Corrupt(format!("tip pointer of {} bytes", bytes.len())))?;
        let hash = Hash256(hash);
        self.get(&hash)?.ok_or(StorageError::MissingBlock(hash))
    }

    fn set_chain_tip(&self, block: &StoredBlock) -> Result<(), StorageError> {
        self.db.insert(META_TIP, block.hash().as_bytes().as_slice()).map_err(db_err)?;
        Ok(())
    }

    fn commit(&self, updates: &[StoredBlock], new_tip: Option<&StoredBlock>) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for block in updates {
            batch.insert(block_key(&block.hash()), block.serialize()?.as_slice());
        }
        if let Some(tip) = new_tip {
            batch.insert(META_TIP, tip.hash().as_bytes().as_slice());
        }
        self.db.apply_batch(batch).map_err(db_err)?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn block_key(hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX_BLOCK.len() + Hash256::SIZE);
    key.extend_from_slice(PREFIX_BLOCK);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn db_err(e: sled::Error) -> StorageError {
    StorageError::Db(e.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("no chain tip recorded")]
    MissingTip,
    #[error("block {0} missing from index")]
    MissingBlock(Hash256),
    #[error("chain work of {0} does not fit the record")]
    ChainWorkOverflow(Hash256),
    #[error("index belongs to network {found:?}, expected {expected:?}")]
    NetworkMismatch { expected: String, found: String },
    #[error("cannot build genesis entry: {0}")]
    Genesis(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Block, BlockHeader};

    fn child(parent: &StoredBlock, params: &NetworkParameters) -> StoredBlock {
        let header = BlockHeader::new(parent.hash(), parent.header().time + 60, parent.header().bits, 1);
        parent.extend(Block::new(header), params).unwrap()
    }

    fn exercise_index<I: ChainIndex>(index: &I, params: &NetworkParameters) {
        // the first block in a new store is the genesis block
        let genesis = index.get_chain_tip().unwrap();
        assert_eq!(genesis.block(), &params.genesis_block());
        assert_eq!(genesis.height(), 0);

        let b1 = child(&genesis, params);
        index.put(&b1).unwrap();
        index.set_chain_tip(&b1).unwrap();
        assert_eq!(index.get(&b1.hash()).unwrap(), Some(b1.clone()));
        assert_eq!(index.get_chain_tip().unwrap(), b1);
        assert_eq!(index.get(&Hash256([9u8; 32])).unwrap(), None);

        let mut linked = genesis.clone();
        linked.set_next(b1.hash());
        let b2 = child(&b1, params);
        index.commit(&[linked.clone(), b2.clone()], Some(&b2)).unwrap();
        assert_eq!(index.get(&genesis.hash()).unwrap().unwrap().next(), b1.hash());
        assert_eq!(index.get_chain_tip().unwrap(), b2);
        assert_eq!(linked.successor(index).unwrap(), Some(b1.clone()));
        assert_eq!(b2.previous(index).unwrap(), Some(b1));
        assert_eq!(genesis.previous(index).unwrap(), None);
    }

    #[test]
    fn test_memory_index() {
        let params = NetworkParameters::regtest();
        let index = MemoryIndex::new(&params).unwrap();
        assert_eq!(index.len(), 1);
        exercise_index(&index, &params);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_sled_index() {
        let params = NetworkParameters::regtest();
        let index = SledIndex::temporary(&params).unwrap();
        assert!(index.has_chain_data());
        exercise_index(&index, &params);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_sled_reopen_keeps_tip() {
        let params = NetworkParameters::regtest();
        let dir = std::env::temp_dir().join(format!("powchain-index-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let b1 = {
            let index = SledIndex::open(&dir, &params).unwrap();
            let genesis = index.get_chain_tip().unwrap();
            let b1 = child(&genesis, &params);
            index.commit(&[b1.clone()], Some(&b1)).unwrap();
            index.flush().unwrap();
            b1
        };
        {
            let index = SledIndex::open(&dir, &params).unwrap();
            assert_eq!(index.get(&b1.hash()).unwrap(), Some(b1.clone()));
            assert_eq!(index.get_chain_tip().unwrap(), b1);
        }
        let testnet = NetworkParameters::testnet();
        assert!(matches!(
            SledIndex::open(&dir, &testnet),
            Err(StorageError::NetworkMismatch { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
