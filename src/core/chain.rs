use num_bigint::BigUint;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

use crate::core::error::{ChainError, VerificationError};
use crate::core::params::*;
use crate::core::stored::StoredBlock;
use crate::core::types::*;
use crate::pow;
use crate::storage::{ChainIndex, StorageError};

/// How `BlockChain::add` applied a block it did not reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Connected on top of the previous tip.
    Extended { hash: Hash256, height: i32 },
    /// Indexed on a branch with no more work than the tip.
    SideBranch { hash: Hash256, height: i32, split_height: i32 },
    /// Its branch overtook the tip; the canonical chain now ends here.
    Reorganized {
        hash: Hash256,
        height: i32,
        split_height: i32,
        disconnected: usize,
        connected: usize,
    },
    /// Parent unknown; the caller should fetch `missing`. Held in the orphan
    /// cache unless its limit is zero.
    Orphan { hash: Hash256, missing: Hash256 },
    /// Already the tip or already indexed.
    Duplicate { hash: Hash256 },
}

impl Accepted {
    pub fn hash(&self) -> Hash256 {
        match self {
            Accepted::Extended { hash, .. }
            | Accepted::SideBranch { hash, .. }
            | Accepted::Reorganized { hash, .. }
            | Accepted::Orphan { hash, .. }
            | Accepted::Duplicate { hash } => *hash,
        }
    }

    /// Whether the block now sits in the index.
    pub fn is_connected(&self) -> bool {
        !matches!(self, Accepted::Orphan { .. })
    }

    /// Whether the canonical tip moved.
    pub fn moved_tip(&self) -> bool {
        matches!(self, Accepted::Extended { .. } | Accepted::Reorganized { .. })
    }
}

/// Snapshot of the chain for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ChainInfo {
    pub network: String,
    pub height: i32,
    pub tip: String,
    pub bits: String,
    pub difficulty: f64,
    pub chain_work: String,
    pub orphans: usize,
}

/// Target the next block must claim, given its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RequiredTarget {
    /// Mid-interval: same compact bits as the parent.
    Unchanged(u32),
    /// First block of an interval: freshly computed target.
    Retarget(BigUint),
}

// ─── Orphans ────────────────────────────────────────────────────────

/// Blocks waiting for their parent, oldest first.
#[derive(Debug)]
struct OrphanPool {
    blocks: VecDeque<Block>,
    limit: usize,
}

impl OrphanPool {
    fn new(limit: usize) -> Self {
        Self { blocks: VecDeque::new(), limit }
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.iter().any(|b| b.hash() == *hash)
    }

    /// Returns the block pushed out to make room, if any.
    fn insert(&mut self, block: Block) -> Option<Block> {
        if self.contains(&block.hash()) {
            return None;
        }
        let evicted = if self.blocks.len() >= self.limit { self.blocks.pop_front() } else { None };
        self.blocks.push_back(block);
        evicted
    }
}

// ─── Chain ──────────────────────────────────────────────────────────

/// The consensus engine: admits blocks, tracks the most-work tip, and keeps
/// the forward links of the canonical chain consistent across forks.
///
/// Every mutation (`add`, including reorganization and orphan retry) runs
/// under one exclusive lock. The tip is mirrored behind its own lock so
/// `get_tip`/`get_height` never wait for a long reorg; they may see the tip
/// from just before it. Orphan queries read a similar snapshot.
pub struct BlockChain<I: ChainIndex> {
    params: NetworkParameters,
    index: I,
    tip: RwLock<StoredBlock>,
    /// Engine lock. Owns the orphan cache, which only `add` touches.
    engine: Mutex<OrphanPool>,
    /// Hashes in the orphan cache as of the last completed `add`.
    orphan_view: RwLock<HashSet<Hash256>>,
}

impl<I: ChainIndex> std::fmt::Debug for BlockChain<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tip = self.tip.read();
        f.debug_struct("BlockChain")
            .field("network", &self.params.id)
            .field("height", &tip.height())
            .field("tip", &tip.hash().to_hex())
            .finish()
    }
}

impl<I: ChainIndex> BlockChain<I> {
    /// Attach to an index; the chain starts at whatever tip it records.
    pub fn new(index: I, params: NetworkParameters) -> Result<Self, ChainError> {
        params.validate()?;
        let tip = index.get_chain_tip()?;
        tracing::info!(
            "💾 Loaded chain: network={} height={} tip={}",
            params.id,
            tip.height(),
            tip.hash().short()
        );
        Ok(Self {
            params,
            index,
            tip: RwLock::new(tip),
            engine: Mutex::new(OrphanPool::new(MAX_ORPHAN_BLOCKS)),
            orphan_view: RwLock::new(HashSet::new()),
        })
    }

    /// Cap the orphan cache; the oldest orphan is dropped when it is full.
    /// A limit of zero disables caching.
    pub fn with_orphan_limit(self, limit: usize) -> Self {
        self.engine.lock().limit = limit;
        self
    }

    // ─── Block Acceptance ───────────────────────────────────────────

    /// Apply a candidate block.
    ///
    /// With `retry_orphans`, every cached orphan whose parent became known is
    /// connected too, repeating until a pass connects nothing. The retry also
    /// runs for a duplicate, so re-sending a known block drains orphans left
    /// behind by an earlier failure.
    ///
    /// The result always describes `block` itself. A storage failure while
    /// retrying orphans is logged and the affected orphan stays cached.
    pub fn add(&self, block: Block, retry_orphans: bool) -> Result<Accepted, ChainError> {
        let mut orphans = self.engine.lock();
        let hash = block.hash();
        let result = self.add_locked(&mut orphans, block, retry_orphans);
        *self.orphan_view.write() = orphans.blocks.iter().map(|b| b.hash()).collect();
        match &result {
            Err(ChainError::Verification(e)) => tracing::warn!("❌ Rejected block {}: {}", hash.short(), e),
            Err(ChainError::Storage(e)) => tracing::error!("💥 Storage failure adding {}: {}", hash.short(), e),
            Err(ChainError::Params(e)) => tracing::error!("💥 Bad network parameters: {}", e),
            Ok(_) => {}
        }
        result
    }

    fn add_locked(&self, orphans: &mut OrphanPool, block: Block, retry_orphans: bool) -> Result<Accepted, ChainError> {
        let accepted = self.admit(orphans, block)?;

        // 8. Orphans
        if retry_orphans && accepted.is_connected() && !orphans.blocks.is_empty() {
            match self.retry_orphans(orphans) {
                Ok(0) => {}
                Ok(resolved) => {
                    tracing::info!("🔗 Connected {} orphan block(s), {} still waiting", resolved, orphans.blocks.len())
                }
                Err(e) => tracing::error!(
                    "💥 Orphan retry after {} failed, {} orphan(s) kept: {}",
                    accepted.hash().short(),
                    orphans.blocks.len(),
                    e
                ),
            }
        }

        Ok(accepted)
    }

    /// Steps 1-7 for a single block.
    fn admit(&self, orphans: &mut OrphanPool, block: Block) -> Result<Accepted, ChainError> {
        let hash = block.hash();
        let tip = self.get_tip();

        // 1. Duplicate of the tip
        if block == *tip.block() {
            return Ok(Accepted::Duplicate { hash });
        }

        // 2. PoW
        if !block.verify_proof_of_work(&self.params)? {
            return Err(VerificationError::BadProofOfWork.into());
        }

        // Already indexed somewhere behind the tip; persisting it again would
        // reset its forward link.
        if self.index.get(&hash)?.is_some() {
            return Ok(Accepted::Duplicate { hash });
        }

        // 3. Parent must exist
        let missing = block.prev_hash();
        let Some(parent) = self.index.get(&missing)? else {
            if orphans.limit == 0 {
                tracing::debug!("👻 Orphan block {} not cached, caching disabled (missing parent {})", hash.short(), missing.short());
                return Ok(Accepted::Orphan { hash, missing });
            }
            if let Some(evicted) = orphans.insert(block) {
                tracing::debug!("🧹 Orphan cache full, dropped {}", evicted.hash().short());
            }
            tracing::debug!("👻 Orphan block {} (missing parent {})", hash.short(), missing.short());
            return Ok(Accepted::Orphan { hash, missing });
        };

        // 4-5. Index entry and difficulty rule
        let candidate = parent.extend(block, &self.params)?;
        self.check_difficulty(&parent, &candidate)?;

        // 6. Persist
        self.index.put(&candidate)?;

        // 7. Tip / branch bookkeeping
        self.connect(candidate, &parent, tip)
    }

    /// Orphans that fail verification are dropped. A storage failure puts
    /// the orphan back where it was and stops the retry.
    fn retry_orphans(&self, orphans: &mut OrphanPool) -> Result<usize, ChainError> {
        let mut resolved = 0;
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < orphans.blocks.len() {
                if self.index.get(&orphans.blocks[i].prev_hash())?.is_none() {
                    i += 1;
                    continue;
                }
                let Some(orphan) = orphans.blocks.remove(i) else { break };
                progress = true;
                let hash = orphan.hash();
                match self.admit(orphans, orphan.clone()) {
                    Ok(accepted) => {
                        resolved += 1;
                        tracing::debug!("🔗 Orphan {} resolved: {:?}", hash.short(), accepted);
                    }
                    Err(ChainError::Verification(e)) => {
                        tracing::warn!("❌ Dropping orphan {}: {}", hash.short(), e);
                    }
                    Err(e) => {
                        orphans.blocks.insert(i, orphan);
                        return Err(e);
                    }
                }
            }
            if !progress {
                return Ok(resolved);
            }
        }
    }

    fn connect(&self, candidate: StoredBlock, parent: &StoredBlock, tip: StoredBlock) -> Result<Accepted, ChainError> {
        let hash = candidate.hash();
        let height = candidate.height();

        if parent.hash() == tip.hash() {
            let mut old_tip = tip;
            old_tip.set_next(hash);
            self.index.commit(&[old_tip], Some(&candidate))?;
            *self.tip.write() = candidate;
            tracing::debug!("✅ Block #{} {} extends the tip", height, hash.short());
            return Ok(Accepted::Extended { hash, height });
        }

        if candidate.more_work_than(&tip) {
            return self.reorganize(candidate, tip);
        }

        let split = self.find_split(&candidate, &tip)?;
        if split.hash() == hash {
            return Ok(Accepted::Duplicate { hash });
        }
        tracing::debug!(
            "📦 Stored side chain block #{} {} (forks at {}, work {} vs tip {})",
            height,
            hash.short(),
            split.height(),
            candidate.chain_work(),
            tip.chain_work()
        );
        Ok(Accepted::SideBranch { hash, height, split_height: split.height() })
    }

    // ─── Reorg ──────────────────────────────────────────────────────

    /// Most recent common ancestor of `a` and `b`.
    pub fn find_split(&self, a: &StoredBlock, b: &StoredBlock) -> Result<StoredBlock, ChainError> {
        let mut left = a.clone();
        let mut right = b.clone();
        while left.hash() != right.hash() {
            if left.height() > right.height() {
                left = self.parent_of(&left)?;
            } else {
                right = self.parent_of(&right)?;
            }
        }
        Ok(left)
    }

    /// Make `new_tip` canonical.
    ///
    /// The old path loses its forward links, the new path (and the split
    /// block) gains them, and the tip pointer moves, all in a single commit.
    fn reorganize(&self, new_tip: StoredBlock, old_tip: StoredBlock) -> Result<Accepted, ChainError> {
        let split = self.find_split(&new_tip, &old_tip)?;
        tracing::info!(
            "🔄 Reorg detected! Branch at #{} has more work ({} vs {}), split at #{}",
            new_tip.height(),
            new_tip.chain_work(),
            old_tip.chain_work(),
            split.height()
        );

        let mut updates = Vec::new();

        // old tip back to (not including) the split
        let mut disconnected = 0;
        let mut cursor = old_tip;
        while cursor.hash() != split.hash() {
            let prev = self.parent_of(&cursor)?;
            cursor.set_next(NULL_HASH);
            updates.push(cursor);
            disconnected += 1;
            cursor = prev;
        }

        // new tip back to the split, pointing each block at its child
        let mut connected = 1;
        let mut child = new_tip.hash();
        let mut cursor = self.parent_of(&new_tip)?;
        while cursor.hash() != split.hash() {
            let prev = self.parent_of(&cursor)?;
            cursor.set_next(child);
            child = cursor.hash();
            updates.push(cursor);
            connected += 1;
            cursor = prev;
        }
        cursor.set_next(child);
        updates.push(cursor);

        self.index.commit(&updates, Some(&new_tip))?;

        let hash = new_tip.hash();
        let height = new_tip.height();
        *self.tip.write() = new_tip;

        tracing::info!(
            "🔄 Reorg complete. New tip: {} height: {} ({} disconnected, {} connected)",
            hash.short(),
            height,
            disconnected,
            connected
        );
        Ok(Accepted::Reorganized { hash, height, split_height: split.height(), disconnected, connected })
    }

    fn parent_of(&self, block: &StoredBlock) -> Result<StoredBlock, StorageError> {
        block.previous(&self.index)?.ok_or(StorageError::MissingBlock(block.prev_hash()))
    }

    // ─── Difficulty ─────────────────────────────────────────────────

    fn required_target(&self, parent: &StoredBlock) -> Result<RequiredTarget, ChainError> {
        let height = parent.height() + 1;
        if !self.params.is_retarget_height(height) {
            return Ok(RequiredTarget::Unchanged(parent.header().bits));
        }

        let mut interval_start = parent.clone();
        for _ in 0..self.params.interval.saturating_sub(1) {
            interval_start = interval_start
                .previous(&self.index)?
                .ok_or(VerificationError::MissingHistory { height })?;
        }

        let timespan = i64::from(parent.header().time) - i64::from(interval_start.header().time);
        let start_target = interval_start.header().target(&self.params)?;
        let target = pow::retarget(
            &start_target,
            timespan,
            self.params.target_timespan,
            &self.params.proof_of_work_limit,
        );
        tracing::debug!(
            "🎯 Retarget at #{}: timespan {}s (want {}s), bits {:#010x} -> {:#010x}",
            height,
            timespan,
            self.params.target_timespan,
            interval_start.header().bits,
            pow::encode_compact(&target)
        );
        Ok(RequiredTarget::Retarget(target))
    }

    fn check_difficulty(&self, parent: &StoredBlock, candidate: &StoredBlock) -> Result<(), ChainError> {
        let got = candidate.header().bits;
        match self.required_target(parent)? {
            RequiredTarget::Unchanged(expected) if expected != got => {
                Err(VerificationError::BadDifficulty { expected, got }.into())
            }
            RequiredTarget::Unchanged(_) => Ok(()),
            RequiredTarget::Retarget(target) => {
                // compare only the bytes the claimed encoding can carry
                let received = candidate.header().target(&self.params)?;
                if pow::mask_to_precision(&target, got) != received {
                    return Err(VerificationError::BadDifficulty { expected: pow::encode_compact(&target), got }.into());
                }
                Ok(())
            }
        }
    }

    /// Compact bits a block built on `parent` must claim.
    pub fn next_bits_after(&self, parent: &StoredBlock) -> Result<u32, ChainError> {
        Ok(match self.required_target(parent)? {
            RequiredTarget::Unchanged(bits) => bits,
            RequiredTarget::Retarget(target) => pow::encode_compact(&target),
        })
    }

    /// Compact bits for a block extending the current tip.
    pub fn next_bits(&self) -> Result<u32, ChainError> {
        self.next_bits_after(&self.get_tip())
    }

    // ─── Public Accessors ───────────────────────────────────────────

    pub fn params(&self) -> &NetworkParameters {
        &self.params
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn get_tip(&self) -> StoredBlock {
        self.tip.read().clone()
    }

    pub fn get_height(&self) -> i32 {
        self.tip.read().height()
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.index.get(hash)?.is_some())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StorageError> {
        self.index.get(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_view.read().len()
    }

    pub fn is_orphan(&self, hash: &Hash256) -> bool {
        self.orphan_view.read().contains(hash)
    }

    /// Up to `limit` blocks starting at `start`, following forward links.
    ///
    /// From a canonical block this walks the canonical chain toward the tip.
    pub fn canonical_from(&self, start: &Hash256, limit: usize) -> Result<Vec<StoredBlock>, StorageError> {
        let mut out = Vec::new();
        let mut cursor = self.index.get(start)?;
        while let Some(block) = cursor {
            if out.len() >= limit {
                break;
            }
            cursor = block.successor(&self.index)?;
            out.push(block);
        }
        Ok(out)
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.params.genesis.hash()
    }

    pub fn info(&self) -> ChainInfo {
        let tip = self.get_tip();
        let bits = tip.header().bits;
        let difficulty = pow::decode_compact(bits)
            .map(|t| pow::difficulty_ratio(&t, &self.params.proof_of_work_limit))
            .unwrap_or(0.0);
        ChainInfo {
            network: self.params.id.to_string(),
            height: tip.height(),
            tip: tip.hash().to_hex(),
            bits: format!("{:#010x}", bits),
            difficulty,
            chain_work: tip.chain_work().to_str_radix(16),
            orphans: self.orphan_count(),
        }
    }
}
