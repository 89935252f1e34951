use num_bigint::BigUint;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::chain::BlockChain;
use crate::core::error::{ChainError, VerificationError};
use crate::core::params::*;
use crate::core::stored::StoredBlock;
use crate::core::types::*;
use crate::storage::ChainIndex;

/// Mining configuration
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Number of mining threads
    pub threads: usize,
    /// Stop after this many accepted blocks (`None` mines until stopped)
    pub count: Option<u64>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self { threads: 1, count: None }
    }
}

/// Seconds since the epoch, saturated to the header's 32-bit field.
pub fn unix_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Header for the next block on the current tip, nonce zero.
pub fn create_block_template<I: ChainIndex>(chain: &BlockChain<I>) -> Result<BlockHeader, ChainError> {
    template_on(chain, &chain.get_tip(), unix_now())
}

/// Header for a block on `parent` stamped `now`.
///
/// Timestamps stay strictly increasing: if the clock has not moved past the
/// parent, the parent's time plus one is used instead.
pub fn template_on<I: ChainIndex>(
    chain: &BlockChain<I>,
    parent: &StoredBlock,
    now: u32,
) -> Result<BlockHeader, ChainError> {
    let bits = chain.next_bits_after(parent)?;
    let prev_time = parent.header().time;
    let time = if now > prev_time { now } else { prev_time.saturating_add(1) };
    Ok(BlockHeader::new(parent.hash(), time, bits, 0))
}

/// Result of a mining attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineResult {
    Found(Block),
    /// Every nonce was tried; the caller needs a fresh template.
    Exhausted,
    Cancelled,
}

/// Try `nonces` in order until one meets `target`.
pub fn search(mut header: BlockHeader, target: &BigUint, nonces: RangeInclusive<u32>, stop: &AtomicBool) -> MineResult {
    for nonce in nonces {
        if stop.load(Ordering::Relaxed) {
            return MineResult::Cancelled;
        }
        header.nonce = nonce;
        if header.hash().as_uint() <= *target {
            return MineResult::Found(Block::new(header));
        }
    }
    MineResult::Exhausted
}

/// Mine a block (single-threaded), starting from the header's nonce.
pub fn mine_block(
    header: BlockHeader,
    params: &NetworkParameters,
    stop: Arc<AtomicBool>,
) -> Result<MineResult, VerificationError> {
    let target = header.target(params)?;
    let start = std::time::Instant::now();

    tracing::info!("⛏️  Mining on {} (bits {:#010x})...", header.prev_hash.short(), header.bits);

    let result = search(header, &target, header.nonce..=u32::MAX, &stop);
    if let MineResult::Found(block) = &result {
        tracing::info!(
            "⛏️  Block mined! nonce={} hash={} time={:.2}s",
            block.nonce(),
            block.hash(),
            start.elapsed().as_secs_f64(),
        );
    }
    Ok(result)
}

/// Multi-threaded mining (splits the nonce space across threads)
pub fn mine_block_parallel(
    header: BlockHeader,
    params: &NetworkParameters,
    threads: usize,
    stop: Arc<AtomicBool>,
) -> Result<MineResult, VerificationError> {
    if threads <= 1 {
        return mine_block(header, params, stop);
    }

    let target = Arc::new(header.target(params)?);
    tracing::info!(
        "⛏️  Mining on {} (bits {:#010x}, {} threads)...",
        header.prev_hash.short(),
        header.bits,
        threads,
    );

    let space = u64::from(u32::MAX) + 1;
    let chunk = space / threads as u64;
    // found by a sibling; kept apart from `stop` so a win is not reported as a cancel
    let done = Arc::new(AtomicBool::new(false));
    let (tx, rx) = std::sync::mpsc::channel();
    let start = std::time::Instant::now();

    let handles: Vec<_> = (0..threads as u64)
        .map(|i| {
            let first = (i * chunk) as u32;
            let last = if i + 1 == threads as u64 { u32::MAX } else { ((i + 1) * chunk - 1) as u32 };
            let stop = stop.clone();
            let done = done.clone();
            let target = target.clone();
            let tx = tx.clone();

            std::thread::spawn(move || {
                for from in (u64::from(first)..=u64::from(last)).step_by(4096) {
                    if stop.load(Ordering::Relaxed) || done.load(Ordering::Relaxed) {
                        return;
                    }
                    let to = (from + 4095).min(u64::from(last)) as u32;
                    if let MineResult::Found(block) = search(header, &target, from as u32..=to, &stop) {
                        done.store(true, Ordering::Relaxed);
                        let _ = tx.send(block);
                        return;
                    }
                }
            })
        })
        .collect();

    drop(tx);

    let result = match rx.recv() {
        Ok(block) => {
            tracing::info!(
                "⛏️  Block mined! nonce={} hash={} time={:.2}s",
                block.nonce(),
                block.hash(),
                start.elapsed().as_secs_f64(),
            );
            MineResult::Found(block)
        }
        Err(_) if stop.load(Ordering::Relaxed) => MineResult::Cancelled,
        Err(_) => MineResult::Exhausted,
    };

    done.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::regtest_chain;
    use crate::pow;

    #[test]
    fn test_create_block_template() {
        let chain = regtest_chain();
        let template = create_block_template(&chain).unwrap();
        assert_eq!(template.prev_hash, chain.get_tip().hash());
        assert_eq!(template.bits, REGTEST_BITS);
        assert_eq!(template.nonce, 0);
        assert!(template.time > chain.get_tip().header().time);
    }

    #[test]
    fn test_template_time_strictly_increasing() {
        let chain = regtest_chain();
        let tip = chain.get_tip();
        let template = template_on(&chain, &tip, 5).unwrap();
        assert_eq!(template.time, tip.header().time + 1);
    }

    #[test]
    fn test_mine_single_block() {
        let chain = regtest_chain();
        let template = create_block_template(&chain).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        match mine_block(template, chain.params(), stop).unwrap() {
            MineResult::Found(block) => {
                assert!(block.verify_proof_of_work(chain.params()).unwrap());
                assert!(chain.add(block, true).unwrap().moved_tip());
                assert_eq!(chain.get_height(), 1);
            }
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_mine_parallel() {
        let chain = regtest_chain();
        let template = create_block_template(&chain).unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        match mine_block_parallel(template, chain.params(), 4, stop.clone()).unwrap() {
            MineResult::Found(block) => assert!(block.verify_proof_of_work(chain.params()).unwrap()),
            other => panic!("expected a block, got {:?}", other),
        }
        assert!(!stop.load(Ordering::Relaxed));
    }

    #[test]
    fn test_mine_cancelled() {
        let chain = regtest_chain();
        let template = create_block_template(&chain).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        assert_eq!(mine_block(template, chain.params(), stop.clone()).unwrap(), MineResult::Cancelled);
        assert_eq!(mine_block_parallel(template, chain.params(), 3, stop).unwrap(), MineResult::Cancelled);
    }

    #[test]
    fn test_search_exhausted() {
        let header = BlockHeader::new(NULL_HASH, 1, 0x03000001, 0);
        let target = pow::decode_compact(header.bits).unwrap();
        assert_eq!(search(header, &target, 0..=200, &AtomicBool::new(false)), MineResult::Exhausted);
    }

    #[test]
    fn test_mine_rejects_invalid_target() {
        let header = BlockHeader::new(NULL_HASH, 1, 0, 0);
        let stop = Arc::new(AtomicBool::new(false));
        assert_eq!(
            mine_block(header, &NetworkParameters::regtest(), stop),
            Err(VerificationError::InvalidDifficultyTarget { bits: 0 })
        );
    }
}
