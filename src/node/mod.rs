//! Message-passing front end for the chain engine.
//!
//! One worker task owns all writes: submissions queue on an mpsc channel and
//! are applied in arrival order, each on the blocking pool, with the outcome
//! sent back on a oneshot. The current tip hash is published on a watch
//! channel so miners and peers can react to new blocks without polling.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::chain::{Accepted, BlockChain};
use crate::core::error::{ChainError, VerificationError};
use crate::core::types::*;
use crate::miner::{self, MineResult, MinerConfig};
use crate::storage::ChainIndex;

/// Submissions buffered before `submit` starts waiting
pub const COMMAND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("chain worker has shut down")]
    WorkerClosed,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("mining: {0}")]
    Mining(#[from] VerificationError),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub enum ChainCommand {
    Submit {
        block: Block,
        reply: oneshot::Sender<Result<Accepted, ChainError>>,
    },
}

/// Cloneable sender side of the chain worker.
#[derive(Clone)]
pub struct ChainHandle {
    tx: mpsc::Sender<ChainCommand>,
    tip: watch::Receiver<Hash256>,
}

impl ChainHandle {
    /// Queue a block and wait for the engine's verdict.
    pub async fn submit(&self, block: Block) -> Result<Accepted, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ChainCommand::Submit { block, reply })
            .await
            .map_err(|_| NodeError::WorkerClosed)?;
        let outcome = rx.await.map_err(|_| NodeError::WorkerClosed)?;
        Ok(outcome?)
    }

    /// Last tip the worker published.
    pub fn tip(&self) -> Hash256 {
        *self.tip.borrow()
    }

    pub fn subscribe_tip(&self) -> watch::Receiver<Hash256> {
        self.tip.clone()
    }
}

/// Start the worker on the current runtime.
///
/// The worker stops once every `ChainHandle` is dropped.
pub fn spawn_chain_worker<I: ChainIndex + 'static>(
    chain: Arc<BlockChain<I>>,
) -> (ChainHandle, watch::Receiver<Hash256>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (tip_tx, tip_rx) = watch::channel(chain.get_tip().hash());
    tokio::spawn(run_worker(chain, rx, tip_tx));
    (ChainHandle { tx, tip: tip_rx.clone() }, tip_rx)
}

async fn run_worker<I: ChainIndex + 'static>(
    chain: Arc<BlockChain<I>>,
    mut rx: mpsc::Receiver<ChainCommand>,
    tip_tx: watch::Sender<Hash256>,
) {
    tracing::debug!("🧵 Chain worker started");
    while let Some(command) = rx.recv().await {
        match command {
            ChainCommand::Submit { block, reply } => {
                let engine = chain.clone();
                let outcome = match tokio::task::spawn_blocking(move || engine.add(block, true)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // reply is dropped, so the submitter sees WorkerClosed
                        tracing::error!("💥 Chain task failed: {}", e);
                        break;
                    }
                };
                if outcome.is_ok() {
                    let tip = chain.get_tip().hash();
                    tip_tx.send_if_modified(|current| {
                        if *current == tip {
                            return false;
                        }
                        *current = tip;
                        true
                    });
                }
                let _ = reply.send(outcome);
            }
        }
    }
    tracing::debug!("🧵 Chain worker stopped");
}

// ─── Mining ─────────────────────────────────────────────────────────

/// Template on the current tip plus a tip receiver that fires on any later
/// change. The tip is marked seen before the template reads the chain.
fn watch_and_template<I: ChainIndex>(
    chain: &BlockChain<I>,
    handle: &ChainHandle,
) -> Result<(watch::Receiver<Hash256>, BlockHeader), NodeError> {
    let mut tip = handle.subscribe_tip();
    tip.borrow_and_update();
    let template = miner::create_block_template(chain)?;
    Ok((tip, template))
}

/// Mine on the current tip and submit each solution through `handle` until
/// `stop` is set or `config.count` blocks have been accepted.
///
/// Work in progress is abandoned as soon as the tip moves.
pub async fn run_miner<I: ChainIndex + 'static>(
    chain: Arc<BlockChain<I>>,
    handle: ChainHandle,
    config: MinerConfig,
    stop: Arc<AtomicBool>,
) -> Result<u64, NodeError> {
    let threads = config.threads.max(1);
    let mut mined: u64 = 0;
    tracing::info!("⛏️  Mining with {} thread(s)", threads);

    loop {
        if stop.load(Ordering::Relaxed) || config.count.is_some_and(|n| mined >= n) {
            break;
        }

        let (mut tip, template) = watch_and_template(&chain, &handle)?;
        let mine_stop = Arc::new(AtomicBool::new(false));

        // Watch for global stop OR a new tip
        let watcher = {
            let mine_stop = mine_stop.clone();
            let global_stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                            if global_stop.load(Ordering::Relaxed) {
                                mine_stop.store(true, Ordering::Relaxed);
                                break;
                            }
                        }
                        _ = tip.changed() => {
                            mine_stop.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            })
        };

        let params = chain.params().clone();
        let result = tokio::task::spawn_blocking(move || {
            miner::mine_block_parallel(template, &params, threads, mine_stop)
        })
        .await;
        watcher.abort();

        match result?? {
            MineResult::Found(block) => match handle.submit(block).await {
                Ok(accepted) if accepted.moved_tip() => {
                    mined += 1;
                    tracing::info!("✅ Block #{} added. Hash: {}", chain.get_height(), accepted.hash());
                }
                Ok(other) => tracing::warn!("⚠️  Mined block not connected: {:?}", other),
                // stale template; the next round rebuilds it
                Err(NodeError::Chain(e)) if e.is_verification() => {
                    tracing::warn!("❌ Mined block rejected: {}", e)
                }
                Err(e) => return Err(e),
            },
            MineResult::Exhausted => tracing::debug!("⛏️  Nonce space exhausted, refreshing template"),
            MineResult::Cancelled => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    tracing::info!("⛏️  Mining stopped after {} block(s)", mined);
    Ok(mined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::*;

    #[tokio::test]
    async fn test_submit_extends_and_publishes_tip() {
        let chain = Arc::new(regtest_chain());
        let (handle, mut tip) = spawn_chain_worker(chain.clone());
        assert_eq!(*tip.borrow_and_update(), chain.genesis_hash());

        let block = mine_child(&chain, &chain.get_tip(), 60);
        let accepted = handle.submit(block.clone()).await.unwrap();
        assert!(matches!(accepted, Accepted::Extended { height: 1, .. }));

        tip.changed().await.unwrap();
        assert_eq!(*tip.borrow(), block.hash());
        assert_eq!(handle.tip(), block.hash());
    }

    #[tokio::test]
    async fn test_submit_reports_rejection() {
        let chain = Arc::new(regtest_chain());
        let (handle, tip) = spawn_chain_worker(chain.clone());
        let bad = unsolved_child(&chain, &chain.get_tip(), 60);
        match handle.submit(bad).await {
            Err(NodeError::Chain(ChainError::Verification(VerificationError::BadProofOfWork))) => {}
            other => panic!("expected BadProofOfWork, got {:?}", other),
        }
        assert!(!tip.has_changed().unwrap());
        assert_eq!(chain.get_height(), 0);
    }

    #[tokio::test]
    async fn test_orphans_through_worker() {
        let source = regtest_chain();
        let blocks = grow(&source, 3, 60);
        let chain = Arc::new(regtest_chain());
        let (handle, _tip) = spawn_chain_worker(chain.clone());

        assert!(matches!(handle.submit(blocks[2].clone()).await.unwrap(), Accepted::Orphan { .. }));
        assert!(matches!(handle.submit(blocks[1].clone()).await.unwrap(), Accepted::Orphan { .. }));
        handle.submit(blocks[0].clone()).await.unwrap();
        assert_eq!(handle.tip(), blocks[2].hash());
        assert_eq!(chain.get_height(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters() {
        let source = regtest_chain();
        let blocks = grow(&source, 8, 60);
        let chain = Arc::new(regtest_chain());
        let (handle, _tip) = spawn_chain_worker(chain.clone());

        let mut tasks = Vec::new();
        for shift in 0..4 {
            let handle = handle.clone();
            let mut order = blocks.clone();
            order.rotate_right(shift * 2);
            tasks.push(tokio::spawn(async move {
                for block in order {
                    handle.submit(block).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(chain.get_height(), 8);
        assert_eq!(handle.tip(), blocks[7].hash());
        assert_eq!(chain.orphan_count(), 0);
    }

    #[tokio::test]
    async fn test_run_miner_count() {
        let chain = Arc::new(regtest_chain());
        let (handle, _tip) = spawn_chain_worker(chain.clone());
        let config = MinerConfig { threads: 2, count: Some(3) };
        let mined = run_miner(chain.clone(), handle.clone(), config, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(mined, 3);
        assert_eq!(chain.get_height(), 3);
        assert_eq!(handle.tip(), chain.get_tip().hash());
        assert_chain_monotonic(&chain);
    }

    #[tokio::test]
    async fn test_template_watch_sees_later_tip() {
        let chain = Arc::new(regtest_chain());
        let (handle, _tip) = spawn_chain_worker(chain.clone());
        let (mut tip, template) = watch_and_template(&chain, &handle).unwrap();
        assert_eq!(template.prev_hash, *tip.borrow());
        assert!(!tip.has_changed().unwrap());

        let block = mine_child(&chain, &chain.get_tip(), 60);
        handle.submit(block.clone()).await.unwrap();
        tip.changed().await.unwrap();
        assert_eq!(*tip.borrow(), block.hash());
        assert_ne!(template.prev_hash, block.hash());
    }

    #[tokio::test]
    async fn test_run_miner_stopped() {
        let chain = Arc::new(regtest_chain());
        let (handle, _tip) = spawn_chain_worker(chain.clone());
        let mined = run_miner(chain.clone(), handle, MinerConfig::default(), Arc::new(AtomicBool::new(true)))
            .await
            .unwrap();
        assert_eq!(mined, 0);
        assert_eq!(chain.get_height(), 0);
    }
}
