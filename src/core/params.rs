//! powchain network parameters.
//! Everything consensus-critical that differs between networks lives in
//! [`NetworkParameters`]; a chain instance receives one at construction and
//! never mutates it.
use num_bigint::BigUint;
use num_traits::Num;

use crate::core::types::{Block, BlockHeader, NULL_HASH};
use crate::pow;

/// Id of the public test network
pub const ID_TESTNET: &str = "test";

/// Id of the local regression-test network (trivial difficulty)
pub const ID_REGTEST: &str = "regtest";

/// Difficulty changes once a day
pub const TARGET_TIMESPAN: u32 = 24 * 60 * 60;

/// Five minutes per block
pub const TARGET_SPACING: u32 = 5 * 60;

/// Blocks between retargets (288 on the test network)
pub const BLOCK_INTERVAL: u32 = TARGET_TIMESPAN / TARGET_SPACING;

/// Default cap on blocks held while waiting for their parent
pub const MAX_ORPHAN_BLOCKS: usize = 512;

/// Compact bits of the test network genesis block
pub const TESTNET_GENESIS_BITS: u32 = 0x1d07fff8;

/// Compact bits of the regtest limit and genesis block
pub const REGTEST_BITS: u32 = 0x207fffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParameters {
    pub id: &'static str,
    /// Largest (easiest) target any block may claim
    pub proof_of_work_limit: BigUint,
    /// Seconds one retarget interval should span
    pub target_timespan: u32,
    /// Blocks between retargets
    pub interval: u32,
    pub genesis: BlockHeader,
}

/// Parameter sets the engine refuses to run with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("retarget interval must be at least one block")]
    ZeroInterval,
    #[error("target timespan of {0}s is too short to clamp (minimum 4s)")]
    TimespanTooShort(u32),
    #[error("proof-of-work limit must be non-zero")]
    ZeroLimit,
}

impl NetworkParameters {
    pub fn testnet() -> Self {
        let limit = BigUint::from_str_radix(
            "0000000fffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            16,
        )
        .unwrap_or_default();
        Self {
            id: ID_TESTNET,
            proof_of_work_limit: limit,
            target_timespan: TARGET_TIMESPAN,
            interval: BLOCK_INTERVAL,
            genesis: BlockHeader::new(NULL_HASH, 0, TESTNET_GENESIS_BITS, 0),
        }
    }

    /// Every other hash meets the limit, and the interval is short enough to
    /// exercise retargeting in a handful of blocks.
    pub fn regtest() -> Self {
        Self {
            id: ID_REGTEST,
            proof_of_work_limit: pow::decode_compact(REGTEST_BITS).unwrap_or_default(),
            target_timespan: 10 * 60,
            interval: 10,
            genesis: BlockHeader::new(NULL_HASH, 1_556_668_800, REGTEST_BITS, 0),
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            ID_TESTNET => Some(Self::testnet()),
            ID_REGTEST => Some(Self::regtest()),
            _ => None,
        }
    }

    /// Fields are public, so hand-built sets are checked before use.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.interval == 0 {
            return Err(ParamsError::ZeroInterval);
        }
        if self.target_timespan < 4 {
            return Err(ParamsError::TimespanTooShort(self.target_timespan));
        }
        if self.proof_of_work_limit == BigUint::default() {
            return Err(ParamsError::ZeroLimit);
        }
        Ok(())
    }

    pub fn genesis_block(&self) -> Block {
        Block::new(self.genesis)
    }

    /// Seconds each block should take on average
    pub fn target_spacing(&self) -> u32 {
        self.target_timespan / self.interval.max(1)
    }

    /// Whether a block at `height` opens a new difficulty interval
    pub fn is_retarget_height(&self, height: i32) -> bool {
        let Ok(interval) = i32::try_from(self.interval) else { return false };
        height > 0 && height.checked_rem(interval) == Some(0)
    }
}
