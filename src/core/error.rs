use crate::core::params::ParamsError;
use crate::storage::StorageError;

/// The candidate block itself is invalid. Never persisted, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("block hash does not meet its claimed target")]
    BadProofOfWork,
    #[error("difficulty mismatch (expected {expected:#010x}, got {got:#010x})")]
    BadDifficulty { expected: u32, got: u32 },
    #[error("difficulty transition at height {height} but the chain does not reach back a full interval")]
    MissingHistory { height: i32 },
    #[error("compact target {bits:#010x} is zero, negative or above the proof-of-work limit")]
    InvalidDifficultyTarget { bits: u32 },
}

/// Why `BlockChain::add` refused or failed to apply a block.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid network parameters: {0}")]
    Params(#[from] ParamsError),
}

impl ChainError {
    /// Verification failures are the sender's fault; storage failures are ours.
    pub fn is_verification(&self) -> bool {
        matches!(self, ChainError::Verification(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_verification() {
        assert!(ChainError::from(VerificationError::BadProofOfWork).is_verification());
        assert!(!ChainError::from(StorageError::MissingTip).is_verification());
        assert!(!ChainError::from(ParamsError::ZeroInterval).is_verification());
    }
}
