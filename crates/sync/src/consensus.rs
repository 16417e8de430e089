use chain::types::BlockHeader;
use thiserror::Error;

/// Minimum gas limit a header may declare.
pub const MIN_GAS_LIMIT: u64 = 5000;
/// Maximum gas limit change per block, as a divisor of the parent's limit.
pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
pub const MAX_EXTRA_DATA: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("number {got} does not follow parent {parent}")]
    Number { parent: u64, got: u64 },
    #[error("parent hash does not match parent")]
    ParentHash,
    #[error("timestamp {got} not after parent timestamp {parent}")]
    Timestamp { parent: u64, got: u64 },
    #[error("gas limit {got} out of range (parent {parent})")]
    GasLimit { parent: u64, got: u64 },
    #[error("gas used {used} exceeds gas limit {limit}")]
    GasUsed { used: u64, limit: u64 },
    #[error("extra data is {0} bytes")]
    ExtraData(usize),
    #[error("{0}")]
    Other(String),
}

/// Header validation. Seal checks live behind this interface.
pub trait Consensus: Send + Sync {
    fn validate_header(&self, header: &BlockHeader, parent: &BlockHeader)
        -> Result<(), ConsensusError>;
}

/// Structural checks only: linkage, timestamp, gas limit bounds, gas used and
/// extra data size. No difficulty or seal verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SanityConsensus;

impl Consensus for SanityConsensus {
    fn validate_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), ConsensusError> {
        if header.number != parent.number + 1 {
            return Err(ConsensusError::Number {
                parent: parent.number,
                got: header.number,
            });
        }
        if header.parent_hash != parent.hash() {
            return Err(ConsensusError::ParentHash);
        }
        if header.timestamp <= parent.timestamp {
            return Err(ConsensusError::Timestamp {
                parent: parent.timestamp,
                got: header.timestamp,
            });
        }
        validate_sanity(header, MAX_EXTRA_DATA)?;
        let diff = header.gas_limit.abs_diff(parent.gas_limit);
        if diff >= parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR {
            return Err(ConsensusError::GasLimit {
                parent: parent.gas_limit,
                got: header.gas_limit,
            });
        }
        Ok(())
    }
}

/// Checks that need no parent: gas used against gas limit, minimum gas limit
/// and extra data size.
pub fn validate_sanity(header: &BlockHeader, max_extra_data: usize) -> Result<(), ConsensusError> {
    if header.gas_limit < MIN_GAS_LIMIT {
        return Err(ConsensusError::GasLimit {
            parent: 0,
            got: header.gas_limit,
        });
    }
    if header.gas_used > header.gas_limit {
        return Err(ConsensusError::GasUsed {
            used: header.gas_used,
            limit: header.gas_limit,
        });
    }
    if header.extra_data.len() > max_extra_data {
        return Err(ConsensusError::ExtraData(header.extra_data.len()));
    }
    Ok(())
}
