use std::time::Duration;

use thiserror::Error;

use crate::consensus::ConsensusError;
use crate::store::StoreError;

/// Why a sync session ended without reaching its target.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no common ancestor within {depth} blocks of local head {local}")]
    UnknownAncestor { local: u64, depth: u64 },
    #[error("no eligible peers")]
    NoPeers,
    #[error("no progress for {0:?}")]
    NoProgress(Duration),
    #[error("invalid chain from peer {peer}: {reason}")]
    InvalidChain { peer: String, reason: DeliveryError },
    #[error("import of block {number} failed: {source}")]
    ImportFailed {
        number: u64,
        #[source]
        source: StoreError,
    },
    #[error("block {number} failed validation: {source}")]
    InvalidBlock {
        number: u64,
        #[source]
        source: ConsensusError,
    },
}

/// Why the queue refused a response. The queue puts the task back before
/// returning any of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("empty response")]
    Empty,
    #[error("response has {got} items, {requested} requested")]
    TooMany { requested: usize, got: usize },
    #[error("expected block {expected}, got {got}")]
    OutOfSequence { expected: u64, got: u64 },
    #[error("broken hash chain at block {number}")]
    BrokenChain { number: u64 },
    #[error("block {number} does not match the target head")]
    TargetMismatch { number: u64 },
    #[error("invalid header {number}: {source}")]
    InvalidHeader {
        number: u64,
        #[source]
        source: ConsensusError,
    },
    #[error("headers around block {number} conflict with another peer's")]
    Disputed { number: u64 },
    #[error("item {index} does not match the request")]
    Mismatch { index: usize },
    #[error("response kind does not match the request")]
    WrongKind,
    #[error("unknown task {0}")]
    UnknownTask(u64),
}

impl DeliveryError {
    /// Whether the response shows the peer serving a chain other than the one
    /// being synced, as opposed to a merely bad answer.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            DeliveryError::BrokenChain { .. }
                | DeliveryError::TargetMismatch { .. }
                | DeliveryError::InvalidHeader { .. }
        )
    }
}
