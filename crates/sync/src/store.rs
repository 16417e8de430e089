use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use alloy_primitives::B256;
use chain::memory::{MemoryChain, MemoryChainError};
use chain::types::{receipts_root, BlockBody, BlockHeader, ChainHead, Receipt, StateNode};
use thiserror::Error;
use tracing::debug;

/// How much of a block is committed on import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Header and body, executed on top of the parent's state.
    Execute,
    /// Header, body and receipts stored without execution.
    WithReceipts,
    /// Header only.
    HeaderOnly,
}

/// A block assembled by the fetch queue or the announcement fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedBlock {
    pub header: BlockHeader,
    pub hash: B256,
    pub body: Option<BlockBody>,
    pub receipts: Option<Vec<Receipt>>,
}

impl SyncedBlock {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block {0} missing body")]
    MissingBody(u64),
    #[error("block {0} missing receipts")]
    MissingReceipts(u64),
    #[error("block {number} state root {root} not available")]
    MissingState { number: u64, root: B256 },
    #[error("block {number} rejected: {reason}")]
    Rejected { number: u64, reason: String },
    #[error(transparent)]
    Chain(#[from] MemoryChainError),
}

/// Local chain storage as seen by the sync engine.
pub trait ChainStore: Send + Sync {
    fn current_head(&self) -> ChainHead;

    fn has_block(&self, hash: &B256) -> bool;

    fn header(&self, hash: &B256) -> Option<BlockHeader>;

    fn canonical_hash(&self, number: u64) -> Option<B256>;

    /// Commit a block whose parent is already stored.
    fn import_block(&self, block: &SyncedBlock, mode: ImportMode) -> Result<ChainHead, StoreError>;

    fn has_state_node(&self, hash: &B256) -> bool;

    fn insert_state_node(&self, node: StateNode) -> Result<(), StoreError>;
}

/// [`ChainStore`] over a [`MemoryChain`]. Keeps a log of every import call so
/// ordering and at-most-once import can be checked.
pub struct MemoryStore {
    chain: RwLock<MemoryChain>,
    imports: Mutex<Vec<(u64, B256, ImportMode)>>,
    rejected: Mutex<HashSet<B256>>,
}

impl MemoryStore {
    pub fn new(chain: MemoryChain) -> Self {
        Self {
            chain: RwLock::new(chain),
            imports: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Every import call so far: number, hash and mode, in call order.
    pub fn import_log(&self) -> Vec<(u64, B256, ImportMode)> {
        self.imports
            .lock()
            .map(|log| log.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Make a later import of `hash` fail as if execution rejected it.
    pub fn reject(&self, hash: B256) {
        if let Ok(mut set) = self.rejected.lock() {
            set.insert(hash);
        }
    }

    pub fn state_len(&self) -> usize {
        self.read(|c| c.state_len())
    }

    pub fn with_chain<R>(&self, f: impl FnOnce(&MemoryChain) -> R) -> R {
        self.read(f)
    }

    fn read<R>(&self, f: impl FnOnce(&MemoryChain) -> R) -> R {
        match self.chain.read() {
            Ok(chain) => f(&chain),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut MemoryChain) -> R) -> R {
        match self.chain.write() {
            Ok(mut chain) => f(&mut chain),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn check(&self, block: &SyncedBlock, mode: ImportMode) -> Result<(), StoreError> {
        let number = block.number();
        let rejected = self
            .rejected
            .lock()
            .map(|set| set.contains(&block.hash))
            .unwrap_or(false);
        if rejected {
            return Err(StoreError::Rejected {
                number,
                reason: "execution failed".into(),
            });
        }
        match mode {
            ImportMode::HeaderOnly => Ok(()),
            ImportMode::WithReceipts => {
                let receipts = block
                    .receipts
                    .as_ref()
                    .ok_or(StoreError::MissingReceipts(number))?;
                if block.body.is_none() {
                    return Err(StoreError::MissingBody(number));
                }
                if receipts_root(receipts) != block.header.receipts_root {
                    return Err(StoreError::Rejected {
                        number,
                        reason: "receipts root mismatch".into(),
                    });
                }
                Ok(())
            }
            ImportMode::Execute => {
                let body = block.body.as_ref().ok_or(StoreError::MissingBody(number))?;
                if !body.matches(&block.header) {
                    return Err(StoreError::Rejected {
                        number,
                        reason: "body does not match header".into(),
                    });
                }
                let root = block.header.state_root;
                if root != B256::ZERO && !self.has_state_node(&root) {
                    return Err(StoreError::MissingState { number, root });
                }
                Ok(())
            }
        }
    }
}

impl ChainStore for MemoryStore {
    fn current_head(&self) -> ChainHead {
        self.read(|c| c.head())
    }

    fn has_block(&self, hash: &B256) -> bool {
        self.read(|c| c.has_block(hash))
    }

    fn header(&self, hash: &B256) -> Option<BlockHeader> {
        self.read(|c| c.header(hash).cloned())
    }

    fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.read(|c| c.canonical_hash(number))
    }

    fn import_block(&self, block: &SyncedBlock, mode: ImportMode) -> Result<ChainHead, StoreError> {
        if let Ok(mut log) = self.imports.lock() {
            log.push((block.number(), block.hash, mode));
        }
        self.check(block, mode)?;
        let head = self.write(|c| {
            c.insert(block.header.clone(), block.body.clone(), block.receipts.clone())
        })?;
        debug!(number = block.number(), hash = %block.hash, "block stored");
        Ok(head)
    }

    fn has_state_node(&self, hash: &B256) -> bool {
        self.read(|c| c.has_state_node(hash))
    }

    fn insert_state_node(&self, node: StateNode) -> Result<(), StoreError> {
        self.write(|c| c.insert_state_node(node));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain::generate::{generate_blocks, generate_state, genesis};

    fn synced(b: &chain::generate::GeneratedBlock) -> SyncedBlock {
        SyncedBlock {
            header: b.block.header.clone(),
            hash: b.block.hash(),
            body: Some(b.block.body.clone()),
            receipts: Some(b.receipts.clone()),
        }
    }

    #[test]
    fn import_logs_every_call_and_advances_head() {
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 3, 1, B256::ZERO);
        for b in &blocks {
            store.import_block(&synced(b), ImportMode::Execute).unwrap();
        }
        assert_eq!(store.current_head().number, 3);
        let log = store.import_log();
        assert_eq!(log.iter().map(|e| e.0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn execute_requires_state_root() {
        let (root, nodes) = generate_state(1, 4);
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 1, 1, root);
        let err = store
            .import_block(&synced(&blocks[0]), ImportMode::Execute)
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingState { .. }));

        for node in nodes {
            store.insert_state_node(node).unwrap();
        }
        store
            .import_block(&synced(&blocks[0]), ImportMode::Execute)
            .unwrap();
    }

    #[test]
    fn receipts_mode_requires_receipts() {
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 1, 1, B256::ZERO);
        let mut block = synced(&blocks[0]);
        block.receipts = None;
        assert!(matches!(
            store.import_block(&block, ImportMode::WithReceipts),
            Err(StoreError::MissingReceipts(1))
        ));
        store.import_block(&block, ImportMode::HeaderOnly).unwrap();
    }

    #[test]
    fn rejected_block_fails() {
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 1, 1, B256::ZERO);
        store.reject(blocks[0].block.hash());
        assert!(matches!(
            store.import_block(&synced(&blocks[0]), ImportMode::Execute),
            Err(StoreError::Rejected { .. })
        ));
        assert!(!store.has_block(&blocks[0].block.hash()));
    }
}
