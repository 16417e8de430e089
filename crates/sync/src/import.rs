use std::collections::{HashSet, VecDeque};

use alloy_primitives::B256;
use chain::types::ChainHead;
use tracing::debug;

use crate::store::{ChainStore, ImportMode, StoreError, SyncedBlock};

/// Size of the seen set before it is rotated.
const SEEN_BLOCKS_CAP: usize = 10_000;

/// Failed imports remembered independently of the seen set. The store has
/// no record of these, so forgetting one would let it be retried.
const REJECTED_BLOCKS_CAP: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(ChainHead),
    /// The block was already handed to the store.
    Known,
}

/// The single import path shared by the downloader and the announcement
/// fetcher. A hash reaches the store at most once, whether the attempt
/// succeeded or not.
#[derive(Default)]
pub struct Importer {
    /// Double-buffered: when `seen` exceeds [`SEEN_BLOCKS_CAP`] it is rotated
    /// into `seen_prev` instead of being cleared.
    seen: HashSet<B256>,
    seen_prev: HashSet<B256>,
    /// Hashes the store refused, oldest first.
    rejected: HashSet<B256>,
    rejected_order: VecDeque<B256>,
}

impl Importer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seen(&self, hash: &B256) -> bool {
        self.seen.contains(hash) || self.seen_prev.contains(hash) || self.rejected.contains(hash)
    }

    pub fn is_rejected(&self, hash: &B256) -> bool {
        self.rejected.contains(hash)
    }

    fn mark_rejected(&mut self, hash: B256) {
        if !self.rejected.insert(hash) {
            return;
        }
        self.rejected_order.push_back(hash);
        if self.rejected_order.len() > REJECTED_BLOCKS_CAP {
            if let Some(oldest) = self.rejected_order.pop_front() {
                self.rejected.remove(&oldest);
            }
        }
    }

    fn mark_seen(&mut self, hash: B256) {
        if self.seen.len() >= SEEN_BLOCKS_CAP {
            self.seen_prev = std::mem::take(&mut self.seen);
        }
        self.seen.insert(hash);
    }

    pub fn import<S: ChainStore + ?Sized>(
        &mut self,
        store: &S,
        block: &SyncedBlock,
        mode: ImportMode,
    ) -> Result<ImportOutcome, StoreError> {
        if self.is_seen(&block.hash) || store.has_block(&block.hash) {
            debug!(number = block.number(), hash = %block.hash, "skipping known block");
            return Ok(ImportOutcome::Known);
        }
        self.mark_seen(block.hash);
        match store.import_block(block, mode) {
            Ok(head) => Ok(ImportOutcome::Imported(head)),
            Err(e) => {
                self.mark_rejected(block.hash);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chain::generate::{generate_blocks, genesis};
    use chain::memory::MemoryChain;

    #[test]
    fn second_import_is_known_even_after_failure() {
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 2, 1, B256::ZERO);
        let block = SyncedBlock {
            header: blocks[0].block.header.clone(),
            hash: blocks[0].block.hash(),
            body: Some(blocks[0].block.body.clone()),
            receipts: None,
        };
        let mut importer = Importer::new();
        assert!(matches!(
            importer.import(&store, &block, ImportMode::Execute),
            Ok(ImportOutcome::Imported(_))
        ));
        assert_eq!(
            importer.import(&store, &block, ImportMode::Execute).unwrap(),
            ImportOutcome::Known
        );

        store.reject(blocks[1].block.hash());
        let bad = SyncedBlock {
            header: blocks[1].block.header.clone(),
            hash: blocks[1].block.hash(),
            body: Some(blocks[1].block.body.clone()),
            receipts: None,
        };
        assert!(importer.import(&store, &bad, ImportMode::Execute).is_err());
        assert_eq!(
            importer.import(&store, &bad, ImportMode::Execute).unwrap(),
            ImportOutcome::Known
        );
        assert_eq!(store.import_log().len(), 2);
    }

    #[test]
    fn seen_set_rotates() {
        let mut importer = Importer::new();
        for i in 0..SEEN_BLOCKS_CAP as u64 + 1 {
            importer.mark_seen(B256::left_padding_from(&i.to_be_bytes()));
        }
        assert_eq!(importer.seen.len(), 1);
        assert!(importer.is_seen(&B256::left_padding_from(&0u64.to_be_bytes())));
    }

    #[test]
    fn rejected_block_outlives_seen_rotation() {
        let g = genesis();
        let store = MemoryStore::new(MemoryChain::new(g.clone()));
        let blocks = generate_blocks(&g, 1, 1, B256::ZERO);
        let bad = SyncedBlock {
            header: blocks[0].block.header.clone(),
            hash: blocks[0].block.hash(),
            body: Some(blocks[0].block.body.clone()),
            receipts: None,
        };
        store.reject(bad.hash);

        let mut importer = Importer::new();
        assert!(importer.import(&store, &bad, ImportMode::Execute).is_err());
        // Push the failed hash out of both halves of the seen set.
        for i in 0..2 * SEEN_BLOCKS_CAP as u64 + 1 {
            importer.mark_seen(B256::left_padding_from(&i.to_be_bytes()));
        }
        assert!(!importer.seen.contains(&bad.hash));
        assert!(!importer.seen_prev.contains(&bad.hash));

        assert!(importer.is_rejected(&bad.hash));
        assert_eq!(
            importer.import(&store, &bad, ImportMode::Execute).unwrap(),
            ImportOutcome::Known
        );
        assert_eq!(store.import_log().len(), 1);
    }

    #[test]
    fn rejected_set_is_bounded() {
        let mut importer = Importer::new();
        for i in 0..REJECTED_BLOCKS_CAP as u64 + 1 {
            importer.mark_rejected(B256::left_padding_from(&i.to_be_bytes()));
        }
        assert_eq!(importer.rejected.len(), REJECTED_BLOCKS_CAP);
        assert!(!importer.is_rejected(&B256::left_padding_from(&0u64.to_be_bytes())));
        assert!(importer.is_rejected(&B256::left_padding_from(&1u64.to_be_bytes())));
    }
}
