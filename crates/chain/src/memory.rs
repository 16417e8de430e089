use std::collections::{BTreeMap, HashMap};

use alloy_primitives::{B256, U256};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{BlockBody, BlockHeader, ChainHead, Receipt, StateNode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryChainError {
    #[error("block {0} already known")]
    Known(B256),
    #[error("unknown parent {parent} for block {number}")]
    UnknownParent { parent: B256, number: u64 },
    #[error("block number {got} does not follow parent number {parent}")]
    NumberMismatch { parent: u64, got: u64 },
}

/// In-memory block store with heaviest-chain head selection.
///
/// Keeps every inserted header (side chains included) together with its total
/// difficulty, and a number -> hash index of the canonical chain that is
/// rewritten on reorg.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    headers: HashMap<B256, BlockHeader>,
    bodies: HashMap<B256, BlockBody>,
    receipts: HashMap<B256, Vec<Receipt>>,
    tds: HashMap<B256, U256>,
    canonical: BTreeMap<u64, B256>,
    state: HashMap<B256, StateNode>,
    head: ChainHead,
}

impl MemoryChain {
    /// Create a chain containing only `genesis`.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let td = genesis.difficulty;
        let head = ChainHead {
            hash,
            number: genesis.number,
            td,
        };
        let mut canonical = BTreeMap::new();
        canonical.insert(genesis.number, hash);
        let mut tds = HashMap::new();
        tds.insert(hash, td);
        let mut headers = HashMap::new();
        headers.insert(hash, genesis);
        Self {
            headers,
            bodies: HashMap::new(),
            receipts: HashMap::new(),
            tds,
            canonical,
            state: HashMap::new(),
            head,
        }
    }

    pub fn head(&self) -> ChainHead {
        self.head
    }

    /// Insert a block on top of a known parent. The head moves if the new
    /// block's total difficulty exceeds the current head's.
    pub fn insert(
        &mut self,
        header: BlockHeader,
        body: Option<BlockBody>,
        receipts: Option<Vec<Receipt>>,
    ) -> Result<ChainHead, MemoryChainError> {
        let hash = header.hash();
        if self.headers.contains_key(&hash) {
            return Err(MemoryChainError::Known(hash));
        }
        let parent = self
            .headers
            .get(&header.parent_hash)
            .ok_or(MemoryChainError::UnknownParent {
                parent: header.parent_hash,
                number: header.number,
            })?;
        if header.number != parent.number + 1 {
            return Err(MemoryChainError::NumberMismatch {
                parent: parent.number,
                got: header.number,
            });
        }
        let parent_td = self.tds.get(&header.parent_hash).copied().unwrap_or_default();
        let td = parent_td + header.difficulty;
        let number = header.number;

        self.tds.insert(hash, td);
        self.headers.insert(hash, header);
        if let Some(body) = body {
            self.bodies.insert(hash, body);
        }
        if let Some(receipts) = receipts {
            self.receipts.insert(hash, receipts);
        }

        if td > self.head.td {
            let previous = self.head;
            self.set_canonical(hash, number);
            self.head = ChainHead { hash, number, td };
            if previous.hash != self.headers[&hash].parent_hash {
                info!(
                    old = previous.number,
                    new = number,
                    hash = %hash,
                    "canonical chain reorganised"
                );
            }
        } else {
            debug!(number, hash = %hash, "stored side-chain block");
        }
        Ok(self.head)
    }

    fn set_canonical(&mut self, hash: B256, number: u64) {
        // Drop canonical entries above the new head, then walk back until the
        // index agrees with the new branch.
        self.canonical.split_off(&(number + 1));
        let mut cursor = Some((number, hash));
        while let Some((n, h)) = cursor {
            if self.canonical.get(&n) == Some(&h) {
                break;
            }
            self.canonical.insert(n, h);
            cursor = match (n.checked_sub(1), self.headers.get(&h)) {
                (Some(pn), Some(header)) => Some((pn, header.parent_hash)),
                _ => None,
            };
        }
    }

    pub fn has_block(&self, hash: &B256) -> bool {
        self.headers.contains_key(hash)
    }

    pub fn header(&self, hash: &B256) -> Option<&BlockHeader> {
        self.headers.get(hash)
    }

    pub fn canonical_hash(&self, number: u64) -> Option<B256> {
        self.canonical.get(&number).copied()
    }

    pub fn header_by_number(&self, number: u64) -> Option<&BlockHeader> {
        self.canonical_hash(number).and_then(|h| self.headers.get(&h))
    }

    pub fn body(&self, hash: &B256) -> Option<&BlockBody> {
        self.bodies.get(hash)
    }

    pub fn receipts(&self, hash: &B256) -> Option<&Vec<Receipt>> {
        self.receipts.get(hash)
    }

    pub fn td(&self, hash: &B256) -> Option<U256> {
        self.tds.get(hash).copied()
    }

    pub fn insert_state_node(&mut self, node: StateNode) -> B256 {
        let hash = node.hash();
        self.state.insert(hash, node);
        hash
    }

    pub fn state_node(&self, hash: &B256) -> Option<&StateNode> {
        self.state.get(hash)
    }

    pub fn has_state_node(&self, hash: &B256) -> bool {
        self.state.contains_key(hash)
    }

    pub fn state_len(&self) -> usize {
        self.state.len()
    }
}
