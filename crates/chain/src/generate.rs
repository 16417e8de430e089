//! Deterministic chain and state generators for tests and the simulator.

use alloy_primitives::{B256, U256};

use crate::types::{empty_list_hash, receipts_root, Block, BlockBody, BlockHeader, Receipt, StateNode};

pub const GENESIS_GAS_LIMIT: u64 = 5_000_000;
pub const BLOCK_DIFFICULTY: u64 = 131_072;
pub const BLOCK_TIME: u64 = 14;
const TX_GAS: u64 = 21_000;

/// A generated block together with the receipts its header commits to.
#[derive(Debug, Clone)]
pub struct GeneratedBlock {
    pub block: Block,
    pub receipts: Vec<Receipt>,
}

pub fn genesis() -> BlockHeader {
    genesis_with_state(B256::ZERO)
}

pub fn genesis_with_state(state_root: B256) -> BlockHeader {
    BlockHeader {
        parent_hash: B256::ZERO,
        uncle_hash: empty_list_hash(),
        state_root,
        transactions_root: empty_list_hash(),
        receipts_root: empty_list_hash(),
        difficulty: U256::from(BLOCK_DIFFICULTY),
        number: 0,
        gas_limit: GENESIS_GAS_LIMIT,
        gas_used: 0,
        timestamp: 1_500_000_000,
        extra_data: Vec::new(),
    }
}

/// Build `count` blocks on top of `parent`.
///
/// `seed` goes into every header's extra data, so two calls with different
/// seeds from the same parent produce competing forks. Every third block is
/// empty so the empty-body shortcut is exercised.
pub fn generate_blocks(
    parent: &BlockHeader,
    count: u64,
    seed: u8,
    state_root: B256,
) -> Vec<GeneratedBlock> {
    let mut out = Vec::with_capacity(count as usize);
    let mut parent = parent.clone();
    for _ in 0..count {
        let number = parent.number + 1;
        let (body, receipts) = if number % 3 == 0 {
            (BlockBody::default(), Vec::new())
        } else {
            let mut tx = vec![seed];
            tx.extend_from_slice(&number.to_be_bytes());
            let receipt = Receipt {
                success: true,
                cumulative_gas_used: TX_GAS,
                logs: vec![tx.clone()],
            };
            (
                BlockBody {
                    transactions: vec![tx],
                    uncles: Vec::new(),
                },
                vec![receipt],
            )
        };
        let header = BlockHeader {
            parent_hash: parent.hash(),
            uncle_hash: body.uncle_hash(),
            state_root,
            transactions_root: body.transactions_root(),
            receipts_root: receipts_root(&receipts),
            difficulty: U256::from(BLOCK_DIFFICULTY),
            number,
            gas_limit: parent.gas_limit,
            gas_used: TX_GAS * body.transactions.len() as u64,
            timestamp: parent.timestamp + BLOCK_TIME,
            extra_data: vec![seed],
        };
        parent = header.clone();
        out.push(GeneratedBlock {
            block: Block { header, body },
            receipts,
        });
    }
    out
}

/// Build a small state trie and return its root hash and every node.
///
/// Two branches share their middle leaves, so a correct state sync must
/// fetch each shared node only once.
pub fn generate_state(seed: u8, leaves: usize) -> (B256, Vec<StateNode>) {
    let leaves: Vec<StateNode> = (0..leaves.max(2))
        .map(|i| StateNode {
            data: format!("account-{seed}-{i}").into_bytes(),
            children: Vec::new(),
        })
        .collect();
    let hashes: Vec<B256> = leaves.iter().map(StateNode::hash).collect();
    let mid = hashes.len() / 2;
    let left = StateNode {
        data: vec![seed, 0],
        children: hashes[..=mid].to_vec(),
    };
    let right = StateNode {
        data: vec![seed, 1],
        children: hashes[mid.saturating_sub(1)..].to_vec(),
    };
    let root = StateNode {
        data: vec![seed],
        children: vec![left.hash(), right.hash()],
    };
    let root_hash = root.hash();

    let mut nodes = vec![root, left, right];
    nodes.extend(leaves);
    (root_hash, nodes)
}
