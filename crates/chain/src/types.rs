use alloy_primitives::{B256, U256};
use sha3::{Digest, Keccak256};

use crate::rlp;

/// Keccak-256 of arbitrary bytes.
pub fn keccak(data: &[u8]) -> B256 {
    B256::from_slice(&Keccak256::digest(data))
}

/// Hash of an RLP empty list. Headers use it as the transactions, uncles and
/// receipts commitment of a block with no contents.
pub fn empty_list_hash() -> B256 {
    keccak(&[0xc0])
}

/// Block header. Carries the commitments the sync engine checks bodies and
/// receipts against, plus the fields used for sanity validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// keccak256 of the RLP encoding.
    pub fn hash(&self) -> B256 {
        keccak(&self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        rlp::encode_list(&[
            rlp::encode_b256(&self.parent_hash),
            rlp::encode_b256(&self.uncle_hash),
            rlp::encode_b256(&self.state_root),
            rlp::encode_b256(&self.transactions_root),
            rlp::encode_b256(&self.receipts_root),
            rlp::encode_u256(&self.difficulty),
            rlp::encode_u64(self.number),
            rlp::encode_u64(self.gas_limit),
            rlp::encode_u64(self.gas_used),
            rlp::encode_u64(self.timestamp),
            rlp::encode_bytes(&self.extra_data),
        ])
    }

    /// True when the header commits to no transactions and no uncles, so the
    /// body can be reconstructed without asking anyone for it.
    pub fn has_empty_body(&self) -> bool {
        let empty = empty_list_hash();
        self.transactions_root == empty && self.uncle_hash == empty
    }

    pub fn has_empty_receipts(&self) -> bool {
        self.receipts_root == empty_list_hash()
    }
}

/// Transactions and uncles of a block. Transactions are opaque encoded bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn transactions_root(&self) -> B256 {
        keccak(&rlp::encode_bytes_list(&self.transactions))
    }

    pub fn uncle_hash(&self) -> B256 {
        let uncles: Vec<Vec<u8>> = self.uncles.iter().map(BlockHeader::rlp_encode).collect();
        keccak(&rlp::encode_list(&uncles))
    }

    /// Whether this body is the one `header` commits to.
    pub fn matches(&self, header: &BlockHeader) -> bool {
        self.transactions_root() == header.transactions_root
            && self.uncle_hash() == header.uncle_hash
    }
}

/// Execution receipt for a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub logs: Vec<Vec<u8>>,
}

impl Receipt {
    pub fn rlp_encode(&self) -> Vec<u8> {
        rlp::encode_list(&[
            rlp::encode_bool(self.success),
            rlp::encode_u64(self.cumulative_gas_used),
            rlp::encode_bytes_list(&self.logs),
        ])
    }
}

/// Commitment over a block's receipts, compared against `receipts_root`.
pub fn receipts_root(receipts: &[Receipt]) -> B256 {
    let encoded: Vec<Vec<u8>> = receipts.iter().map(Receipt::rlp_encode).collect();
    keccak(&rlp::encode_list(&encoded))
}

/// A node of the state trie. The hash commits to both the payload and the
/// child references, so a peer cannot graft foreign subtrees onto a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNode {
    pub data: Vec<u8>,
    pub children: Vec<B256>,
}

impl StateNode {
    pub fn hash(&self) -> B256 {
        let children: Vec<Vec<u8>> = self.children.iter().map(rlp::encode_b256).collect();
        keccak(&rlp::encode_list(&[
            rlp::encode_bytes(&self.data),
            rlp::encode_list(&children),
        ]))
    }
}

/// A complete block as carried by a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Head of a chain: hash, height and cumulative weight (total difficulty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub hash: B256,
    pub number: u64,
    pub td: U256,
}
