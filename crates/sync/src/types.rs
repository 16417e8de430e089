use alloy_primitives::{B256, U256};
use chain::types::{BlockBody, BlockHeader, Receipt, StateNode};

/// Node id of a remote peer.
pub type PeerId = [u8; 64];

/// Short hex prefix of a peer id for log fields.
pub fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..8])
}

/// The kinds of data fetched from peers. Throughput and idleness are tracked
/// separately for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Header,
    Body,
    Receipt,
    State,
}

impl DataKind {
    pub const ALL: [DataKind; 4] = [
        DataKind::Header,
        DataKind::Body,
        DataKind::Receipt,
        DataKind::State,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Header => "header",
            DataKind::Body => "body",
            DataKind::Receipt => "receipt",
            DataKind::State => "state",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            DataKind::Header => 0,
            DataKind::Body => 1,
            DataKind::Receipt => 2,
            DataKind::State => 3,
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(B256),
    Number(u64),
}

/// A request handed to the transport. The wire encoding is the transport's
/// business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Headers {
        origin: HashOrNumber,
        amount: u64,
        skip: u64,
        reverse: bool,
    },
    Bodies(Vec<B256>),
    Receipts(Vec<B256>),
    StateNodes(Vec<B256>),
}

impl Request {
    pub fn kind(&self) -> DataKind {
        match self {
            Request::Headers { .. } => DataKind::Header,
            Request::Bodies(_) => DataKind::Body,
            Request::Receipts(_) => DataKind::Receipt,
            Request::StateNodes(_) => DataKind::State,
        }
    }

    /// Single header by number, used for ancestor queries.
    pub fn header_at(number: u64) -> Self {
        Request::Headers {
            origin: HashOrNumber::Number(number),
            amount: 1,
            skip: 0,
            reverse: false,
        }
    }

    pub fn header_by_hash(hash: B256) -> Self {
        Request::Headers {
            origin: HashOrNumber::Hash(hash),
            amount: 1,
            skip: 0,
            reverse: false,
        }
    }
}

/// A peer's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Headers(Vec<BlockHeader>),
    Bodies(Vec<BlockBody>),
    Receipts(Vec<Vec<Receipt>>),
    StateNodes(Vec<StateNode>),
}

impl Response {
    pub fn kind(&self) -> DataKind {
        match self {
            Response::Headers(_) => DataKind::Header,
            Response::Bodies(_) => DataKind::Body,
            Response::Receipts(_) => DataKind::Receipt,
            Response::StateNodes(_) => DataKind::State,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Response::Headers(v) => v.len(),
            Response::Bodies(v) => v.len(),
            Response::Receipts(v) => v.len(),
            Response::StateNodes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Head advertised by a peer at handshake or in a later announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: B256,
    pub number: u64,
    pub td: U256,
}
