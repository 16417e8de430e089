#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use alloy_primitives::B256;

use chain::generate::{genesis, GeneratedBlock};
use chain::memory::MemoryChain;
use chain::types::{BlockHeader, StateNode};
use sync::{
    Engine, HashOrNumber, MemoryStore, PeerHead, PeerId, Request, Response, SanityConsensus,
    SyncConfig, SyncTransport,
};

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Sent {
    pub peer: PeerId,
    pub request_id: u64,
    pub request: Request,
}

#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Sent>>,
    history: Mutex<Vec<Sent>>,
    disconnected: Mutex<Vec<PeerId>>,
    /// Peers for which send_request fails.
    unreachable: Mutex<HashSet<PeerId>>,
}

impl MockTransport {
    /// Requests sent since the last call.
    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Every request ever sent.
    pub fn history(&self) -> Vec<Sent> {
        self.history.lock().unwrap().clone()
    }

    pub fn sent_to(&self, peer: &PeerId) -> Vec<Sent> {
        self.history().into_iter().filter(|s| s.peer == *peer).collect()
    }

    pub fn disconnected(&self) -> Vec<PeerId> {
        self.disconnected.lock().unwrap().clone()
    }

    pub fn set_unreachable(&self, peer: PeerId) {
        self.unreachable.lock().unwrap().insert(peer);
    }
}

impl SyncTransport for MockTransport {
    async fn send_request(&self, peer: &PeerId, request_id: u64, request: Request) -> bool {
        if self.unreachable.lock().unwrap().contains(peer) {
            return false;
        }
        let sent = Sent {
            peer: *peer,
            request_id,
            request,
        };
        self.history.lock().unwrap().push(sent.clone());
        self.sent.lock().unwrap().push(sent);
        true
    }

    async fn disconnect_peer(&self, peer: &PeerId) {
        self.disconnected.lock().unwrap().push(*peer);
    }
}

// ---------------------------------------------------------------------------
// Chains and peers
// ---------------------------------------------------------------------------

pub type TestEngine = Engine<MockTransport, MemoryStore, SanityConsensus>;

pub fn peer_id(n: u8) -> PeerId {
    let mut id = [0u8; 64];
    id[0] = n;
    id
}

/// Chain holding genesis plus `blocks`, with bodies and receipts.
pub fn chain_with(blocks: &[GeneratedBlock]) -> MemoryChain {
    let mut chain = MemoryChain::new(genesis());
    extend(&mut chain, blocks);
    chain
}

pub fn extend(chain: &mut MemoryChain, blocks: &[GeneratedBlock]) {
    for b in blocks {
        chain
            .insert(
                b.block.header.clone(),
                Some(b.block.body.clone()),
                Some(b.receipts.clone()),
            )
            .unwrap();
    }
}

pub fn with_state(mut chain: MemoryChain, nodes: &[StateNode]) -> MemoryChain {
    for node in nodes {
        chain.insert_state_node(node.clone());
    }
    chain
}

pub fn head_of(chain: &MemoryChain) -> PeerHead {
    let head = chain.head();
    PeerHead {
        hash: head.hash,
        number: head.number,
        td: head.td,
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        auto_sync: false,
        ..SyncConfig::default()
    }
}

pub fn setup(config: SyncConfig, local: MemoryChain) -> (TestEngine, Arc<MockTransport>, Arc<MemoryStore>) {
    let transport = Arc::new(MockTransport::default());
    let store = Arc::new(MemoryStore::new(local));
    let engine = Engine::new(
        config,
        Arc::clone(&transport),
        Arc::clone(&store),
        Arc::new(SanityConsensus),
    );
    (engine, transport, store)
}

/// Answer `request` from `chain` the way an honest peer would.
pub fn answer(chain: &MemoryChain, request: &Request) -> Response {
    match request {
        Request::Headers {
            origin,
            amount,
            skip,
            reverse,
        } => {
            let start = match origin {
                HashOrNumber::Number(n) => Some(*n),
                HashOrNumber::Hash(h) => chain.header(h).map(|h| h.number),
            };
            let mut headers = Vec::new();
            if let Some(start) = start {
                let step = skip + 1;
                for i in 0..*amount {
                    let n = if *reverse {
                        match start.checked_sub(i * step) {
                            Some(n) => n,
                            None => break,
                        }
                    } else {
                        start + i * step
                    };
                    match chain.header_by_number(n) {
                        Some(h) => headers.push(h.clone()),
                        None => break,
                    }
                }
            }
            Response::Headers(headers)
        }
        Request::Bodies(hashes) => Response::Bodies(
            hashes
                .iter()
                .map_while(|h| chain.body(h).cloned())
                .collect(),
        ),
        Request::Receipts(hashes) => Response::Receipts(
            hashes
                .iter()
                .map_while(|h| chain.receipts(h).cloned())
                .collect(),
        ),
        Request::StateNodes(hashes) => Response::StateNodes(
            hashes
                .iter()
                .filter_map(|h| chain.state_node(h).cloned())
                .collect(),
        ),
    }
}

/// Highest block number a request touches, as far as `chain` can tell.
pub fn request_height(chain: &MemoryChain, request: &Request) -> u64 {
    match request {
        Request::Headers {
            origin: HashOrNumber::Number(n),
            amount,
            ..
        } => n + amount.saturating_sub(1),
        Request::Headers {
            origin: HashOrNumber::Hash(h),
            ..
        } => chain.header(h).map_or(0, |h| h.number),
        Request::Bodies(hashes) | Request::Receipts(hashes) => hashes
            .iter()
            .filter_map(|h| chain.header(h).map(|h| h.number))
            .max()
            .unwrap_or(0),
        Request::StateNodes(_) => 0,
    }
}

/// Peers serving from their own chain. Peers without a chain never answer.
#[derive(Default)]
pub struct Network {
    pub chains: HashMap<PeerId, MemoryChain>,
    /// Applied to every response before delivery.
    pub tamper: HashMap<PeerId, fn(&mut Response)>,
}

impl Network {
    pub fn serve(mut self, peer: PeerId, chain: MemoryChain) -> Self {
        self.chains.insert(peer, chain);
        self
    }

    pub fn respond(&self, sent: &Sent) -> Option<Response> {
        let chain = self.chains.get(&sent.peer)?;
        let mut response = answer(chain, &sent.request);
        if let Some(tamper) = self.tamper.get(&sent.peer) {
            tamper(&mut response);
        }
        Some(response)
    }
}

/// Answer requests until the engine stops sending. Requests to peers the
/// network cannot serve, or that `filter` declines, are dropped unanswered.
pub async fn pump_filtered(
    engine: &mut TestEngine,
    transport: &MockTransport,
    net: &Network,
    filter: impl Fn(&Sent) -> bool,
) -> usize {
    let mut answered = 0;
    for _ in 0..10_000 {
        let sent = transport.take_sent();
        if sent.is_empty() {
            break;
        }
        for s in sent {
            if !filter(&s) {
                continue;
            }
            if let Some(response) = net.respond(&s) {
                engine.on_response(s.peer, s.request_id, response).await;
                answered += 1;
            }
        }
    }
    answered
}

pub async fn pump(engine: &mut TestEngine, transport: &MockTransport, net: &Network) -> usize {
    pump_filtered(engine, transport, net, |_| true).await
}

/// Break the hash chain of a header response by altering its first header.
pub fn break_first_header(response: &mut Response) {
    if let Response::Headers(headers) = response {
        if headers.len() > 1 {
            let first: &mut BlockHeader = &mut headers[0];
            first.extra_data = b"forged".to_vec();
        }
    }
}

pub fn hashes(blocks: &[GeneratedBlock]) -> Vec<B256> {
    blocks.iter().map(|b| b.block.hash()).collect()
}
