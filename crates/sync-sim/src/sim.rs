//! Simulated swarm: each peer is a task serving requests from a shared chain
//! according to its behaviour, and answering through the engine's event
//! channel like a real network session would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use alloy_primitives::B256;
use chain::generate::{generate_blocks, generate_state, genesis};
use chain::memory::{MemoryChain, MemoryChainError};
use chain::types::ChainHead;
use sync::types::short_id;
use sync::{
    Engine, EngineEvent, HashOrNumber, MemoryStore, MetricsSnapshot, PeerHead, PeerId, Request,
    Response, SanityConsensus, SyncMode, SyncTransport,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout_at, Duration};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;

const STATE_LEAVES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    Slow(Duration),
    Silent,
    /// Serves header batches whose hash chain is broken.
    Lying,
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error("chain generation failed: {0}")]
    Chain(#[from] MemoryChainError),
    #[error("engine event channel closed")]
    ChannelClosed,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct SimReport {
    pub synced: bool,
    pub head: ChainHead,
    pub target: ChainHead,
    pub elapsed: Duration,
    pub metrics: MetricsSnapshot,
    pub last_error: Option<String>,
}

type Inbox = mpsc::UnboundedSender<(u64, Request)>;

/// Transport that hands requests to the peer tasks.
#[derive(Default)]
pub struct SimTransport {
    peers: Mutex<HashMap<PeerId, Inbox>>,
}

impl SimTransport {
    fn attach(&self, peer: PeerId, inbox: Inbox) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer, inbox);
        }
    }
}

impl SyncTransport for SimTransport {
    async fn send_request(&self, peer: &PeerId, request_id: u64, request: Request) -> bool {
        match self.peers.lock() {
            Ok(peers) => peers
                .get(peer)
                .is_some_and(|inbox| inbox.send((request_id, request)).is_ok()),
            Err(_) => false,
        }
    }

    async fn disconnect_peer(&self, peer: &PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            if peers.remove(peer).is_some() {
                info!(peer = %short_id(peer), "simulated peer disconnected");
            }
        }
    }
}

/// Answer a request from `chain` as an honest node would.
pub fn serve(chain: &MemoryChain, request: &Request) -> Response {
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
            let Some(start) = start else {
                return Response::Headers(Vec::new());
            };
            let step = skip + 1;
            let headers = (0..*amount)
                .map_while(|i| {
                    let n = if *reverse {
                        start.checked_sub(i * step)?
                    } else {
                        start + i * step
                    };
                    chain.header_by_number(n).cloned()
                })
                .collect();
            Response::Headers(headers)
        }
        Request::Bodies(hashes) => {
            Response::Bodies(hashes.iter().map_while(|h| chain.body(h).cloned()).collect())
        }
        Request::Receipts(hashes) => {
            Response::Receipts(hashes.iter().map_while(|h| chain.receipts(h).cloned()).collect())
        }
        Request::StateNodes(hashes) => Response::StateNodes(
            hashes
                .iter()
                .filter_map(|h| chain.state_node(h).cloned())
                .collect(),
        ),
    }
}

fn respond(chain: &MemoryChain, request: &Request, behavior: Behavior) -> Response {
    let mut response = serve(chain, request);
    if behavior == Behavior::Lying {
        if let Response::Headers(headers) = &mut response {
            let len = headers.len();
            if let Some(last) = headers.last_mut().filter(|_| len > 1) {
                last.parent_hash = B256::repeat_byte(0xba);
            }
        }
    }
    response
}

async fn run_peer(
    id: PeerId,
    behavior: Behavior,
    chain: Arc<MemoryChain>,
    mut inbox: mpsc::UnboundedReceiver<(u64, Request)>,
    events: mpsc::Sender<EngineEvent>,
) {
    while let Some((request_id, request)) = inbox.recv().await {
        let delay = match behavior {
            Behavior::Silent => continue,
            Behavior::Slow(delay) => Some(delay),
            Behavior::Honest | Behavior::Lying => None,
        };
        let response = respond(&chain, &request, behavior);
        let events = events.clone();
        // Answer off the receive loop so a slow peer can hold several requests.
        tokio::spawn(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            let _ = events
                .send(EngineEvent::Response {
                    peer: id,
                    request_id,
                    response,
                })
                .await;
        });
    }
    debug!(peer = %short_id(&id), "simulated peer stopped");
}

fn peer_id(n: usize) -> PeerId {
    let mut id = [0u8; 64];
    id[..8].copy_from_slice(&(n as u64).to_be_bytes());
    id
}

fn build_chain(config: &RuntimeConfig) -> Result<MemoryChain, SimError> {
    let (root, nodes) = match config.sync.mode {
        SyncMode::Fast => generate_state(config.seed, STATE_LEAVES),
        SyncMode::Full | SyncMode::Light => (B256::ZERO, Vec::new()),
    };
    let mut chain = MemoryChain::new(genesis());
    for b in generate_blocks(&genesis(), config.blocks, config.seed, root) {
        chain.insert(b.block.header, Some(b.block.body), Some(b.receipts))?;
    }
    for node in nodes {
        chain.insert_state_node(node);
    }
    Ok(chain)
}

pub async fn run(config: RuntimeConfig) -> Result<SimReport, SimError> {
    let remote = Arc::new(build_chain(&config)?);
    let target = remote.head();
    info!(
        blocks = config.blocks,
        mode = ?config.sync.mode,
        target = %target.hash,
        "simulated chain generated"
    );

    let store = Arc::new(MemoryStore::new(MemoryChain::new(genesis())));
    let transport = Arc::new(SimTransport::default());
    let engine = Engine::new(
        config.sync.clone(),
        Arc::clone(&transport),
        Arc::clone(&store),
        Arc::new(SanityConsensus),
    );
    let events = engine.sender();

    let mut behaviors = Vec::new();
    behaviors.extend(std::iter::repeat(Behavior::Honest).take(config.honest_peers));
    behaviors.extend(std::iter::repeat(Behavior::Slow(config.slow_delay)).take(config.slow_peers));
    behaviors.extend(std::iter::repeat(Behavior::Silent).take(config.silent_peers));
    behaviors.extend(std::iter::repeat(Behavior::Lying).take(config.lying_peers));

    let mut peers = Vec::with_capacity(behaviors.len());
    for (i, behavior) in behaviors.into_iter().enumerate() {
        let id = peer_id(i + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach(id, tx);
        tokio::spawn(run_peer(id, behavior, Arc::clone(&remote), rx, events.clone()));
        debug!(peer = %short_id(&id), ?behavior, "simulated peer spawned");
        peers.push(id);
    }

    let started = Instant::now();
    let handle = engine.start();
    let head = PeerHead {
        hash: target.hash,
        number: target.number,
        td: target.td,
    };
    for peer in &peers {
        events
            .send(EngineEvent::PeerConnected { peer: *peer, head })
            .await
            .map_err(|_| SimError::ChannelClosed)?;
    }
    if !config.sync.auto_sync {
        handle.start_sync(None).await;
    }

    let mut status = handle.subscribe();
    let deadline = tokio::time::Instant::now() + config.deadline;
    let synced = loop {
        if status.borrow().head.hash == target.hash {
            break true;
        }
        match timeout_at(deadline, status.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => break false,
        }
    };
    if !synced {
        warn!(deadline = ?config.deadline, "target not reached before the deadline");
    }

    let last_error = handle.status().last_error;
    let metrics = handle.metrics();
    handle.stop().await;

    Ok(SimReport {
        synced,
        head: store.with_chain(|c| c.head()),
        target,
        elapsed: started.elapsed(),
        metrics,
        last_error,
    })
}
