use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use crate::types::{short_id, DataKind, PeerHead, PeerId};

/// A connected peer as seen by the sync engine.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub head: PeerHead,
    /// Items per second, one estimate per data kind.
    throughput: [f64; 4],
    inflight: [usize; 4],
    failures: u32,
}

impl Peer {
    pub fn throughput(&self, kind: DataKind) -> f64 {
        self.throughput[kind.index()]
    }

    pub fn inflight(&self, kind: DataKind) -> usize {
        self.inflight[kind.index()]
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Usable peers and their per-kind statistics.
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    impact: f64,
}

impl PeerRegistry {
    pub fn new(throughput_impact: f64) -> Self {
        Self {
            peers: HashMap::new(),
            impact: throughput_impact,
        }
    }

    /// Add a peer. Returns `false` (and changes nothing) if it is already
    /// registered. The new peer starts from the mean estimate of the others.
    pub fn register(&mut self, id: PeerId, head: PeerHead) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        let mut throughput = [0.0; 4];
        if !self.peers.is_empty() {
            let n = self.peers.len() as f64;
            for kind in DataKind::ALL {
                let sum: f64 = self.peers.values().map(|p| p.throughput(kind)).sum();
                throughput[kind.index()] = sum / n;
            }
        }
        self.peers.insert(
            id,
            Peer {
                id,
                head,
                throughput,
                inflight: [0; 4],
                failures: 0,
            },
        );
        true
    }

    pub fn unregister(&mut self, id: &PeerId) -> Option<Peer> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Raise a peer's advertised head. Lighter heads are ignored.
    pub fn update_head(&mut self, id: &PeerId, head: PeerHead) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if head.td > peer.head.td => {
                peer.head = head;
                true
            }
            _ => false,
        }
    }

    /// Heaviest peer not in `exclude`. Ties go to the lower id.
    pub fn best(&self, exclude: &HashSet<PeerId>) -> Option<&Peer> {
        self.peers
            .values()
            .filter(|p| !exclude.contains(&p.id))
            .max_by(|a, b| a.head.td.cmp(&b.head.td).then_with(|| b.id.cmp(&a.id)))
    }

    /// Peer ids ordered by throughput for `kind`, fastest first, ties by id.
    pub fn snapshot(&self, kind: DataKind) -> Vec<PeerId> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by(|a, b| {
            b.throughput(kind)
                .total_cmp(&a.throughput(kind))
                .then_with(|| a.id.cmp(&b.id))
        });
        peers.into_iter().map(|p| p.id).collect()
    }

    pub fn is_idle(&self, id: &PeerId, kind: DataKind, cap: usize) -> bool {
        self.peers
            .get(id)
            .is_some_and(|p| p.inflight(kind) < cap)
    }

    pub fn mark_busy(&mut self, id: &PeerId, kind: DataKind) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.inflight[kind.index()] += 1;
        }
    }

    pub fn mark_idle(&mut self, id: &PeerId, kind: DataKind) {
        if let Some(peer) = self.peers.get_mut(id) {
            let slot = &mut peer.inflight[kind.index()];
            *slot = slot.saturating_sub(1);
        }
    }

    /// Fold a successful delivery into the throughput estimate and clear the
    /// failure streak.
    pub fn record_delivery(&mut self, id: &PeerId, kind: DataKind, items: usize, elapsed: Duration) {
        let impact = self.impact;
        if let Some(peer) = self.peers.get_mut(id) {
            let measured = items as f64 / elapsed.as_secs_f64().max(0.001);
            let slot = &mut peer.throughput[kind.index()];
            *slot = (1.0 - impact) * *slot + impact * measured;
            peer.failures = 0;
        }
    }

    /// Count a timeout or protocol violation as a zero-throughput measurement.
    /// Returns the peer's consecutive failure count.
    pub fn record_failure(&mut self, id: &PeerId, kind: DataKind) -> u32 {
        let impact = self.impact;
        match self.peers.get_mut(id) {
            Some(peer) => {
                let slot = &mut peer.throughput[kind.index()];
                *slot *= 1.0 - impact;
                peer.failures += 1;
                debug!(
                    peer = %short_id(id),
                    kind = %kind,
                    failures = peer.failures,
                    "peer penalised"
                );
                peer.failures
            }
            None => 0,
        }
    }
}
