use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::{short_id, DataKind, PeerId, Request};
use crate::SyncTransport;

/// Expired request ids remembered so late answers can be told apart from
/// unsolicited ones.
const EXPIRED_MEMORY: usize = 4096;

/// Which part of the engine a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Bulk fetch task owned by the queue.
    Task(u64),
    /// Ancestor search query.
    Ancestor,
    /// Announcement fetcher.
    Announcement,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub request_id: u64,
    pub peer: PeerId,
    pub kind: DataKind,
    pub origin: RequestOrigin,
    pub sent_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The request expired or was abandoned before the answer arrived.
    Stale,
    /// No request with this id was sent to this peer.
    Unsolicited,
}

/// Issues requests and tracks them until they are answered, expire or are
/// abandoned.
pub struct Dispatcher {
    next_request_id: u64,
    inflight: HashMap<u64, InFlight>,
    expired: HashSet<u64>,
    expired_order: VecDeque<u64>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_request_id: 1,
            inflight: HashMap::new(),
            expired: HashSet::new(),
            expired_order: VecDeque::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Hand `request` to the transport and start its deadline. Returns `None`
    /// if the transport could not queue it for the peer.
    pub async fn send<T: SyncTransport + ?Sized>(
        &mut self,
        transport: &T,
        peer: &PeerId,
        request: Request,
        origin: RequestOrigin,
        timeout: Duration,
    ) -> Option<u64> {
        let request_id = self.next_id();
        let kind = request.kind();
        if !transport.send_request(peer, request_id, request).await {
            debug!(peer = %short_id(peer), request_id, "send_request failed");
            return None;
        }
        let sent_at = Instant::now();
        self.inflight.insert(
            request_id,
            InFlight {
                request_id,
                peer: *peer,
                kind,
                origin,
                sent_at,
                deadline: sent_at + timeout,
            },
        );
        Some(request_id)
    }

    /// Match an answer to its request.
    pub fn take(&mut self, peer: &PeerId, request_id: u64) -> Result<InFlight, Rejection> {
        match self.inflight.get(&request_id) {
            Some(req) if req.peer == *peer => {
                self.inflight.remove(&request_id).ok_or(Rejection::Unsolicited)
            }
            Some(_) => Err(Rejection::Unsolicited),
            None if self.expired.remove(&request_id) => Err(Rejection::Stale),
            None => Err(Rejection::Unsolicited),
        }
    }

    /// Remove and return every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<InFlight> {
        let ids: Vec<u64> = self
            .inflight
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.request_id)
            .collect();
        self.retire(ids)
    }

    /// Forget every request sent to `peer`; its answers are now stale.
    pub fn release_peer(&mut self, peer: &PeerId) -> Vec<InFlight> {
        let ids: Vec<u64> = self
            .inflight
            .values()
            .filter(|r| r.peer == *peer)
            .map(|r| r.request_id)
            .collect();
        self.retire(ids)
    }

    /// Forget every request matching `pred`; their answers are now stale.
    pub fn abandon(&mut self, pred: impl Fn(&InFlight) -> bool) -> Vec<InFlight> {
        let ids: Vec<u64> = self
            .inflight
            .values()
            .filter(|r| pred(r))
            .map(|r| r.request_id)
            .collect();
        self.retire(ids)
    }

    fn retire(&mut self, mut ids: Vec<u64>) -> Vec<InFlight> {
        ids.sort_unstable();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(req) = self.inflight.remove(&id) {
                self.remember_expired(id);
                out.push(req);
            }
        }
        out
    }

    fn remember_expired(&mut self, id: u64) {
        if self.expired.insert(id) {
            self.expired_order.push_back(id);
        }
        while self.expired_order.len() > EXPIRED_MEMORY {
            if let Some(old) = self.expired_order.pop_front() {
                self.expired.remove(&old);
            }
        }
    }

    pub fn get(&self, request_id: u64) -> Option<&InFlight> {
        self.inflight.get(&request_id)
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn count_for(&self, pred: impl Fn(&InFlight) -> bool) -> usize {
        self.inflight.values().filter(|r| pred(r)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<(PeerId, u64, Request)>>>,
        refuse: bool,
    }

    impl SyncTransport for RecordingTransport {
        async fn send_request(&self, peer: &PeerId, request_id: u64, request: Request) -> bool {
            if self.refuse {
                return false;
            }
            self.sent.lock().unwrap().push((*peer, request_id, request));
            true
        }

        async fn disconnect_peer(&self, _peer: &PeerId) {}
    }

    const A: PeerId = [1; 64];
    const B: PeerId = [2; 64];

    #[tokio::test]
    async fn answer_from_right_peer_is_taken_once() {
        let transport = RecordingTransport::default();
        let mut d = Dispatcher::new();
        let id = d
            .send(&transport, &A, Request::header_at(5), RequestOrigin::Ancestor, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        assert_eq!(d.take(&B, id).unwrap_err(), Rejection::Unsolicited);
        let req = d.take(&A, id).unwrap();
        assert_eq!(req.kind, DataKind::Header);
        assert_eq!(d.take(&A, id).unwrap_err(), Rejection::Unsolicited);
    }

    #[tokio::test]
    async fn expired_answer_is_stale() {
        let transport = RecordingTransport::default();
        let mut d = Dispatcher::new();
        let id = d
            .send(&transport, &A, Request::Bodies(vec![]), RequestOrigin::Task(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(d.expire(Instant::now()).is_empty());
        let expired = d.expire(Instant::now() + Duration::from_secs(6));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].origin, RequestOrigin::Task(1));
        assert_eq!(d.take(&A, id).unwrap_err(), Rejection::Stale);
    }

    #[tokio::test]
    async fn release_and_abandon_mark_stale() {
        let transport = RecordingTransport::default();
        let mut d = Dispatcher::new();
        let timeout = Duration::from_secs(5);
        let a = d.send(&transport, &A, Request::header_at(1), RequestOrigin::Task(1), timeout).await.unwrap();
        let b = d.send(&transport, &B, Request::header_at(2), RequestOrigin::Announcement, timeout).await.unwrap();
        let c = d.send(&transport, &B, Request::header_at(3), RequestOrigin::Task(2), timeout).await.unwrap();

        assert_eq!(d.release_peer(&A).len(), 1);
        let abandoned = d.abandon(|r| matches!(r.origin, RequestOrigin::Task(_)));
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].request_id, c);
        assert_eq!(d.len(), 1);
        assert_eq!(d.take(&A, a).unwrap_err(), Rejection::Stale);
        assert_eq!(d.take(&B, c).unwrap_err(), Rejection::Stale);
        assert!(d.take(&B, b).is_ok());
    }

    #[tokio::test]
    async fn refused_send_is_not_tracked() {
        let transport = RecordingTransport {
            refuse: true,
            ..Default::default()
        };
        let mut d = Dispatcher::new();
        let id = d
            .send(&transport, &A, Request::header_at(1), RequestOrigin::Ancestor, Duration::from_secs(1))
            .await;
        assert!(id.is_none());
        assert!(d.is_empty());
    }
}
