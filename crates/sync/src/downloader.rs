//! Sync session state machine.
//!
//! A session picks a target peer, locates the highest block shared with it,
//! then keeps the fetch queue fed with idle peers and imports whatever the
//! queue releases, until every block up to the target's head is imported.

use std::collections::HashSet;
use std::time::Instant;

use chain::types::{BlockHeader, ChainHead};
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, SyncMode};
use crate::consensus::Consensus;
use crate::dispatch::{Dispatcher, InFlight, RequestOrigin};
use crate::engine::Ctx;
use crate::error::{DeliveryError, SyncError};
use crate::import::ImportOutcome;
use crate::peers::PeerRegistry;
use crate::queue::{FetchQueue, QueueProgress, Requirements, TaskId};
use crate::store::ChainStore;
use crate::types::{short_id, DataKind, PeerHead, PeerId, Request, Response};
use crate::SyncTransport;

/// Where a session is. Header, block and state fetching overlap; the stage
/// reports the earliest kind of work still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    AncestorSearch,
    HeaderSync,
    BlockSync,
    StateSync,
    Import,
}

/// Sync mode resolved for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveMode {
    Full,
    Fast { pivot: u64 },
    Light,
}

impl ActiveMode {
    fn resolve(mode: SyncMode, target: u64, local: u64, confirmations: u64) -> Self {
        match mode {
            SyncMode::Full => ActiveMode::Full,
            SyncMode::Light => ActiveMode::Light,
            SyncMode::Fast => {
                let pivot = target.saturating_sub(confirmations);
                if pivot <= local {
                    ActiveMode::Full
                } else {
                    ActiveMode::Fast { pivot }
                }
            }
        }
    }

    fn requirements(&self) -> Requirements {
        match self {
            ActiveMode::Full => Requirements::full(),
            ActiveMode::Fast { pivot } => Requirements::fast(*pivot),
            ActiveMode::Light => Requirements::light(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    /// Highest block both sides could share.
    Ceiling(u64),
    /// Lowest block the search may settle on.
    Floor(u64),
    /// `lo` is shared, `hi` is not.
    Bisect { lo: u64, hi: u64 },
}

struct AncestorSearch {
    ceiling: u64,
    floor: u64,
    query: Query,
    request: Option<u64>,
    /// Highest header confirmed as shared so far.
    matched: Option<BlockHeader>,
}

impl AncestorSearch {
    fn new(local: u64, remote: u64, config: &SyncConfig) -> Self {
        let ceiling = local.min(remote);
        let mut floor = local.saturating_sub(config.max_reorg_depth);
        if let Some(cp) = config.checkpoint {
            if cp.number <= ceiling {
                floor = floor.max(cp.number);
            }
        }
        Self {
            ceiling,
            floor: floor.min(ceiling),
            query: Query::Ceiling(ceiling),
            request: None,
            matched: None,
        }
    }

    fn query_number(&self) -> u64 {
        match self.query {
            Query::Ceiling(n) | Query::Floor(n) => n,
            Query::Bisect { lo, hi } => lo + (hi - lo) / 2,
        }
    }
}

enum SearchStep {
    Continue(Query),
    Found(u64),
}

struct Session {
    target: PeerId,
    target_head: PeerHead,
    mode: ActiveMode,
    search: Option<AncestorSearch>,
    /// Last header handed to the importer, or the ancestor.
    parent: Option<BlockHeader>,
    blacklist: HashSet<PeerId>,
    last_progress: Instant,
    imported: u64,
}

pub struct Downloader {
    session: Option<Session>,
    queue: FetchQueue,
}

impl Downloader {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            session: None,
            queue: FetchQueue::new(config),
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn target(&self) -> Option<(PeerId, PeerHead)> {
        self.session.as_ref().map(|s| (s.target, s.target_head))
    }

    pub fn mode(&self) -> Option<ActiveMode> {
        self.session.as_ref().map(|s| s.mode)
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.blacklist.contains(peer))
    }

    pub fn stage(&self) -> Stage {
        let Some(session) = &self.session else {
            return Stage::Idle;
        };
        if session.search.is_some() {
            Stage::AncestorSearch
        } else if self.queue.has_work(DataKind::Header) {
            Stage::HeaderSync
        } else if self.queue.has_work(DataKind::Body) || self.queue.has_work(DataKind::Receipt) {
            Stage::BlockSync
        } else if self.queue.has_work(DataKind::State) {
            Stage::StateSync
        } else {
            Stage::Import
        }
    }

    pub fn progress(&self) -> QueueProgress {
        match &self.session {
            Some(s) if s.search.is_none() => self.queue.progress(),
            _ => QueueProgress::default(),
        }
    }

    /// Whether an active session will import block `number`.
    pub fn covers(&self, number: u64) -> bool {
        match &self.session {
            Some(s) if s.search.is_some() => number <= s.target_head.number,
            Some(_) => self.queue.covers(number),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.search.is_none() && self.queue.is_complete())
    }

    /// Start a session against `peer`. A running session is only replaced by
    /// a heavier target. Returns whether a session was started.
    pub(crate) async fn start<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: PeerId,
    ) -> Result<bool, SyncError> {
        let Some(head) = ctx.peers.get(&peer).map(|p| p.head) else {
            return Ok(false);
        };
        let local = ctx.store.current_head();
        if head.td <= local.td {
            debug!(peer = %short_id(&peer), td = %head.td, local_td = %local.td, "peer not heavier");
            return Ok(false);
        }
        if let Some(session) = &self.session {
            if session.blacklist.contains(&peer) || head.td <= session.target_head.td {
                return Ok(false);
            }
            info!(
                peer = %short_id(&peer),
                td = %head.td,
                "heavier chain appeared, replacing sync session"
            );
            self.end(ctx.dispatcher, ctx.peers);
        }

        let mode = ActiveMode::resolve(
            ctx.config.mode,
            head.number,
            local.number,
            ctx.config.pivot_confirmations,
        );
        info!(
            peer = %short_id(&peer),
            number = head.number,
            local = local.number,
            ?mode,
            "sync session started"
        );
        self.session = Some(Session {
            target: peer,
            target_head: head,
            mode,
            search: Some(AncestorSearch::new(local.number, head.number, ctx.config)),
            parent: None,
            blacklist: HashSet::new(),
            last_progress: Instant::now(),
            imported: 0,
        });
        self.advance_search(ctx, local).await?;
        Ok(true)
    }

    /// Tear the session down: abandon its requests (late answers turn stale)
    /// and drop all queued work and results.
    pub fn end(&mut self, dispatcher: &mut Dispatcher, peers: &mut PeerRegistry) -> Option<u64> {
        let session = self.session.take()?;
        for req in dispatcher.abandon(|r| !matches!(r.origin, RequestOrigin::Announcement)) {
            peers.mark_idle(&req.peer, req.kind);
        }
        self.queue.reset();
        Some(session.imported)
    }

    /// Issue the next ancestor query, or settle the search without one.
    async fn advance_search<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        local: ChainHead,
    ) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(search) = session.search.as_mut() else {
            return Ok(());
        };
        if search.request.is_some() {
            return Ok(());
        }
        if search.ceiling == 0 {
            let genesis = ctx
                .store
                .canonical_hash(0)
                .and_then(|h| ctx.store.header(&h))
                .ok_or(SyncError::UnknownAncestor {
                    local: local.number,
                    depth: ctx.config.max_reorg_depth,
                })?;
            return self.begin_fetch(genesis);
        }
        let number = search.query_number();
        let target = session.target;
        let timeout = ctx.config.request_timeout();
        match ctx
            .send(&target, Request::header_at(number), RequestOrigin::Ancestor, timeout)
            .await
        {
            Some(id) => {
                search.request = Some(id);
                debug!(peer = %short_id(&target), number, "ancestor query sent");
            }
            None => ctx.penalize(&target, DataKind::Header),
        }
        Ok(())
    }

    pub(crate) async fn on_ancestor_response<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        req: &InFlight,
        response: Response,
    ) -> Result<(), SyncError> {
        let local = ctx.store.current_head();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(search) = session.search.as_mut() else {
            return Ok(());
        };
        if search.request != Some(req.request_id) {
            return Ok(());
        }
        search.request = None;
        let number = search.query_number();

        let header = match response {
            Response::Headers(headers) if headers.len() == 1 && headers[0].number == number => {
                headers.into_iter().next()
            }
            other => {
                warn!(
                    peer = %short_id(&req.peer),
                    number,
                    items = other.len(),
                    "bad ancestor query answer"
                );
                ctx.metrics.dropped(other.kind(), other.len());
                ctx.penalize(&req.peer, DataKind::Header);
                None
            }
        };
        let Some(header) = header else {
            return self.advance_search(ctx, local).await;
        };
        ctx.metrics.received(DataKind::Header, 1);
        ctx.peers
            .record_delivery(&req.peer, DataKind::Header, 1, req.sent_at.elapsed());
        session.last_progress = Instant::now();

        let shared = ctx.store.has_block(&header.hash());
        if shared {
            search.matched = Some(header);
        }
        let step = match (search.query, shared) {
            (Query::Ceiling(n), true) => SearchStep::Found(n),
            (Query::Ceiling(n), false) if search.floor >= n => {
                return Err(SyncError::UnknownAncestor {
                    local: local.number,
                    depth: ctx.config.max_reorg_depth,
                });
            }
            (Query::Ceiling(n), false) if search.floor == 0 => {
                SearchStep::Continue(Query::Bisect { lo: 0, hi: n })
            }
            (Query::Ceiling(_), false) => SearchStep::Continue(Query::Floor(search.floor)),
            (Query::Floor(f), true) => SearchStep::Continue(Query::Bisect {
                lo: f,
                hi: search.ceiling,
            }),
            (Query::Floor(_), false) => {
                return Err(SyncError::UnknownAncestor {
                    local: local.number,
                    depth: ctx.config.max_reorg_depth,
                });
            }
            (Query::Bisect { hi, .. }, true) => SearchStep::Continue(Query::Bisect { lo: number, hi }),
            (Query::Bisect { lo, .. }, false) => SearchStep::Continue(Query::Bisect { lo, hi: number }),
        };
        let step = match step {
            SearchStep::Continue(Query::Bisect { lo, hi }) if hi - lo <= 1 => SearchStep::Found(lo),
            other => other,
        };

        match step {
            SearchStep::Continue(query) => {
                search.query = query;
                self.advance_search(ctx, local).await
            }
            SearchStep::Found(number) => {
                let anchor = match search.matched.take() {
                    Some(h) if h.number == number => Some(h),
                    _ => ctx
                        .store
                        .canonical_hash(number)
                        .and_then(|h| ctx.store.header(&h)),
                };
                let anchor = anchor.ok_or(SyncError::UnknownAncestor {
                    local: local.number,
                    depth: ctx.config.max_reorg_depth,
                })?;
                self.begin_fetch(anchor)
            }
        }
    }

    fn begin_fetch(&mut self, anchor: BlockHeader) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.search = None;
        if let ActiveMode::Fast { pivot } = session.mode {
            if pivot <= anchor.number {
                session.mode = ActiveMode::Full;
            }
        }
        info!(
            ancestor = anchor.number,
            target = session.target_head.number,
            mode = ?session.mode,
            "common ancestor found"
        );
        self.queue.prepare(
            &anchor,
            session.target_head.number,
            session.target_head.hash,
            session.mode.requirements(),
        );
        self.queue.set_trusted(session.target);
        session.parent = Some(anchor);
        session.last_progress = Instant::now();
        Ok(())
    }

    /// Hand pending work to idle peers, fastest first.
    pub(crate) async fn dispatch<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
    ) -> Result<(), SyncError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let blacklist = session.blacklist.clone();
        if ctx.peers.snapshot(DataKind::Header).iter().all(|p| blacklist.contains(p)) {
            return Err(SyncError::NoPeers);
        }
        if session.search.is_some() {
            let local = ctx.store.current_head();
            return self.advance_search(ctx, local).await;
        }

        if let Some(root) = self.queue.take_state_start() {
            let present = ctx.store.has_state_node(&root);
            self.queue.begin_state(root, present);
        }

        let cap = ctx.config.max_inflight_per_peer;
        let timeout = ctx.config.request_timeout();
        for kind in DataKind::ALL {
            if !self.queue.has_pending(kind) {
                continue;
            }
            for peer in ctx.peers.snapshot(kind) {
                if blacklist.contains(&peer) {
                    continue;
                }
                let Some(height) = ctx.peers.get(&peer).map(|p| p.head.number) else {
                    continue;
                };
                while ctx.peers.is_idle(&peer, kind, cap) {
                    let Some((task, request)) = self.queue.reserve(kind, &peer, height) else {
                        break;
                    };
                    if ctx
                        .send(&peer, request, RequestOrigin::Task(task), timeout)
                        .await
                        .is_none()
                    {
                        self.queue.release_task(task);
                        ctx.penalize(&peer, kind);
                        break;
                    }
                    debug!(peer = %short_id(&peer), %kind, task, "task dispatched");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn on_task_response<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        req: &InFlight,
        task: TaskId,
        response: Response,
    ) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let peer = req.peer;
        let kind = req.kind;
        let items = response.len();

        let result = match response {
            Response::Headers(headers) if kind == DataKind::Header => {
                let consensus = ctx.consensus;
                let result = self
                    .queue
                    .deliver_headers(task, &peer, headers, |h, p| consensus.validate_header(h, p));
                for liar in self.queue.take_displaced() {
                    warn!(
                        peer = %short_id(&liar),
                        target = %short_id(&peer),
                        "headers contradicted by the target, peer excluded from session"
                    );
                    Self::exclude(session, &mut self.queue, ctx, liar);
                }
                result
            }
            Response::Bodies(bodies) if kind == DataKind::Body => self.queue.deliver_bodies(task, bodies),
            Response::Receipts(receipts) if kind == DataKind::Receipt => {
                self.queue.deliver_receipts(task, receipts)
            }
            Response::StateNodes(nodes) if kind == DataKind::State => {
                let store = ctx.store;
                self.queue
                    .deliver_state(task, nodes, |h| store.has_state_node(h))
                    .map(|nodes| {
                        let count = nodes.len();
                        for node in nodes {
                            if let Err(e) = store.insert_state_node(node) {
                                warn!(err = %e, "failed to store state node");
                            }
                        }
                        count
                    })
            }
            _ => {
                self.queue.release_task(task);
                Err(DeliveryError::WrongKind)
            }
        };

        match result {
            Ok(accepted) => {
                ctx.metrics.received(kind, accepted);
                ctx.peers
                    .record_delivery(&peer, kind, accepted, req.sent_at.elapsed());
                session.last_progress = Instant::now();
                debug!(peer = %short_id(&peer), %kind, count = accepted, "delivery accepted");
            }
            Err(DeliveryError::UnknownTask(_)) => {
                ctx.metrics.dropped(kind, items);
            }
            Err(DeliveryError::Disputed { number }) => {
                ctx.metrics.dropped(kind, items);
                debug!(peer = %short_id(&peer), number, "header range disputed, left to target");
            }
            Err(e) if e.is_integrity_failure() => {
                ctx.metrics.dropped(kind, items);
                Self::exclude(session, &mut self.queue, ctx, peer);
                if peer == session.target {
                    return Err(SyncError::InvalidChain {
                        peer: short_id(&peer),
                        reason: e,
                    });
                }
                warn!(
                    peer = %short_id(&peer),
                    err = %e,
                    "peer served a conflicting chain, excluded from session"
                );
            }
            Err(e) => {
                ctx.metrics.dropped(kind, items);
                debug!(peer = %short_id(&peer), %kind, err = %e, "delivery rejected");
                ctx.penalize(&peer, kind);
            }
        }

        self.import_ready(ctx)
    }

    /// Blacklist `peer` for the session and take back everything it holds.
    fn exclude<T: SyncTransport, S: ChainStore, C: Consensus>(
        session: &mut Session,
        queue: &mut FetchQueue,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: PeerId,
    ) {
        session.blacklist.insert(peer);
        queue.release_peer(&peer);
        for r in ctx
            .dispatcher
            .abandon(|r| r.peer == peer && matches!(r.origin, RequestOrigin::Task(_)))
        {
            ctx.peers.mark_idle(&r.peer, r.kind);
        }
    }

    /// Import every block the queue releases, in order, until the queue runs
    /// dry or cancellation is observed.
    pub(crate) fn import_ready<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
    ) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let mut first = None;
        let mut last = None;
        while !ctx.cancelled() {
            let Some(ready) = self.queue.pop_ready() else {
                break;
            };
            let number = ready.block.number();
            if let Some(parent) = &session.parent {
                if let Err(source) = ctx.consensus.validate_header(&ready.block.header, parent) {
                    session.blacklist.insert(ready.delivered_by);
                    ctx.evict(ready.delivered_by);
                    return Err(SyncError::InvalidBlock { number, source });
                }
            }
            match ctx.importer.import(ctx.store, &ready.block, ready.mode) {
                Ok(ImportOutcome::Imported(_)) => {
                    ctx.metrics.imported();
                    session.imported += 1;
                    session.last_progress = Instant::now();
                }
                Ok(ImportOutcome::Known) => {}
                Err(source) => {
                    session.blacklist.insert(ready.delivered_by);
                    ctx.evict(ready.delivered_by);
                    return Err(SyncError::ImportFailed { number, source });
                }
            }
            first.get_or_insert(number);
            last = Some(number);
            session.parent = Some(ready.block.header);
        }
        if let (Some(from), Some(to)) = (first, last) {
            info!(from, to, count = to - from + 1, "imported blocks");
        }
        Ok(())
    }

    /// A request timed out or its peer went away.
    pub fn on_request_failed(&mut self, req: &InFlight) {
        match req.origin {
            RequestOrigin::Task(task) => {
                self.queue.release_task(task);
            }
            RequestOrigin::Ancestor => {
                if let Some(search) = self.session.as_mut().and_then(|s| s.search.as_mut()) {
                    if search.request == Some(req.request_id) {
                        search.request = None;
                    }
                }
            }
            RequestOrigin::Announcement => {}
        }
    }

    /// `peer` left the registry. Its tasks go back to the queue; losing the
    /// target hands the session to the best remaining peer.
    pub(crate) async fn on_peer_dropped<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        self.queue.release_peer(&peer);
        if session.target != peer {
            return Ok(());
        }
        let Some(next) = ctx.peers.best(&session.blacklist).map(|p| (p.id, p.head)) else {
            return Err(SyncError::NoPeers);
        };
        let (id, head) = next;
        if let Some(search) = session.search.as_mut() {
            let local = ctx.store.current_head();
            if head.td <= local.td {
                return Err(SyncError::NoPeers);
            }
            info!(
                old = %short_id(&peer),
                new = %short_id(&id),
                "target dropped during ancestor search, restarting"
            );
            *search = AncestorSearch::new(local.number, head.number, ctx.config);
            session.target = id;
            session.target_head = head;
            session.mode = ActiveMode::resolve(
                ctx.config.mode,
                head.number,
                local.number,
                ctx.config.pivot_confirmations,
            );
            return self.advance_search(ctx, local).await;
        }
        info!(
            old = %short_id(&peer),
            new = %short_id(&id),
            "target dropped, continuing with new target"
        );
        session.target = id;
        self.queue.set_trusted(id);
        Ok(())
    }

    pub fn check_stall(&self, now: Instant, config: &SyncConfig) -> Result<(), SyncError> {
        match &self.session {
            Some(s) if now.saturating_duration_since(s.last_progress) > config.stall_timeout() => {
                Err(SyncError::NoProgress(config.stall_timeout()))
            }
            _ => Ok(()),
        }
    }
}
