//! The sync engine: one task owning the peer registry, the request
//! dispatcher, the downloader and the announcement fetcher.
//!
//! Everything runs on a single task. Network events and commands arrive over
//! an mpsc channel, timeouts are driven by a tick interval, and status is
//! published over a watch channel. Tests drive the same handlers directly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::B256;
use chain::types::{Block, ChainHead};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::consensus::Consensus;
use crate::dispatch::{Dispatcher, RequestOrigin, Rejection};
use crate::downloader::{Downloader, Stage};
use crate::error::SyncError;
use crate::fetcher::BlockFetcher;
use crate::import::Importer;
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::peers::PeerRegistry;
use crate::queue::QueueProgress;
use crate::store::ChainStore;
use crate::types::{short_id, DataKind, PeerHead, PeerId, Request, Response};
use crate::SyncTransport;

const EVENT_CHANNEL_SIZE: usize = 1024;

/// Input to the engine task.
#[derive(Debug)]
pub enum EngineEvent {
    PeerConnected { peer: PeerId, head: PeerHead },
    PeerDisconnected { peer: PeerId },
    Response { peer: PeerId, request_id: u64, response: Response },
    Announcement { peer: PeerId, hash: B256, number: u64 },
    BlockBroadcast { peer: PeerId, block: Block },
    /// Sync with the given peer, or the best known one.
    StartSync { peer: Option<PeerId> },
    CancelSync,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub stage: Stage,
    pub head: ChainHead,
    pub target: Option<PeerHead>,
    pub progress: QueueProgress,
    pub peers: usize,
    /// Why the last session failed, cleared when a new one starts.
    pub last_error: Option<String>,
}

/// Borrowed view of the engine handed to the downloader and the fetcher.
/// Peers that must be evicted are collected in `evicted` and removed by the
/// engine once the call returns.
pub(crate) struct Ctx<'a, T, S, C> {
    pub config: &'a SyncConfig,
    pub peers: &'a mut PeerRegistry,
    pub dispatcher: &'a mut Dispatcher,
    pub importer: &'a mut Importer,
    pub metrics: &'a SyncMetrics,
    pub transport: &'a T,
    pub store: &'a S,
    pub consensus: &'a C,
    pub cancel: &'a AtomicBool,
    pub evicted: Vec<PeerId>,
}

impl<T: SyncTransport, S: ChainStore, C: Consensus> Ctx<'_, T, S, C> {
    /// Send through the dispatcher and count the request against the peer.
    pub async fn send(
        &mut self,
        peer: &PeerId,
        request: Request,
        origin: RequestOrigin,
        timeout: Duration,
    ) -> Option<u64> {
        let kind = request.kind();
        let id = self
            .dispatcher
            .send(self.transport, peer, request, origin, timeout)
            .await?;
        self.peers.mark_busy(peer, kind);
        Some(id)
    }

    /// Record a failure; enough consecutive ones evict the peer.
    pub fn penalize(&mut self, peer: &PeerId, kind: DataKind) {
        let failures = self.peers.record_failure(peer, kind);
        if failures >= self.config.max_consecutive_failures {
            self.evict(*peer);
        }
    }

    pub fn evict(&mut self, peer: PeerId) {
        if !self.evicted.contains(&peer) {
            self.evicted.push(peer);
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

pub struct Engine<T, S, C> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    consensus: Arc<C>,
    peers: PeerRegistry,
    dispatcher: Dispatcher,
    downloader: Downloader,
    fetcher: BlockFetcher,
    importer: Importer,
    metrics: Arc<SyncMetrics>,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<SyncStatus>,
    last_error: Option<String>,
    last_sync: Instant,
    last_head: B256,
    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: Option<mpsc::Receiver<EngineEvent>>,
}

impl<T: SyncTransport, S: ChainStore, C: Consensus> Engine<T, S, C> {
    pub fn new(config: SyncConfig, transport: Arc<T>, store: Arc<S>, consensus: Arc<C>) -> Self {
        let head = store.current_head();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (status_tx, _) = watch::channel(SyncStatus {
            stage: Stage::Idle,
            head,
            target: None,
            progress: QueueProgress::default(),
            peers: 0,
            last_error: None,
        });
        Self {
            peers: PeerRegistry::new(config.throughput_impact),
            dispatcher: Dispatcher::new(),
            downloader: Downloader::new(&config),
            fetcher: BlockFetcher::new(config.fetcher.clone()),
            importer: Importer::new(),
            metrics: Arc::new(SyncMetrics::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            status_tx,
            last_error: None,
            last_sync: Instant::now(),
            last_head: head.hash,
            events_tx,
            events_rx: Some(events_rx),
            config,
            transport,
            store,
            consensus,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<EngineEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn fetcher(&self) -> &BlockFetcher {
        &self.fetcher
    }

    pub fn is_syncing(&self) -> bool {
        self.downloader.is_active()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            stage: self.downloader.stage(),
            head: self.store.current_head(),
            target: self.downloader.target().map(|(_, head)| head),
            progress: self.downloader.progress(),
            peers: self.peers.len(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn parts(&mut self) -> (&mut Downloader, &mut BlockFetcher, Ctx<'_, T, S, C>) {
        let Self {
            config,
            transport,
            store,
            consensus,
            peers,
            dispatcher,
            downloader,
            fetcher,
            importer,
            metrics,
            cancel,
            ..
        } = self;
        let ctx = Ctx {
            config,
            peers,
            dispatcher,
            importer,
            metrics: &**metrics,
            transport: &**transport,
            store: &**store,
            consensus: &**consensus,
            cancel: &**cancel,
            evicted: Vec::new(),
        };
        (downloader, fetcher, ctx)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    pub async fn on_peer_connected(&mut self, peer: PeerId, head: PeerHead) {
        if !self.peers.register(peer, head) {
            if self.peers.update_head(&peer, head) {
                debug!(peer = %short_id(&peer), number = head.number, "peer head updated");
            }
        } else {
            info!(
                peer = %short_id(&peer),
                number = head.number,
                td = %head.td,
                peers = self.peers.len(),
                "peer registered"
            );
        }
        if self.config.auto_sync {
            self.start_sync(Some(peer)).await;
        }
        self.dispatch().await;
        self.publish_status();
    }

    pub async fn on_peer_disconnected(&mut self, peer: PeerId) {
        if !self.peers.contains(&peer) {
            return;
        }
        info!(peer = %short_id(&peer), "peer disconnected");
        self.drop_peers(vec![(peer, false)]).await;
        self.dispatch().await;
        self.publish_status();
    }

    /// Unregister peers, release everything they held and, for evictions,
    /// close the connection. Handing a lost target over may evict more.
    async fn drop_peers(&mut self, mut pending: Vec<(PeerId, bool)>) {
        while let Some((peer, disconnect)) = pending.pop() {
            if self.peers.unregister(&peer).is_none() {
                continue;
            }
            if disconnect {
                warn!(peer = %short_id(&peer), "evicting peer");
                self.transport.disconnect_peer(&peer).await;
            }
            for req in self.dispatcher.release_peer(&peer) {
                match req.origin {
                    RequestOrigin::Announcement => self.fetcher.on_fetch_failed(req.request_id),
                    _ => self.downloader.on_request_failed(&req),
                }
            }
            self.fetcher.forget_peer(&peer);

            let (downloader, _, mut ctx) = self.parts();
            let result = downloader.on_peer_dropped(&mut ctx, peer).await;
            let evicted = ctx.evicted;
            self.settle(result);
            pending.extend(evicted.into_iter().map(|p| (p, true)));
        }
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start syncing with `peer`, or the heaviest registered peer. Returns
    /// whether a session was started.
    pub async fn start_sync(&mut self, peer: Option<PeerId>) -> bool {
        self.last_sync = Instant::now();
        let Some(peer) = peer.or_else(|| self.peers.best(&HashSet::new()).map(|p| p.id)) else {
            debug!("no peers to sync with");
            return false;
        };
        let (downloader, _, mut ctx) = self.parts();
        let result = downloader.start(&mut ctx, peer).await;
        let evicted = ctx.evicted;
        let started = matches!(result, Ok(true));
        if started {
            self.last_error = None;
        }
        self.settle(result.map(|_| ()));
        self.evict(evicted).await;
        if started {
            self.dispatch().await;
        }
        self.publish_status();
        started
    }

    /// Abort the running session. Imported blocks stay imported.
    pub fn cancel_sync(&mut self) {
        self.cancel.store(false, Ordering::Relaxed);
        if let Some(imported) = self.downloader.end(&mut self.dispatcher, &mut self.peers) {
            info!(imported, "sync cancelled");
        }
        self.publish_status();
    }

    fn fail_session(&mut self, err: SyncError) {
        if let Some(imported) = self.downloader.end(&mut self.dispatcher, &mut self.peers) {
            warn!(err = %err, imported, "sync failed");
        }
        self.last_error = Some(err.to_string());
    }

    fn settle(&mut self, result: Result<(), SyncError>) {
        match result {
            Err(err) => self.fail_session(err),
            Ok(()) if self.downloader.is_finished() => {
                if let Some(imported) = self.downloader.end(&mut self.dispatcher, &mut self.peers) {
                    let head = self.store.current_head();
                    info!(imported, number = head.number, hash = %head.hash, "sync complete");
                }
            }
            Ok(()) => {}
        }
    }

    async fn evict(&mut self, peers: Vec<PeerId>) {
        if !peers.is_empty() {
            self.drop_peers(peers.into_iter().map(|p| (p, true)).collect()).await;
        }
    }

    async fn dispatch(&mut self) {
        let (downloader, _, mut ctx) = self.parts();
        let result = downloader.dispatch(&mut ctx).await;
        let evicted = ctx.evicted;
        self.settle(result);
        self.evict(evicted).await;
    }

    // -----------------------------------------------------------------------
    // Responses
    // -----------------------------------------------------------------------

    pub async fn on_response(&mut self, peer: PeerId, request_id: u64, response: Response) {
        let kind = response.kind();
        let req = match self.dispatcher.take(&peer, request_id) {
            Ok(req) => req,
            Err(Rejection::Stale) => {
                debug!(peer = %short_id(&peer), request_id, "late response dropped");
                self.metrics.dropped(kind, response.len());
                return;
            }
            Err(Rejection::Unsolicited) => {
                warn!(peer = %short_id(&peer), request_id, "unsolicited response");
                self.metrics.dropped(kind, response.len());
                if !self.peers.contains(&peer) {
                    return;
                }
                let failures = self.peers.record_failure(&peer, kind);
                if failures >= self.config.max_consecutive_failures {
                    self.evict(vec![peer]).await;
                }
                return;
            }
        };
        self.peers.mark_idle(&peer, req.kind);

        let (downloader, fetcher, mut ctx) = self.parts();
        let result = match req.origin {
            RequestOrigin::Task(task) => downloader.on_task_response(&mut ctx, &req, task, response).await,
            RequestOrigin::Ancestor => downloader.on_ancestor_response(&mut ctx, &req, response).await,
            RequestOrigin::Announcement => {
                fetcher.on_response(&mut ctx, &req, response).await;
                Ok(())
            }
        };
        let evicted = ctx.evicted;
        self.settle(result);
        self.evict(evicted).await;
        self.after_event().await;
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    pub async fn on_announcement(&mut self, peer: PeerId, hash: B256, number: u64) {
        if !self.peers.contains(&peer) {
            return;
        }
        let covered = self.downloader.covers(number);
        let (_, fetcher, mut ctx) = self.parts();
        fetcher.on_announcement(&mut ctx, peer, hash, number, covered).await;
        let evicted = ctx.evicted;
        self.evict(evicted).await;
        self.after_event().await;
    }

    pub async fn on_block_broadcast(&mut self, peer: PeerId, block: Block) {
        if !self.peers.contains(&peer) {
            return;
        }
        let covered = self.downloader.covers(block.number());
        let (_, fetcher, mut ctx) = self.parts();
        fetcher.on_block_broadcast(&mut ctx, peer, block, covered);
        let evicted = ctx.evicted;
        self.evict(evicted).await;
        self.after_event().await;
    }

    /// Follow-up shared by every input: wake the fetcher if the head moved,
    /// keep peers busy and publish status.
    async fn after_event(&mut self) {
        let head = self.store.current_head().hash;
        if head != self.last_head {
            self.last_head = head;
            let (_, fetcher, mut ctx) = self.parts();
            fetcher.on_head_advanced(&mut ctx).await;
            let evicted = ctx.evicted;
            self.evict(evicted).await;
        }
        self.dispatch().await;
        self.publish_status();
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Expire requests, detect stalls, retry sync and refill idle peers.
    pub async fn tick(&mut self, now: Instant) {
        if self.cancel.load(Ordering::Relaxed) {
            self.cancel_sync();
        }

        let mut evicted = Vec::new();
        for req in self.dispatcher.expire(now) {
            self.metrics.timed_out(req.kind);
            self.peers.mark_idle(&req.peer, req.kind);
            debug!(peer = %short_id(&req.peer), request_id = req.request_id, kind = %req.kind, "request timed out");
            match req.origin {
                RequestOrigin::Announcement => self.fetcher.on_fetch_failed(req.request_id),
                _ => self.downloader.on_request_failed(&req),
            }
            if !self.peers.contains(&req.peer) {
                continue;
            }
            let failures = self.peers.record_failure(&req.peer, req.kind);
            if failures >= self.config.max_consecutive_failures && !evicted.contains(&req.peer) {
                evicted.push(req.peer);
            }
        }
        self.evict(evicted).await;

        if let Err(err) = self.downloader.check_stall(now, &self.config) {
            self.fail_session(err);
        }
        self.fetcher.expire(now);

        if self.config.auto_sync
            && !self.downloader.is_active()
            && now.saturating_duration_since(self.last_sync) >= self.config.sync_interval()
        {
            self.start_sync(None).await;
        }
        self.after_event().await;
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn handle(&mut self, event: EngineEvent) {
        if self.cancel.load(Ordering::Relaxed) {
            self.cancel_sync();
        }
        match event {
            EngineEvent::PeerConnected { peer, head } => self.on_peer_connected(peer, head).await,
            EngineEvent::PeerDisconnected { peer } => self.on_peer_disconnected(peer).await,
            EngineEvent::Response {
                peer,
                request_id,
                response,
            } => self.on_response(peer, request_id, response).await,
            EngineEvent::Announcement { peer, hash, number } => {
                self.on_announcement(peer, hash, number).await
            }
            EngineEvent::BlockBroadcast { peer, block } => self.on_block_broadcast(peer, block).await,
            EngineEvent::StartSync { peer } => {
                self.start_sync(peer).await;
            }
            EngineEvent::CancelSync => self.cancel_sync(),
            EngineEvent::Stop => {}
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(mode = ?self.config.mode, head = self.store.current_head().number, "sync engine started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(EngineEvent::Stop) | None => break,
                    Some(event) => self.handle(event).await,
                },
                _ = ticker.tick() => self.tick(Instant::now()).await,
            }
        }
        self.cancel_sync();
        info!("sync engine stopped");
    }
}

impl<T, S, C> Engine<T, S, C>
where
    T: SyncTransport + 'static,
    S: ChainStore + 'static,
    C: Consensus + 'static,
{
    /// Move the engine onto its own task.
    pub fn start(mut self) -> EngineHandle {
        let events = self.events_tx.clone();
        let status = self.status_tx.subscribe();
        let metrics = Arc::clone(&self.metrics);
        let cancel = Arc::clone(&self.cancel);
        let rx = self.events_rx.take();
        let task = tokio::spawn(async move {
            if let Some(rx) = rx {
                self.run(rx).await;
            }
        });
        EngineHandle {
            events,
            status,
            metrics,
            cancel,
            task,
        }
    }
}

/// Control surface of a running engine.
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    status: watch::Receiver<SyncStatus>,
    metrics: Arc<SyncMetrics>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn sender(&self) -> mpsc::Sender<EngineEvent> {
        self.events.clone()
    }

    pub async fn start_sync(&self, peer: Option<PeerId>) {
        let _ = self.events.send(EngineEvent::StartSync { peer }).await;
    }

    /// Request cancellation. The import loop stops at the next block boundary
    /// and the session is torn down on the next event.
    pub fn cancel_sync(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.events.try_send(EngineEvent::CancelSync);
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn stop(self) {
        let _ = self.events.send(EngineEvent::Stop).await;
        if let Err(e) = self.task.await {
            warn!(err = %e, "sync engine task failed");
        }
    }
}
