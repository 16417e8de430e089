//! Announcement-driven block fetching near the chain head.
//!
//! Peers announce new blocks by hash or push them whole. Announcements close
//! to the local head are fetched (header, then body) and imported directly,
//! without a sync session. Blocks whose parent is unknown wait in an orphan
//! pool keyed by parent hash until the parent lands.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use alloy_primitives::B256;
use chain::types::{Block, BlockHeader};
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::consensus::{validate_sanity, Consensus};
use crate::dispatch::{InFlight, RequestOrigin};
use crate::engine::Ctx;
use crate::import::ImportOutcome;
use crate::metrics::Category;
use crate::store::{ChainStore, ImportMode, SyncedBlock};
use crate::types::{short_id, DataKind, PeerId, Request, Response};
use crate::SyncTransport;

struct Announcement {
    number: u64,
    peer: PeerId,
    at: Instant,
    fetching: bool,
}

enum Phase {
    Header,
    Body(Box<BlockHeader>),
}

struct Fetch {
    hash: B256,
    number: u64,
    phase: Phase,
}

struct Orphan {
    block: Block,
    peer: PeerId,
    at: Instant,
}

pub struct BlockFetcher {
    config: FetcherConfig,
    announced: HashMap<B256, Announcement>,
    /// Unresolved announcements per peer.
    outstanding: HashMap<PeerId, usize>,
    /// Peers currently over the announcement limit.
    flagged: HashSet<PeerId>,
    fetching: HashMap<u64, Fetch>,
    orphans: HashMap<B256, Vec<Orphan>>,
    orphan_count: usize,
    orphans_by_peer: HashMap<PeerId, usize>,
}

impl BlockFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        Self {
            config,
            announced: HashMap::new(),
            outstanding: HashMap::new(),
            flagged: HashSet::new(),
            fetching: HashMap::new(),
            orphans: HashMap::new(),
            orphan_count: 0,
            orphans_by_peer: HashMap::new(),
        }
    }

    pub fn announced_len(&self) -> usize {
        self.announced.len()
    }

    pub fn orphan_len(&self) -> usize {
        self.orphan_count
    }

    pub fn is_flagged(&self, peer: &PeerId) -> bool {
        self.flagged.contains(peer)
    }

    /// Outside the window around the local head: too old to matter or too
    /// far ahead to import without a sync.
    fn out_of_range(&self, number: u64, head: u64) -> bool {
        number + self.config.max_uncle_distance < head
            || number > head + self.config.max_queue_distance
    }

    fn is_known<T, S: ChainStore, C>(ctx: &Ctx<'_, T, S, C>, hash: &B256) -> bool {
        ctx.importer.is_seen(hash) || ctx.store.has_block(hash)
    }

    /// `covered` means a running sync session will import this block anyway.
    pub(crate) async fn on_announcement<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: PeerId,
        hash: B256,
        number: u64,
        covered: bool,
    ) {
        ctx.metrics.incoming(Category::Announce);
        let count = self.outstanding.get(&peer).copied().unwrap_or(0);
        if count >= self.config.announce_limit {
            ctx.metrics.dos(Category::Announce);
            if self.flagged.insert(peer) {
                warn!(peer = %short_id(&peer), count, "announcement limit exceeded");
            }
            return;
        }
        if Self::is_known(ctx, &hash) || self.announced.contains_key(&hash) {
            return;
        }
        let head = ctx.store.current_head().number;
        if self.out_of_range(number, head) {
            ctx.metrics.category_dropped(Category::Announce);
            debug!(peer = %short_id(&peer), number, head, "announcement out of range");
            return;
        }
        if covered {
            debug!(number, %hash, "announcement left to the sync session");
            return;
        }
        self.announced.insert(
            hash,
            Announcement {
                number,
                peer,
                at: Instant::now(),
                fetching: false,
            },
        );
        *self.outstanding.entry(peer).or_default() += 1;
        if number <= head + 1 {
            self.start_fetch(ctx, hash).await;
        }
    }

    async fn start_fetch<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        hash: B256,
    ) {
        let Some((peer, number)) = self
            .announced
            .get(&hash)
            .filter(|a| !a.fetching)
            .map(|a| (a.peer, a.number))
        else {
            return;
        };
        let timeout = self.config.fetch_timeout();
        match ctx
            .send(&peer, Request::header_by_hash(hash), RequestOrigin::Announcement, timeout)
            .await
        {
            Some(id) => {
                if let Some(a) = self.announced.get_mut(&hash) {
                    a.fetching = true;
                }
                self.fetching.insert(
                    id,
                    Fetch {
                        hash,
                        number,
                        phase: Phase::Header,
                    },
                );
                ctx.metrics.fetch_header();
                debug!(peer = %short_id(&peer), number, %hash, "fetching announced header");
            }
            None => self.forget(&hash),
        }
    }

    /// Drop the record for `hash` and release its slot in the announcer's
    /// budget.
    fn forget(&mut self, hash: &B256) {
        let Some(a) = self.announced.remove(hash) else {
            return;
        };
        if let Some(count) = self.outstanding.get_mut(&a.peer) {
            *count = count.saturating_sub(1);
            if *count < self.config.announce_limit {
                self.flagged.remove(&a.peer);
            }
            if *count == 0 {
                self.outstanding.remove(&a.peer);
            }
        }
    }

    pub(crate) async fn on_response<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        req: &InFlight,
        response: Response,
    ) {
        let Some(fetch) = self.fetching.remove(&req.request_id) else {
            return;
        };
        let peer = req.peer;
        if Self::is_known(ctx, &fetch.hash) {
            self.forget(&fetch.hash);
            return;
        }
        match (fetch.phase, response) {
            (Phase::Header, Response::Headers(headers)) => {
                let header = headers
                    .into_iter()
                    .find(|h| h.hash() == fetch.hash && h.number == fetch.number);
                let Some(header) = header else {
                    debug!(peer = %short_id(&peer), hash = %fetch.hash, "announced header not delivered");
                    self.reject(ctx, &peer, &fetch.hash, DataKind::Header);
                    return;
                };
                if let Err(e) = validate_sanity(&header, self.config.max_extra_data) {
                    warn!(peer = %short_id(&peer), number = header.number, err = %e, "announced header invalid");
                    self.reject(ctx, &peer, &fetch.hash, DataKind::Header);
                    return;
                }
                if header.has_empty_body() {
                    let block = Block {
                        header,
                        body: Default::default(),
                    };
                    self.deliver(ctx, block, peer, Category::Announce);
                    return;
                }
                let timeout = self.config.fetch_timeout();
                match ctx
                    .send(&peer, Request::Bodies(vec![fetch.hash]), RequestOrigin::Announcement, timeout)
                    .await
                {
                    Some(id) => {
                        self.fetching.insert(
                            id,
                            Fetch {
                                hash: fetch.hash,
                                number: fetch.number,
                                phase: Phase::Body(Box::new(header)),
                            },
                        );
                        ctx.metrics.fetch_body();
                    }
                    None => self.forget(&fetch.hash),
                }
            }
            (Phase::Body(header), Response::Bodies(bodies)) => {
                let Some(body) = bodies.into_iter().find(|b| b.matches(&header)) else {
                    debug!(peer = %short_id(&peer), hash = %fetch.hash, "announced body not delivered");
                    self.reject(ctx, &peer, &fetch.hash, DataKind::Body);
                    return;
                };
                let block = Block {
                    header: *header,
                    body,
                };
                self.deliver(ctx, block, peer, Category::Announce);
            }
            (_, other) => self.reject(ctx, &peer, &fetch.hash, other.kind()),
        }
    }

    fn reject<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: &PeerId,
        hash: &B256,
        kind: DataKind,
    ) {
        ctx.metrics.category_dropped(Category::Announce);
        ctx.penalize(peer, kind);
        self.forget(hash);
    }

    /// A fetch request timed out or its peer disconnected.
    pub fn on_fetch_failed(&mut self, request_id: u64) {
        if let Some(fetch) = self.fetching.remove(&request_id) {
            self.forget(&fetch.hash);
        }
    }

    /// A whole block pushed by `peer`.
    pub(crate) fn on_block_broadcast<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        peer: PeerId,
        block: Block,
        covered: bool,
    ) {
        ctx.metrics.incoming(Category::Broadcast);
        let queued = self.orphans_by_peer.get(&peer).copied().unwrap_or(0);
        if queued >= self.config.block_limit {
            ctx.metrics.dos(Category::Broadcast);
            return;
        }
        let hash = block.hash();
        if Self::is_known(ctx, &hash) {
            return;
        }
        let head = ctx.store.current_head().number;
        if self.out_of_range(block.number(), head) {
            ctx.metrics.category_dropped(Category::Broadcast);
            debug!(peer = %short_id(&peer), number = block.number(), head, "broadcast out of range");
            return;
        }
        let sane = validate_sanity(&block.header, self.config.max_extra_data);
        if sane.is_err() || !block.body.matches(&block.header) {
            warn!(peer = %short_id(&peer), number = block.number(), "malformed block broadcast");
            ctx.metrics.category_dropped(Category::Broadcast);
            ctx.penalize(&peer, DataKind::Body);
            return;
        }
        if covered {
            return;
        }
        self.deliver(ctx, block, peer, Category::Broadcast);
    }

    /// Import `block` if its parent is stored, otherwise park it as an orphan.
    fn deliver<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        block: Block,
        peer: PeerId,
        category: Category,
    ) {
        let hash = block.hash();
        self.forget(&hash);
        if Self::is_known(ctx, &hash) {
            return;
        }
        let Some(parent) = ctx.store.header(&block.header.parent_hash) else {
            self.park(ctx, block, peer, category);
            return;
        };
        if self.import(ctx, block, &parent, peer, category) {
            self.resolve(ctx, hash);
        }
    }

    fn import<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        block: Block,
        parent: &BlockHeader,
        peer: PeerId,
        category: Category,
    ) -> bool {
        let number = block.number();
        if let Err(e) = ctx.consensus.validate_header(&block.header, parent) {
            warn!(peer = %short_id(&peer), number, err = %e, "propagated block invalid");
            ctx.metrics.category_dropped(category);
            ctx.penalize(&peer, DataKind::Header);
            return false;
        }
        let synced = SyncedBlock {
            hash: block.hash(),
            header: block.header,
            body: Some(block.body),
            receipts: None,
        };
        match ctx.importer.import(ctx.store, &synced, ImportMode::Execute) {
            Ok(ImportOutcome::Imported(head)) => {
                ctx.metrics.imported();
                info!(number, hash = %synced.hash, head = head.number, "imported propagated block");
                true
            }
            Ok(ImportOutcome::Known) => false,
            Err(e) => {
                warn!(peer = %short_id(&peer), number, err = %e, "propagated block import failed");
                ctx.penalize(&peer, DataKind::Body);
                false
            }
        }
    }

    fn park<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        block: Block,
        peer: PeerId,
        category: Category,
    ) {
        let queued = self.orphans_by_peer.get(&peer).copied().unwrap_or(0);
        if queued >= self.config.block_limit {
            ctx.metrics.dos(category);
            return;
        }
        if self.orphan_count >= self.config.max_orphans {
            ctx.metrics.category_dropped(category);
            return;
        }
        let hash = block.hash();
        let siblings = self.orphans.entry(block.header.parent_hash).or_default();
        if siblings.iter().any(|o| o.block.hash() == hash) {
            return;
        }
        debug!(number = block.number(), %hash, "parent unknown, block parked");
        siblings.push(Orphan {
            block,
            peer,
            at: Instant::now(),
        });
        self.orphan_count += 1;
        *self.orphans_by_peer.entry(peer).or_default() += 1;
    }

    fn unpark(&mut self, orphan: &Orphan) {
        self.orphan_count = self.orphan_count.saturating_sub(1);
        if let Some(count) = self.orphans_by_peer.get_mut(&orphan.peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.orphans_by_peer.remove(&orphan.peer);
            }
        }
    }

    /// Import every parked descendant of `parent`.
    fn resolve<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
        parent: B256,
    ) {
        let mut work = vec![parent];
        while let Some(hash) = work.pop() {
            let Some(children) = self.orphans.remove(&hash) else {
                continue;
            };
            for orphan in &children {
                self.unpark(orphan);
            }
            let Some(parent) = ctx.store.header(&hash) else {
                continue;
            };
            for orphan in children {
                let child = orphan.block.hash();
                if self.import(ctx, orphan.block, &parent, orphan.peer, Category::Broadcast) {
                    work.push(child);
                }
            }
        }
    }

    /// The local head moved: fetch announcements that became adjacent, drop
    /// ones that fell behind and import orphans whose parent arrived.
    pub(crate) async fn on_head_advanced<T: SyncTransport, S: ChainStore, C: Consensus>(
        &mut self,
        ctx: &mut Ctx<'_, T, S, C>,
    ) {
        let head = ctx.store.current_head().number;

        let stale: Vec<B256> = self
            .announced
            .iter()
            .filter(|(hash, a)| {
                !a.fetching
                    && (a.number + self.config.max_uncle_distance < head
                        || ctx.importer.is_seen(hash)
                        || ctx.store.has_block(hash))
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            self.forget(&hash);
        }

        let parents: Vec<B256> = self
            .orphans
            .keys()
            .filter(|p| ctx.store.has_block(p))
            .copied()
            .collect();
        for parent in parents {
            self.resolve(ctx, parent);
        }

        let head = ctx.store.current_head().number;
        let mut ready: Vec<(u64, B256)> = self
            .announced
            .iter()
            .filter(|(_, a)| !a.fetching && a.number <= head + 1)
            .map(|(hash, a)| (a.number, *hash))
            .collect();
        ready.sort_unstable();
        for (_, hash) in ready {
            self.start_fetch(ctx, hash).await;
        }
    }

    /// Forget announcements and orphans older than the expiry window.
    /// Announcements being fetched are left to the request timeout.
    pub fn expire(&mut self, now: Instant) {
        let expiry = self.config.announce_expiry();
        let expired: Vec<B256> = self
            .announced
            .iter()
            .filter(|(_, a)| !a.fetching && now.saturating_duration_since(a.at) >= expiry)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.forget(hash);
        }

        let mut dropped = Vec::new();
        self.orphans.retain(|_, siblings| {
            siblings.retain(|o| {
                let keep = now.saturating_duration_since(o.at) < expiry;
                if !keep {
                    dropped.push(o.peer);
                }
                keep
            });
            !siblings.is_empty()
        });
        for peer in dropped {
            self.orphan_count = self.orphan_count.saturating_sub(1);
            if let Some(count) = self.orphans_by_peer.get_mut(&peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.orphans_by_peer.remove(&peer);
                }
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "announcements expired");
        }
    }

    /// Drop everything `peer` announced that is not being fetched. Parked
    /// blocks are complete and stay.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        let hashes: Vec<B256> = self
            .announced
            .iter()
            .filter(|(_, a)| a.peer == *peer && !a.fetching)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in hashes {
            self.forget(&hash);
        }
        self.flagged.remove(peer);
    }
}
