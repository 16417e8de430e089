//! Work scheduling and result reassembly for a sync session.
//!
//! Header ranges, body and receipt block numbers and state node hashes wait in
//! per-kind backlogs until a peer reserves them as a task. Delivered headers
//! open a result slot per block number; bodies and receipts fill the slots in;
//! slots leave the queue strictly in block order once complete.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use alloy_primitives::B256;
use chain::types::{receipts_root, BlockBody, BlockHeader, Receipt, StateNode};
use tracing::debug;

use crate::config::SyncConfig;
use crate::consensus::ConsensusError;
use crate::error::DeliveryError;
use crate::store::{ImportMode, SyncedBlock};
use crate::types::{short_id, DataKind, HashOrNumber, PeerId, Request};

pub type TaskId = u64;

/// What a reserved task covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskItems {
    Headers { from: u64, count: u64 },
    Blocks(Vec<u64>),
    State(Vec<B256>),
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: DataKind,
    pub peer: PeerId,
    pub items: TaskItems,
}

/// Data a session needs per block, derived from the sync mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub bodies: bool,
    /// Receipts are fetched for blocks up to and including this number.
    pub receipts_through: Option<u64>,
    /// Blocks from this number on wait until the state sync completes.
    pub state_from: Option<u64>,
}

impl Requirements {
    pub fn full() -> Self {
        Self {
            bodies: true,
            ..Self::default()
        }
    }

    pub fn fast(pivot: u64) -> Self {
        Self {
            bodies: true,
            receipts_through: Some(pivot),
            state_from: Some(pivot),
        }
    }

    pub fn light() -> Self {
        Self::default()
    }

    pub fn needs_receipts(&self, number: u64) -> bool {
        self.receipts_through.is_some_and(|p| number <= p)
    }

    pub fn import_mode(&self, number: u64) -> ImportMode {
        match (self.bodies, self.state_from) {
            (false, _) => ImportMode::HeaderOnly,
            (true, Some(pivot)) if number < pivot => ImportMode::WithReceipts,
            _ => ImportMode::Execute,
        }
    }
}

#[derive(Debug, Clone)]
struct ResultSlot {
    header: BlockHeader,
    hash: B256,
    body: Option<BlockBody>,
    receipts: Option<Vec<Receipt>>,
    delivered_by: PeerId,
}

/// A block whose every required part has arrived and whose predecessors have
/// all left the queue.
#[derive(Debug, Clone)]
pub struct ReadyBlock {
    pub block: SyncedBlock,
    pub mode: ImportMode,
    /// Peer that delivered the header.
    pub delivered_by: PeerId,
}

#[derive(Debug, Clone)]
struct Anchor {
    number: u64,
    hash: B256,
    header: Option<BlockHeader>,
}

struct StateSchedule {
    root: B256,
    pending: VecDeque<B256>,
    /// Every hash scheduled this session, fetched or not.
    known: HashSet<B256>,
    fetched: u64,
    complete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProgress {
    /// Block the session started from.
    pub starting: u64,
    /// Last block handed out for import.
    pub current: u64,
    pub highest: u64,
    pub headers: u64,
    /// Highest block whose body is in hand, imported blocks included.
    pub bodies: u64,
    /// Same for receipts; stays at `starting` when none are fetched.
    pub receipts: u64,
    pub state_fetched: u64,
    pub state_pending: u64,
}

pub struct FetchQueue {
    header_batch: u64,
    body_batch: usize,
    receipt_batch: usize,
    state_batch: usize,
    max_pending: usize,
    resume: usize,

    requirements: Requirements,
    anchor: Anchor,
    starting: u64,
    target_number: u64,
    target_hash: B256,
    next_pop: u64,
    highest_header: u64,

    header_pending: BTreeMap<u64, u64>,
    body_pending: BTreeSet<u64>,
    receipt_pending: BTreeSet<u64>,
    reserved: HashMap<TaskId, Task>,
    next_task_id: TaskId,
    slots: BTreeMap<u64, ResultSlot>,
    throttled: bool,

    state: Option<StateSchedule>,
    discovered_root: Option<B256>,

    /// The session target. Its headers win any conflict with a neighbouring
    /// slot, and only it may serve disputed ranges.
    trusted: Option<PeerId>,
    /// Starts of header ranges reserved to the trusted peer.
    disputed: BTreeSet<u64>,
    /// Peers whose slots were thrown out by a trusted delivery.
    displaced: Vec<PeerId>,
}

/// Side of a delivered header batch that disagrees with a stored slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Below,
    Above,
}

impl FetchQueue {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            header_batch: config.header_batch,
            body_batch: config.body_batch,
            receipt_batch: config.receipt_batch,
            state_batch: config.state_batch,
            max_pending: config.max_pending_results,
            resume: config.resume_results(),
            requirements: Requirements::default(),
            anchor: Anchor {
                number: 0,
                hash: B256::ZERO,
                header: None,
            },
            starting: 0,
            target_number: 0,
            target_hash: B256::ZERO,
            next_pop: 1,
            highest_header: 0,
            header_pending: BTreeMap::new(),
            body_pending: BTreeSet::new(),
            receipt_pending: BTreeSet::new(),
            reserved: HashMap::new(),
            next_task_id: 1,
            slots: BTreeMap::new(),
            throttled: false,
            state: None,
            discovered_root: None,
            trusted: None,
            disputed: BTreeSet::new(),
            displaced: Vec::new(),
        }
    }

    /// Discard everything and schedule headers from just after `anchor` up to
    /// the target.
    pub fn prepare(
        &mut self,
        anchor: &BlockHeader,
        target_number: u64,
        target_hash: B256,
        requirements: Requirements,
    ) {
        self.reset();
        self.requirements = requirements;
        self.anchor = Anchor {
            number: anchor.number,
            hash: anchor.hash(),
            header: Some(anchor.clone()),
        };
        self.starting = anchor.number;
        self.target_number = target_number;
        self.target_hash = target_hash;
        self.next_pop = anchor.number + 1;
        self.highest_header = anchor.number;
        if target_number > anchor.number {
            self.enqueue_range(DataKind::Header, anchor.number + 1, target_number);
        }
        debug!(
            from = anchor.number + 1,
            to = target_number,
            "queue prepared"
        );
    }

    /// Drop all work and results. Reserved tasks are forgotten; their answers
    /// will be rejected as unknown tasks.
    pub fn reset(&mut self) {
        self.header_pending.clear();
        self.body_pending.clear();
        self.receipt_pending.clear();
        self.reserved.clear();
        self.slots.clear();
        self.throttled = false;
        self.state = None;
        self.discovered_root = None;
        self.requirements = Requirements::default();
        self.trusted = None;
        self.disputed.clear();
        self.displaced.clear();
    }

    /// Name the peer whose headers settle conflicts between slots.
    pub fn set_trusted(&mut self, peer: PeerId) {
        self.trusted = Some(peer);
    }

    /// Peers whose deliveries were displaced since the last call.
    pub fn take_displaced(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.displaced)
    }

    pub fn is_disputed(&self, from: u64) -> bool {
        self.disputed.contains(&from)
    }

    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    /// Schedule work. Headers are split into batches; bodies and receipts are
    /// scheduled for numbers whose header is already in the queue. State is
    /// scheduled by hash through [`FetchQueue::begin_state`].
    pub fn enqueue_range(&mut self, kind: DataKind, from: u64, to: u64) {
        match kind {
            DataKind::Header => {
                let mut n = from;
                while n <= to {
                    let count = self.header_batch.min(to - n + 1);
                    self.header_pending.insert(n, count);
                    n += count;
                }
            }
            DataKind::Body | DataKind::Receipt => {
                let reserved: HashSet<u64> = self
                    .reserved
                    .values()
                    .filter(|t| t.kind == kind)
                    .filter_map(|t| match &t.items {
                        TaskItems::Blocks(numbers) => Some(numbers.iter().copied()),
                        _ => None,
                    })
                    .flatten()
                    .collect();
                let wanted: Vec<u64> = self
                    .slots
                    .range(from..=to)
                    .filter(|(n, slot)| !reserved.contains(*n) && self.wants(kind, **n, slot))
                    .map(|(n, _)| *n)
                    .collect();
                let backlog = match kind {
                    DataKind::Body => &mut self.body_pending,
                    _ => &mut self.receipt_pending,
                };
                backlog.extend(wanted);
            }
            DataKind::State => {}
        }
    }

    fn wants(&self, kind: DataKind, number: u64, slot: &ResultSlot) -> bool {
        match kind {
            DataKind::Body => self.requirements.bodies && slot.body.is_none(),
            DataKind::Receipt => self.requirements.needs_receipts(number) && slot.receipts.is_none(),
            _ => false,
        }
    }

    fn header_capacity(&mut self) -> bool {
        let reserved_headers: u64 = self
            .reserved
            .values()
            .filter_map(|t| match t.items {
                TaskItems::Headers { count, .. } => Some(count),
                _ => None,
            })
            .sum();
        let outstanding = self.slots.len() + reserved_headers as usize;
        if self.throttled {
            if outstanding >= self.resume {
                return false;
            }
            self.throttled = false;
        }
        if outstanding + self.header_batch as usize > self.max_pending {
            debug!(outstanding, "header scheduling throttled");
            self.throttled = true;
            return false;
        }
        true
    }

    /// Reserve the next task of `kind` that a peer advertising `peer_height`
    /// can serve.
    pub fn reserve(
        &mut self,
        kind: DataKind,
        peer: &PeerId,
        peer_height: u64,
    ) -> Option<(TaskId, Request)> {
        let (items, request) = match kind {
            DataKind::Header => {
                if self.header_pending.is_empty() || !self.header_capacity() {
                    return None;
                }
                let trusted = self.trusted == Some(*peer);
                let (from, count) = self
                    .header_pending
                    .iter()
                    .find(|(&from, &count)| {
                        from + count - 1 <= peer_height && (trusted || !self.disputed.contains(&from))
                    })
                    .map(|(&f, &c)| (f, c))?;
                self.header_pending.remove(&from);
                (
                    TaskItems::Headers { from, count },
                    Request::Headers {
                        origin: HashOrNumber::Number(from),
                        amount: count,
                        skip: 0,
                        reverse: false,
                    },
                )
            }
            DataKind::Body | DataKind::Receipt => {
                let (backlog, batch) = match kind {
                    DataKind::Body => (&mut self.body_pending, self.body_batch),
                    _ => (&mut self.receipt_pending, self.receipt_batch),
                };
                let numbers: Vec<u64> = backlog
                    .iter()
                    .copied()
                    .take_while(|&n| n <= peer_height)
                    .take(batch)
                    .collect();
                if numbers.is_empty() {
                    return None;
                }
                for n in &numbers {
                    backlog.remove(n);
                }
                let hashes: Vec<B256> = numbers
                    .iter()
                    .filter_map(|n| self.slots.get(n).map(|s| s.hash))
                    .collect();
                let request = match kind {
                    DataKind::Body => Request::Bodies(hashes),
                    _ => Request::Receipts(hashes),
                };
                (TaskItems::Blocks(numbers), request)
            }
            DataKind::State => {
                let pivot = self.requirements.state_from?;
                if peer_height < pivot {
                    return None;
                }
                let batch = self.state_batch;
                let state = self.state.as_mut()?;
                if state.pending.is_empty() {
                    return None;
                }
                let take = batch.min(state.pending.len());
                let hashes: Vec<B256> = state.pending.drain(..take).collect();
                (TaskItems::State(hashes.clone()), Request::StateNodes(hashes))
            }
        };
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.reserved.insert(
            id,
            Task {
                id,
                kind,
                peer: *peer,
                items,
            },
        );
        Some((id, request))
    }

    fn take_task(&mut self, id: TaskId, kind: DataKind) -> Result<Task, DeliveryError> {
        match self.reserved.get(&id).map(|t| t.kind == kind) {
            Some(true) => self.reserved.remove(&id).ok_or(DeliveryError::UnknownTask(id)),
            Some(false) => {
                self.release_task(id);
                Err(DeliveryError::WrongKind)
            }
            None => Err(DeliveryError::UnknownTask(id)),
        }
    }

    fn requeue(&mut self, kind: DataKind, items: TaskItems) {
        match items {
            TaskItems::Headers { from, count } => {
                self.header_pending.insert(from, count);
            }
            TaskItems::Blocks(numbers) => {
                let backlog = match kind {
                    DataKind::Body => &mut self.body_pending,
                    _ => &mut self.receipt_pending,
                };
                backlog.extend(numbers);
            }
            TaskItems::State(hashes) => {
                if let Some(state) = self.state.as_mut() {
                    for hash in hashes.into_iter().rev() {
                        state.pending.push_front(hash);
                    }
                }
            }
        }
    }

    /// Return a task's items to the backlog.
    pub fn release_task(&mut self, id: TaskId) -> bool {
        match self.reserved.remove(&id) {
            Some(task) => {
                self.requeue(task.kind, task.items);
                true
            }
            None => false,
        }
    }

    /// Return every task reserved by `peer` to the backlog.
    pub fn release_peer(&mut self, peer: &PeerId) -> usize {
        let ids: Vec<TaskId> = self
            .reserved
            .values()
            .filter(|t| t.peer == *peer)
            .map(|t| t.id)
            .collect();
        for id in &ids {
            self.release_task(*id);
        }
        if !ids.is_empty() {
            debug!(peer = %short_id(peer), tasks = ids.len(), "released peer tasks");
        }
        ids.len()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.reserved.get(&id)
    }

    /// Accept a header batch. The batch is rejected whole if any header is out
    /// of sequence, breaks the hash chain (inside the batch, against the
    /// anchor or the target), or fails `validate`.
    ///
    /// A batch that disagrees with a neighbouring slot is settled by the
    /// trusted peer: a slot it delivered rejects the batch, a batch it
    /// delivered displaces the neighbouring run (see
    /// [`FetchQueue::take_displaced`]). Between two other peers both ranges
    /// are dropped and left to the trusted peer.
    ///
    /// A short batch is accepted and the rest of the range rescheduled.
    pub fn deliver_headers(
        &mut self,
        id: TaskId,
        peer: &PeerId,
        headers: Vec<BlockHeader>,
        validate: impl Fn(&BlockHeader, &BlockHeader) -> Result<(), ConsensusError>,
    ) -> Result<usize, DeliveryError> {
        let task = self.take_task(id, DataKind::Header)?;
        let TaskItems::Headers { from, count } = task.items else {
            return Err(DeliveryError::WrongKind);
        };
        let (hashes, conflicts) = match self.check_headers(from, count, &headers, &validate) {
            Ok(checked) => checked,
            Err(e) => {
                self.header_pending.insert(from, count);
                return Err(e);
            }
        };
        let delivered = headers.len() as u64;
        let last = from + delivered - 1;
        if let Some(&(_, number)) = conflicts.first() {
            let trusted_slot = conflicts.iter().any(|&(side, _)| {
                let n = match side {
                    Side::Below => from - 1,
                    Side::Above => last + 1,
                };
                self.slots
                    .get(&n)
                    .is_some_and(|slot| Some(slot.delivered_by) == self.trusted)
            });
            if trusted_slot {
                self.header_pending.insert(from, count);
                return Err(DeliveryError::BrokenChain { number });
            }
            let trusted = self.trusted == Some(*peer);
            for &(side, _) in &conflicts {
                let start = match side {
                    Side::Below => from - 1,
                    Side::Above => last + 1,
                };
                let peers = self.displace_run(start, side, !trusted);
                if trusted {
                    for p in peers {
                        if !self.displaced.contains(&p) {
                            self.displaced.push(p);
                        }
                    }
                }
            }
            if !trusted {
                self.header_pending.insert(from, count);
                self.disputed.insert(from);
                debug!(peer = %short_id(peer), from, number, "conflicting header ranges left to target");
                return Err(DeliveryError::Disputed { number });
            }
        }
        self.disputed.remove(&from);
        if delivered < count {
            self.header_pending.insert(from + delivered, count - delivered);
        }
        for (header, hash) in headers.into_iter().zip(hashes) {
            self.insert_slot(header, hash, *peer);
        }
        self.enqueue_range(DataKind::Body, from, last);
        self.enqueue_range(DataKind::Receipt, from, last);
        Ok(delivered as usize)
    }

    fn check_headers(
        &self,
        from: u64,
        count: u64,
        headers: &[BlockHeader],
        validate: &impl Fn(&BlockHeader, &BlockHeader) -> Result<(), ConsensusError>,
    ) -> Result<(Vec<B256>, Vec<(Side, u64)>), DeliveryError> {
        if headers.is_empty() {
            return Err(DeliveryError::Empty);
        }
        if headers.len() as u64 > count {
            return Err(DeliveryError::TooMany {
                requested: count as usize,
                got: headers.len(),
            });
        }
        let hashes: Vec<B256> = headers.iter().map(BlockHeader::hash).collect();
        for (i, header) in headers.iter().enumerate() {
            let expected = from + i as u64;
            if header.number != expected {
                return Err(DeliveryError::OutOfSequence {
                    expected,
                    got: header.number,
                });
            }
            if i > 0 {
                if header.parent_hash != hashes[i - 1] {
                    return Err(DeliveryError::BrokenChain {
                        number: header.number,
                    });
                }
                validate(header, &headers[i - 1]).map_err(|source| {
                    DeliveryError::InvalidHeader {
                        number: header.number,
                        source,
                    }
                })?;
            }
        }

        let mut conflicts = Vec::new();
        let first = &headers[0];
        if from == self.anchor.number + 1 {
            if first.parent_hash != self.anchor.hash {
                return Err(DeliveryError::BrokenChain { number: from });
            }
            if let Some(parent) = &self.anchor.header {
                validate(first, parent).map_err(|source| DeliveryError::InvalidHeader {
                    number: from,
                    source,
                })?;
            }
        } else if let Some(prev) = self.slots.get(&(from - 1)) {
            if first.parent_hash != prev.hash {
                conflicts.push((Side::Below, from));
            } else {
                validate(first, &prev.header).map_err(|source| DeliveryError::InvalidHeader {
                    number: from,
                    source,
                })?;
            }
        }

        let last_index = headers.len() - 1;
        let last_number = headers[last_index].number;
        let last_hash = hashes[last_index];
        if let Some(next) = self.slots.get(&(last_number + 1)) {
            if next.header.parent_hash != last_hash {
                conflicts.push((Side::Above, last_number + 1));
            }
        }
        if last_number == self.target_number && last_hash != self.target_hash {
            return Err(DeliveryError::TargetMismatch {
                number: last_number,
            });
        }
        Ok((hashes, conflicts))
    }

    /// Drop the run of slots starting at `start` and extending away from the
    /// delivered batch, up to a gap or a slot the trusted peer delivered.
    /// Everything built on those slots is dropped with them and their header
    /// ranges are rescheduled. Returns the peers that delivered the run.
    fn displace_run(&mut self, start: u64, side: Side, dispute: bool) -> Vec<PeerId> {
        let mut numbers = Vec::new();
        let mut n = start;
        while let Some(slot) = self.slots.get(&n) {
            if Some(slot.delivered_by) == self.trusted {
                break;
            }
            numbers.push(n);
            n = match side {
                Side::Below if n > self.anchor.number + 1 => n - 1,
                Side::Below => break,
                Side::Above => n + 1,
            };
        }
        numbers.sort_unstable();
        let (Some(&lo), Some(&hi)) = (numbers.first(), numbers.last()) else {
            return Vec::new();
        };

        let mut peers = Vec::new();
        for n in &numbers {
            if let Some(slot) = self.slots.remove(n) {
                if !peers.contains(&slot.delivered_by) {
                    peers.push(slot.delivered_by);
                }
            }
            self.body_pending.remove(n);
            self.receipt_pending.remove(n);
        }

        // Body and receipt tasks touching the run are void; their answers
        // will come back as unknown tasks.
        let void: Vec<TaskId> = self
            .reserved
            .values()
            .filter(|t| match &t.items {
                TaskItems::Blocks(ns) => ns.iter().any(|n| (lo..=hi).contains(n)),
                _ => false,
            })
            .map(|t| t.id)
            .collect();
        for id in void {
            if let Some(task) = self.reserved.remove(&id) {
                if let TaskItems::Blocks(ns) = task.items {
                    let keep: Vec<u64> = ns.into_iter().filter(|n| !(lo..=hi).contains(n)).collect();
                    self.requeue(task.kind, TaskItems::Blocks(keep));
                }
            }
        }

        if self.requirements.state_from.is_some_and(|p| (lo..=hi).contains(&p)) {
            self.state = None;
            self.discovered_root = None;
            self.reserved.retain(|_, t| t.kind != DataKind::State);
        }

        let mut from = lo;
        while from <= hi {
            let count = self.header_batch.min(hi - from + 1);
            self.header_pending.insert(from, count);
            if dispute {
                self.disputed.insert(from);
            }
            from += count;
        }
        self.highest_header = self
            .slots
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.anchor.number)
            .max(self.anchor.number);
        debug!(from = lo, to = hi, "displaced conflicting header slots");
        peers
    }

    fn insert_slot(&mut self, header: BlockHeader, hash: B256, peer: PeerId) {
        let number = header.number;
        let body = (self.requirements.bodies && header.has_empty_body()).then(BlockBody::default);
        let receipts =
            (self.requirements.needs_receipts(number) && header.has_empty_receipts()).then(Vec::new);
        if self.requirements.state_from == Some(number) && self.state.is_none() {
            self.discovered_root = Some(header.state_root);
        }
        self.highest_header = self.highest_header.max(number);
        self.slots.insert(
            number,
            ResultSlot {
                header,
                hash,
                body,
                receipts,
                delivered_by: peer,
            },
        );
    }

    /// Accept bodies for a task. Any body that does not match its header's
    /// transaction root and uncle hash rejects the whole batch.
    pub fn deliver_bodies(&mut self, id: TaskId, bodies: Vec<BlockBody>) -> Result<usize, DeliveryError> {
        let task = self.take_task(id, DataKind::Body)?;
        let TaskItems::Blocks(numbers) = task.items else {
            return Err(DeliveryError::WrongKind);
        };
        if let Err(e) = self.check_blocks(&numbers, bodies.len(), |i, slot| bodies[i].matches(&slot.header)) {
            self.body_pending.extend(numbers);
            return Err(e);
        }
        let delivered = bodies.len();
        for (n, body) in numbers.iter().zip(bodies) {
            if let Some(slot) = self.slots.get_mut(n) {
                slot.body = Some(body);
            }
        }
        self.body_pending.extend(numbers[delivered..].iter().copied());
        Ok(delivered)
    }

    /// Accept receipts for a task, checked against each header's receipts root.
    pub fn deliver_receipts(
        &mut self,
        id: TaskId,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<usize, DeliveryError> {
        let task = self.take_task(id, DataKind::Receipt)?;
        let TaskItems::Blocks(numbers) = task.items else {
            return Err(DeliveryError::WrongKind);
        };
        if let Err(e) = self.check_blocks(&numbers, receipts.len(), |i, slot| {
            receipts_root(&receipts[i]) == slot.header.receipts_root
        }) {
            self.receipt_pending.extend(numbers);
            return Err(e);
        }
        let delivered = receipts.len();
        for (n, r) in numbers.iter().zip(receipts) {
            if let Some(slot) = self.slots.get_mut(n) {
                slot.receipts = Some(r);
            }
        }
        self.receipt_pending.extend(numbers[delivered..].iter().copied());
        Ok(delivered)
    }

    fn check_blocks(
        &self,
        numbers: &[u64],
        delivered: usize,
        matches: impl Fn(usize, &ResultSlot) -> bool,
    ) -> Result<(), DeliveryError> {
        if delivered == 0 {
            return Err(DeliveryError::Empty);
        }
        if delivered > numbers.len() {
            return Err(DeliveryError::TooMany {
                requested: numbers.len(),
                got: delivered,
            });
        }
        for (i, n) in numbers.iter().take(delivered).enumerate() {
            match self.slots.get(n) {
                Some(slot) if matches(i, slot) => {}
                _ => return Err(DeliveryError::Mismatch { index: i }),
            }
        }
        Ok(())
    }

    /// Root of the pivot state, once the pivot header has arrived. Returned
    /// once; the caller answers with [`FetchQueue::begin_state`].
    pub fn take_state_start(&mut self) -> Option<B256> {
        self.discovered_root.take()
    }

    /// Start fetching the state trie under `root`. `present` means the root is
    /// already stored locally and nothing needs fetching.
    pub fn begin_state(&mut self, root: B256, present: bool) {
        let mut known = HashSet::new();
        known.insert(root);
        let mut pending = VecDeque::new();
        if !present {
            pending.push_back(root);
        }
        self.state = Some(StateSchedule {
            root,
            pending,
            known,
            fetched: 0,
            complete: present,
        });
        debug!(root = %root, present, "state sync scheduled");
    }

    /// Accept state nodes. Every node must hash to one of the requested
    /// hashes, each at most once. Children not yet scheduled this session and
    /// not stored locally (`has_node`) are scheduled. Returns the accepted
    /// nodes for the caller to store.
    pub fn deliver_state(
        &mut self,
        id: TaskId,
        nodes: Vec<StateNode>,
        has_node: impl Fn(&B256) -> bool,
    ) -> Result<Vec<StateNode>, DeliveryError> {
        let task = self.take_task(id, DataKind::State)?;
        let TaskItems::State(hashes) = task.items else {
            return Err(DeliveryError::WrongKind);
        };
        let mut remaining: HashSet<B256> = hashes.iter().copied().collect();
        let check = if nodes.is_empty() {
            Err(DeliveryError::Empty)
        } else if nodes.len() > hashes.len() {
            Err(DeliveryError::TooMany {
                requested: hashes.len(),
                got: nodes.len(),
            })
        } else {
            nodes
                .iter()
                .enumerate()
                .find(|(_, node)| !remaining.remove(&node.hash()))
                .map_or(Ok(()), |(index, _)| Err(DeliveryError::Mismatch { index }))
        };
        if let Err(e) = check {
            self.requeue(DataKind::State, TaskItems::State(hashes));
            return Err(e);
        }

        let leftover: Vec<B256> = hashes.into_iter().filter(|h| remaining.contains(h)).collect();
        self.requeue(DataKind::State, TaskItems::State(leftover));
        if let Some(state) = self.state.as_mut() {
            for node in &nodes {
                state.fetched += 1;
                for child in &node.children {
                    if state.known.insert(*child) && !has_node(child) {
                        state.pending.push_back(*child);
                    }
                }
            }
        }
        self.update_state_complete();
        Ok(nodes)
    }

    fn update_state_complete(&mut self) {
        let state_reserved = self.reserved.values().any(|t| t.kind == DataKind::State);
        if let Some(state) = self.state.as_mut() {
            if !state.complete && state.pending.is_empty() && !state_reserved {
                state.complete = true;
                debug!(root = %state.root, nodes = state.fetched, "state sync complete");
            }
        }
    }

    pub fn state_complete(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.complete)
    }

    fn slot_complete(&self, number: u64, slot: &ResultSlot) -> bool {
        (!self.requirements.bodies || slot.body.is_some())
            && (!self.requirements.needs_receipts(number) || slot.receipts.is_some())
    }

    /// Next block in order if it is complete. Blocks at or after the state
    /// pivot also wait for the state sync.
    pub fn pop_ready(&mut self) -> Option<ReadyBlock> {
        let number = self.next_pop;
        let slot = self.slots.get(&number)?;
        if !self.slot_complete(number, slot) {
            return None;
        }
        if let Some(pivot) = self.requirements.state_from {
            if number >= pivot && !self.state_complete() {
                return None;
            }
        }
        let slot = self.slots.remove(&number)?;
        self.next_pop += 1;
        self.anchor = Anchor {
            number,
            hash: slot.hash,
            header: Some(slot.header.clone()),
        };
        Some(ReadyBlock {
            mode: self.requirements.import_mode(number),
            delivered_by: slot.delivered_by,
            block: SyncedBlock {
                header: slot.header,
                hash: slot.hash,
                body: slot.body,
                receipts: slot.receipts,
            },
        })
    }

    /// Ordered, gap-free run of ready blocks.
    pub fn drain(&mut self) -> impl Iterator<Item = ReadyBlock> + '_ {
        std::iter::from_fn(move || self.pop_ready())
    }

    /// Whether every block up to the target has left the queue.
    pub fn is_complete(&self) -> bool {
        self.next_pop > self.target_number
    }

    pub fn has_work(&self, kind: DataKind) -> bool {
        let reserved = self.reserved.values().any(|t| t.kind == kind);
        reserved
            || match kind {
                DataKind::Header => !self.header_pending.is_empty(),
                DataKind::Body => !self.body_pending.is_empty(),
                DataKind::Receipt => !self.receipt_pending.is_empty(),
                DataKind::State => self.state.as_ref().is_some_and(|s| !s.complete),
            }
    }

    pub fn has_pending(&self, kind: DataKind) -> bool {
        match kind {
            DataKind::Header => !self.header_pending.is_empty(),
            DataKind::Body => !self.body_pending.is_empty(),
            DataKind::Receipt => !self.receipt_pending.is_empty(),
            DataKind::State => self.state.as_ref().is_some_and(|s| !s.pending.is_empty()),
        }
    }

    /// Whether `number` falls in the range this session will import.
    pub fn covers(&self, number: u64) -> bool {
        number > self.starting && number <= self.target_number
    }

    pub fn pending_results(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    pub fn progress(&self) -> QueueProgress {
        let current = self.next_pop.saturating_sub(1);
        let filled = |has: fn(&ResultSlot) -> bool| {
            self.slots
                .iter()
                .rev()
                .find(|(_, slot)| has(slot))
                .map_or(current, |(n, _)| (*n).max(current))
        };
        let bodies = if self.requirements.bodies {
            filled(|s| s.body.is_some())
        } else {
            self.starting
        };
        let receipts = match self.requirements.receipts_through {
            Some(pivot) => filled(|s| s.receipts.is_some()).min(pivot.max(self.starting)),
            None => self.starting,
        };
        QueueProgress {
            starting: self.starting,
            current,
            highest: self.target_number,
            headers: self.highest_header,
            bodies,
            receipts,
            state_fetched: self.state.as_ref().map_or(0, |s| s.fetched),
            state_pending: self.state.as_ref().map_or(0, |s| s.pending.len() as u64),
        }
    }
}
