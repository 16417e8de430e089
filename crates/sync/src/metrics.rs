//! Counters for the downloader and the announcement fetcher.
//!
//! Only counting happens here; exporting the values is left to whoever holds
//! the [`SyncMetrics`] handle.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::DataKind;

#[derive(Debug, Default)]
struct KindCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Default)]
struct CategoryCounters {
    incoming: AtomicU64,
    dropped: AtomicU64,
    dos: AtomicU64,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    kinds: [KindCounters; 4],
    announces: CategoryCounters,
    broadcasts: CategoryCounters,
    fetch_headers: AtomicU64,
    fetch_bodies: AtomicU64,
    imported: AtomicU64,
}

/// How an announcement entered the fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Hash announcement.
    Announce,
    /// Full block propagation.
    Broadcast,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self, kind: DataKind, items: usize) {
        self.kinds[kind.index()]
            .received
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn dropped(&self, kind: DataKind, items: usize) {
        self.kinds[kind.index()]
            .dropped
            .fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn timed_out(&self, kind: DataKind) {
        self.kinds[kind.index()]
            .timed_out
            .fetch_add(1, Ordering::Relaxed);
    }

    fn category(&self, category: Category) -> &CategoryCounters {
        match category {
            Category::Announce => &self.announces,
            Category::Broadcast => &self.broadcasts,
        }
    }

    pub fn incoming(&self, category: Category) {
        self.category(category).incoming.fetch_add(1, Ordering::Relaxed);
    }

    pub fn category_dropped(&self, category: Category) {
        self.category(category).dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dos(&self, category: Category) {
        self.category(category).dos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_header(&self) {
        self.fetch_headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_body(&self) {
        self.fetch_bodies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn imported(&self) {
        self.imported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let kind = |k: DataKind| {
            let c = &self.kinds[k.index()];
            KindSnapshot {
                received: c.received.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
                timed_out: c.timed_out.load(Ordering::Relaxed),
            }
        };
        let category = |c: &CategoryCounters| CategorySnapshot {
            incoming: c.incoming.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            dos: c.dos.load(Ordering::Relaxed),
        };
        MetricsSnapshot {
            headers: kind(DataKind::Header),
            bodies: kind(DataKind::Body),
            receipts: kind(DataKind::Receipt),
            state: kind(DataKind::State),
            announces: category(&self.announces),
            broadcasts: category(&self.broadcasts),
            fetch_headers: self.fetch_headers.load(Ordering::Relaxed),
            fetch_bodies: self.fetch_bodies.load(Ordering::Relaxed),
            imported: self.imported.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub timed_out: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySnapshot {
    pub incoming: u64,
    pub dropped: u64,
    pub dos: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub headers: KindSnapshot,
    pub bodies: KindSnapshot,
    pub receipts: KindSnapshot,
    pub state: KindSnapshot,
    pub announces: CategorySnapshot,
    pub broadcasts: CategorySnapshot,
    pub fetch_headers: u64,
    pub fetch_bodies: u64,
    pub imported: u64,
}

impl MetricsSnapshot {
    pub fn kind(&self, kind: DataKind) -> KindSnapshot {
        match kind {
            DataKind::Header => self.headers,
            DataKind::Body => self.bodies,
            DataKind::Receipt => self.receipts,
            DataKind::State => self.state,
        }
    }
}
