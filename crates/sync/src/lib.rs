pub mod config;
pub mod consensus;
pub mod dispatch;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod import;
pub mod metrics;
pub mod peers;
pub mod queue;
pub mod store;
pub mod types;

pub use config::{Checkpoint, ConfigError, FetcherConfig, SyncConfig, SyncMode};
pub use consensus::{Consensus, ConsensusError, SanityConsensus};
pub use downloader::Stage;
pub use engine::{Engine, EngineEvent, EngineHandle, SyncStatus};
pub use error::{DeliveryError, SyncError};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use store::{ChainStore, ImportMode, MemoryStore, StoreError, SyncedBlock};
pub use types::{DataKind, HashOrNumber, PeerHead, PeerId, Request, Response};

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Outbound side of the peer-to-peer layer. Answers come back to the engine
/// as [`EngineEvent::Response`] carrying the same request id.
pub trait SyncTransport: Send + Sync {
    /// Queue `request` for `peer`. Returns `false` if the peer is gone or its
    /// outbound queue is full; nothing will be answered in that case.
    fn send_request(
        &self,
        peer: &PeerId,
        request_id: u64,
        request: Request,
    ) -> impl std::future::Future<Output = bool> + Send;

    /// Drop the session with a peer the engine has given up on.
    fn disconnect_peer(&self, peer: &PeerId) -> impl std::future::Future<Output = ()> + Send;
}
