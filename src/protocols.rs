//! Collaborator trait definitions for the networking core.
//!
//! The overlay driver is generic over three seams:
//!
//! | Seam | Trait | Provided by |
//! |------|-------|-------------|
//! | Transport | [`PeerTransport`] | the message-framed socket layer |
//! | Chain reads | [`ChainStore`] | blockchain storage |
//! | Sync ingest | [`SyncHandler`] | the block/transaction sync logic |
//!
//! Traits are defined here separately from implementations so the driver
//! depends only on contracts, tests can register in-memory fakes, and the
//! concrete socket/chain crates stay outside this one.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Address, BoundPeer, Peer};
use crate::messages::{BlockHash, PeerSetDelta, TxId};

/// The message-framed socket abstraction the driver sends through.
///
/// Requirements on implementations: frame boundaries are preserved within a
/// multi-part message, delivery per peer is FIFO, and `request` correlates
/// one reply with one outgoing message on a dealer-style socket. Failures
/// and timeouts surface as errors; the driver treats both as the peer being
/// unresponsive.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Fire-and-forget delivery of an already-framed message.
    async fn send(&self, to: &BoundPeer, frames: Vec<Vec<u8>>) -> Result<()>;

    /// Send framed request, await the peer's reply frames.
    async fn request(&self, to: &BoundPeer, frames: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;

    /// Ask a peer for its closest known peers to `target`.
    async fn find_peer(&self, to: &BoundPeer, target: Address) -> Result<Vec<BoundPeer>>;
}

/// Read access to the local chain, used to service peer requests.
#[async_trait]
pub trait ChainStore: Send + Sync + 'static {
    /// Hashes following the best locator match, up to and excluding `stop`.
    async fn block_hashes_after(
        &self,
        locators: &[BlockHash],
        stop: &BlockHash,
    ) -> Result<Vec<BlockHash>>;

    /// Serialized blocks for the requested hashes; unknown hashes are
    /// silently omitted.
    async fn blocks(&self, hashes: &[BlockHash]) -> Result<Vec<Vec<u8>>>;

    /// Serialized transactions for the requested ids; unknown ids are
    /// silently omitted.
    async fn transactions(&self, ids: &[TxId]) -> Result<Vec<Vec<u8>>>;
}

/// Sink for inventory and data announcements arriving from peers. The
/// driver has already verified the sender's signature and recorded the peer
/// in the routing table by the time these fire.
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    async fn on_block_hashes(&self, from: &Peer, hashes: Vec<BlockHash>);

    async fn on_tx_ids(&self, from: &Peer, ids: Vec<TxId>);

    async fn on_block(&self, from: &Peer, block: Vec<u8>);

    async fn on_tx(&self, from: &Peer, tx: Vec<u8>);

    async fn on_peer_set_delta(&self, from: &Peer, delta: PeerSetDelta);
}
