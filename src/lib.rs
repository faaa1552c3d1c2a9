//! # Galena - Blockchain Peer-to-Peer Networking Core
//!
//! Galena is the networking core of a blockchain node: it discovers peers,
//! maintains a structured overlay of neighbors, and exchanges authenticated
//! messages carrying block and transaction data.
//!
//! Two tightly coupled pieces make up the core:
//!
//! - **Signed message codec**: typed requests/responses framed onto a
//!   multi-part transport, with a secp256k1 signature over every body
//! - **Kademlia-style routing**: peers organized by XOR distance from the
//!   local 20-byte address, in bounded buckets with a liveness-probed
//!   eviction policy and replacement caches
//!
//! Blockchain state, validation, consensus and the concrete socket layer
//! live elsewhere; the driver reaches them through the trait seams in
//! [`protocols`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs, addresses, peers, XOR-distance arithmetic |
//! | `routing` | K-buckets and the mutex-guarded routing table |
//! | `messages` | Wire taxonomy and the signing/verifying frame codec |
//! | `protocols` | Transport and chain collaborator traits |
//! | `overlay` | Protocol driver: bootstrap, refresh, rebuild, dispatch |
//!
//! ## Concurrency Model
//!
//! The routing table is the only shared mutable structure, guarded by a
//! single mutex that is never held across I/O. Long-running activities are
//! cooperative tasks accepting a `CancellationToken`; a timeout anywhere is
//! treated the same as the peer being unresponsive.

mod identity;
mod messages;
mod overlay;
mod protocols;
mod routing;

pub use identity::{
    common_prefix_length, distance_cmp, sort_by_distance, verify_signature, Address, BoundPeer,
    Keypair, Peer, ADDRESS_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};
pub use messages::{
    deserialize_bounded, BlockHash, Message, MessageBody, MessageError, ParsedMessage,
    PeerSetDelta, TxId,
};
pub use overlay::{
    Cancelled, Overlay, OverlayConfig, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_SIZE,
};
pub use protocols::{ChainStore, PeerTransport, SyncHandler};
pub use routing::{BucketSnapshot, KBucket, RoutingError, RoutingTable};
