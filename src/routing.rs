//! # Kademlia-Style Peer Routing
//!
//! XOR-metric routing over 20-byte addresses, organized as an array of
//! k-buckets indexed by common prefix length with the local address.
//!
//! ## Bucket Organization
//!
//! Bucket `i` holds peers whose common-prefix-length with the local address
//! equals `i`; peers with a prefix of `table_size - 1` bits or more all share
//! the top bucket. Within a bucket, order is recency of contact: head is the
//! least-recently-seen peer, tail the most.
//!
//! ## Eviction Discipline
//!
//! A full bucket never drops its head eagerly. The incoming peer goes into a
//! bounded replacement cache and the head is returned to the caller as a
//! candidate for a liveness probe. If the head answers it is kept; if not,
//! the driver removes it and promotes the newest cached replacement. See
//! [`KBucket::add_peer`] and the driver's replacement check.
//!
//! ## Concurrency
//!
//! All bucket state sits behind a single mutex inside [`RoutingTable`].
//! Mutations are synchronous and the lock is never held across I/O; read
//! operations return snapshots.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use tokio::time::{Duration, Instant};

use crate::identity::{
    common_prefix_length, sort_by_distance, Address, BoundPeer, ADDRESS_LEN,
};

// ============================================================================
// Errors
// ============================================================================

/// Structural routing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    /// A size parameter was zero at construction. Fatal.
    OutOfRange {
        param: &'static str,
        value: usize,
    },
    /// The local peer was passed to an add/remove operation. Programmer
    /// error; the table never contains the local address.
    SelfPeer,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::OutOfRange { param, value } => {
                write!(f, "routing parameter {param} out of range: {value}")
            }
            RoutingError::SelfPeer => write!(f, "local peer cannot be routed to itself"),
        }
    }
}

impl std::error::Error for RoutingError {}

// ============================================================================
// KBucket
// ============================================================================

#[derive(Debug, Clone)]
struct BucketEntry {
    peer: BoundPeer,
    last_updated: Instant,
}

/// Bounded recency-ordered peer list with a secondary replacement cache.
///
/// Holds up to `capacity` peers, newest at the tail, plus up to `capacity`
/// replacement candidates that arrived while the bucket was full (newest
/// first).
#[derive(Debug, Clone)]
pub struct KBucket {
    capacity: usize,
    entries: Vec<BucketEntry>,
    replacements: VecDeque<BoundPeer>,
}

impl KBucket {
    /// An empty bucket holding up to `capacity` peers and as many
    /// replacement candidates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
            replacements: VecDeque::new(),
        }
    }

    /// Record contact with `peer`.
    ///
    /// - already present: moved to the tail, timestamp refreshed, `None`;
    /// - room left: appended at the tail, `None`;
    /// - full: `peer` enters the replacement cache (bumped to newest if
    ///   already cached, oldest candidate evicted if the cache is full) and
    ///   the current head is returned for a liveness probe.
    pub fn add_peer(&mut self, peer: BoundPeer) -> Option<BoundPeer> {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.peer.address == peer.address)
        {
            self.entries.remove(pos);
            self.entries.push(BucketEntry {
                peer,
                last_updated: Instant::now(),
            });
            return None;
        }

        if self.entries.len() < self.capacity {
            self.entries.push(BucketEntry {
                peer,
                last_updated: Instant::now(),
            });
            return None;
        }

        self.cache_replacement(peer);
        self.entries.first().map(|e| e.peer.clone())
    }

    fn cache_replacement(&mut self, peer: BoundPeer) {
        if let Some(pos) = self
            .replacements
            .iter()
            .position(|p| p.address == peer.address)
        {
            let _ = self.replacements.remove(pos);
        }
        self.replacements.push_front(peer);
        while self.replacements.len() > self.capacity {
            self.replacements.pop_back();
        }
    }

    /// Remove a peer by address equality. Returns whether it was present.
    /// Does not promote from the replacement cache; that is the driver's
    /// decision after a liveness probe.
    pub fn remove_peer(&mut self, address: &Address) -> bool {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.peer.address == *address)
        {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove and return the newest replacement candidate.
    pub fn pop_replacement(&mut self) -> Option<BoundPeer> {
        self.replacements.pop_front()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.iter().any(|e| e.peer.address == *address)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn replacement_len(&self) -> usize {
        self.replacements.len()
    }

    /// Snapshot of the bucket's peers, head (least-recently-seen) first.
    pub fn peers(&self) -> Vec<BoundPeer> {
        self.entries.iter().map(|e| e.peer.clone()).collect()
    }

    /// Least-recently-seen peer, the eviction candidate when full.
    pub fn head(&self) -> Option<BoundPeer> {
        self.entries.first().map(|e| e.peer.clone())
    }

    /// Most-recently-seen peer.
    pub fn tail(&self) -> Option<BoundPeer> {
        self.entries.last().map(|e| e.peer.clone())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.replacements.clear();
    }

    /// Timestamp of the most recent contact in this bucket, if any.
    fn last_updated(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.last_updated).max()
    }

    fn ages(&self) -> Vec<(BoundPeer, Duration)> {
        self.entries
            .iter()
            .map(|e| (e.peer.clone(), e.last_updated.elapsed()))
            .collect()
    }
}

// ============================================================================
// RoutingTable
// ============================================================================

/// Per-bucket snapshot used for diagnostics and maintenance decisions.
#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub index: usize,
    /// Peers with the elapsed time since their last contact, head first.
    pub peers: Vec<(BoundPeer, Duration)>,
    pub replacement_len: usize,
}

/// Fixed-size array of k-buckets keyed by common prefix length with the
/// local address.
///
/// Owns its buckets exclusively; every mutation goes through the single
/// internal mutex. The local address is never inserted.
pub struct RoutingTable {
    local: Address,
    table_size: usize,
    bucket_size: usize,
    buckets: Mutex<Vec<KBucket>>,
}

impl RoutingTable {
    /// Construct a table of `table_size` buckets of `bucket_size` peers.
    ///
    /// Zero-valued sizes are rejected with [`RoutingError::OutOfRange`].
    pub fn new(
        local: Address,
        table_size: usize,
        bucket_size: usize,
    ) -> Result<Self, RoutingError> {
        if table_size == 0 {
            return Err(RoutingError::OutOfRange {
                param: "table_size",
                value: table_size,
            });
        }
        if bucket_size == 0 {
            return Err(RoutingError::OutOfRange {
                param: "bucket_size",
                value: bucket_size,
            });
        }
        let buckets = (0..table_size).map(|_| KBucket::new(bucket_size)).collect();
        Ok(Self {
            local,
            table_size,
            bucket_size,
            buckets: Mutex::new(buckets),
        })
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    // Mutations are plain data edits; a poisoned lock still holds a
    // structurally valid table, so recover the guard instead of unwinding.
    fn lock(&self) -> MutexGuard<'_, Vec<KBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bucket index a given address belongs to:
    /// `min(common_prefix_length(address, local), table_size - 1)`.
    pub fn bucket_index_of(&self, address: &Address) -> usize {
        common_prefix_length(address, &self.local).min(self.table_size - 1)
    }

    fn check_not_self(&self, address: &Address) -> Result<(), RoutingError> {
        if *address == self.local {
            return Err(RoutingError::SelfPeer);
        }
        Ok(())
    }

    /// Record contact with a peer, delegating to its bucket's
    /// [`KBucket::add_peer`]. Returns any candidate-for-eviction bubbled up
    /// from a full bucket.
    pub fn add_peer(&self, peer: BoundPeer) -> Result<Option<BoundPeer>, RoutingError> {
        self.check_not_self(&peer.address)?;
        let idx = self.bucket_index_of(&peer.address);
        Ok(self.lock()[idx].add_peer(peer))
    }

    /// Remove a peer by address. Returns whether it was present.
    pub fn remove_peer(&self, peer: &BoundPeer) -> Result<bool, RoutingError> {
        self.check_not_self(&peer.address)?;
        let idx = self.bucket_index_of(&peer.address);
        Ok(self.lock()[idx].remove_peer(&peer.address))
    }

    pub fn contains(&self, address: &Address) -> bool {
        if *address == self.local {
            return false;
        }
        let idx = self.bucket_index_of(address);
        self.lock()[idx].contains(address)
    }

    /// Total peers across all buckets.
    pub fn len(&self) -> usize {
        self.lock().iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().iter().all(|b| b.is_empty())
    }

    /// Snapshot of one bucket's peers, head first.
    pub fn bucket_peers(&self, index: usize) -> Vec<BoundPeer> {
        self.lock()
            .get(index)
            .map(|b| b.peers())
            .unwrap_or_default()
    }

    /// Head (least-recently-seen peer) of a bucket.
    pub fn bucket_head(&self, index: usize) -> Option<BoundPeer> {
        self.lock().get(index).and_then(|b| b.head())
    }

    pub fn non_full_buckets(&self) -> Vec<usize> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_full())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn empty_buckets(&self) -> Vec<usize> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Snapshot of every peer in the table.
    pub fn peers(&self) -> Vec<BoundPeer> {
        self.lock().iter().flat_map(|b| b.peers()).collect()
    }

    /// Up to `2k` peers closest to `target` in ascending XOR distance,
    /// `target` itself excluded. The oversize factor gives lookup callers
    /// slack against peers churning away mid-round.
    pub fn neighbors(&self, target: &Address, k: usize) -> Vec<BoundPeer> {
        let mut peers = self.peers();
        sort_by_distance(&mut peers, target);
        peers.retain(|p| p.address != *target);
        peers.truncate(2 * k);
        peers
    }

    /// One random peer per non-empty bucket: a logarithmic-size gossip set.
    pub fn peers_to_broadcast(&self) -> Vec<BoundPeer> {
        let mut rng = rand::thread_rng();
        self.lock()
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| {
                let peers = b.peers();
                peers[rng.gen_range(0..peers.len())].clone()
            })
            .collect()
    }

    /// Remove and return the newest replacement candidate of a bucket.
    pub fn pop_replacement(&self, index: usize) -> Option<BoundPeer> {
        self.lock().get_mut(index).and_then(|b| b.pop_replacement())
    }

    pub fn replacement_len(&self, index: usize) -> usize {
        self.lock()
            .get(index)
            .map(|b| b.replacement_len())
            .unwrap_or(0)
    }

    /// Indices of non-empty buckets whose most recent contact is older than
    /// `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.lock()
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.last_updated()
                    .map(|t| t.elapsed() > max_age)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// A random address whose bucket index equals `index`: the distance to
    /// the local address has its first set bit at position `index`, with the
    /// remaining low bits randomized.
    pub fn random_target_in_bucket(&self, index: usize) -> Address {
        let index = index.min(self.table_size - 1).min(ADDRESS_LEN * 8 - 1);
        let local = self.local.as_bytes();

        let mut distance = [0u8; ADDRESS_LEN];
        if getrandom::getrandom(&mut distance).is_err() {
            for (i, byte) in distance.iter_mut().enumerate() {
                *byte = local[i].wrapping_add((index.wrapping_mul(i + 1)) as u8);
            }
        }

        let byte_idx = index / 8;
        let bit_pos = index % 8;
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

        let mut target = [0u8; ADDRESS_LEN];
        for i in 0..ADDRESS_LEN {
            target[i] = local[i] ^ distance[i];
        }
        Address::from_bytes(target)
    }

    /// Empty all buckets and replacement caches.
    pub fn clear(&self) {
        for bucket in self.lock().iter_mut() {
            bucket.clear();
        }
    }

    /// Per-bucket snapshots for diagnostics.
    pub fn bucket_snapshots(&self) -> Vec<BucketSnapshot> {
        self.lock()
            .iter()
            .enumerate()
            .map(|(index, b)| BucketSnapshot {
                index,
                peers: b.ages(),
                replacement_len: b.replacement_len(),
            })
            .collect()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("table_size", &self.table_size)
            .field("bucket_size", &self.bucket_size)
            .field("peers", &self.len())
            .finish()
    }
}
