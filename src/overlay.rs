//! # Overlay Protocol Driver
//!
//! Keeps the routing table healthy and turns inbound messages into routing
//! events plus outbound replies. One [`Overlay`] owns the node keypair, the
//! routing table and the collaborator seams; long-running activities
//! (bootstrap, refresh, rebuild, the receive loop feeding
//! [`Overlay::receive_message`]) are cooperative tasks multiplexed on the
//! runtime.
//!
//! ## Peer Insert State Machine
//!
//! ```text
//! New → CPL-indexed bucket
//!   bucket not full        → Active (in-bucket)
//!   bucket full, head live → Replacement-Cached
//!   bucket full, head dead → head Removed; New → Active
//! Active on new contact    → moved to tail (MRU)
//! Active on probe timeout  → Removed; newest Replacement promoted
//! ```
//!
//! Eviction candidates bubbled up by a full bucket are liveness-probed, with
//! a bounded LRU guard so a chatty peer cannot make the driver re-ping the
//! same head over and over.
//!
//! ## Cancellation
//!
//! Every long-running operation takes a [`CancellationToken`]. Cancellation
//! abandons in-flight network I/O; routing mutations already committed stay.

use std::collections::HashSet;
use std::fmt;
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use lru::LruCache;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{distance_cmp, sort_by_distance, Address, BoundPeer, Keypair};
use crate::messages::{Message, MessageBody, PeerSetDelta};
use crate::protocols::{ChainStore, PeerTransport, SyncHandler};
use crate::routing::{RoutingError, RoutingTable};

/// Default number of buckets: one per address bit.
pub const DEFAULT_TABLE_SIZE: usize = 160;

/// Default bucket capacity (Kademlia k).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Default concurrency factor for lookup rounds (Kademlia α).
pub const DEFAULT_ALPHA: usize = 3;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_FIND_PEER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LOOKUP_ROUND_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on lookup rounds; keeps sparse or adversarial networks from
/// spinning a lookup forever.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Capacity of the probe-dedup cache.
const PROBE_GUARD_CAPACITY: usize = 1024;

/// A head probed within this window is not probed again by the insert path.
const PROBE_GUARD_WINDOW: Duration = Duration::from_secs(30);

// ============================================================================
// Errors / Config
// ============================================================================

/// Cooperative cancellation. Propagates upward; routing state stays
/// consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Driver construction parameters. Zero-valued sizes fail construction with
/// [`RoutingError::OutOfRange`].
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub table_size: usize,
    pub bucket_size: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    /// Neighborhood size for lookups; defaults to `bucket_size`.
    pub k: usize,
    pub ping_timeout: Duration,
    pub find_peer_timeout: Duration,
    pub lookup_round_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_BUCKET_SIZE,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            find_peer_timeout: DEFAULT_FIND_PEER_TIMEOUT,
            lookup_round_timeout: DEFAULT_LOOKUP_ROUND_TIMEOUT,
        }
    }
}

// ============================================================================
// Overlay
// ============================================================================

/// The protocol driver: bootstrap, table maintenance and message dispatch.
pub struct Overlay<T, C, S> {
    keypair: Keypair,
    local: BoundPeer,
    table: Arc<RoutingTable>,
    transport: Arc<T>,
    chain: Arc<C>,
    sync: Arc<S>,
    config: OverlayConfig,
    probe_guard: StdMutex<LruCache<Address, Instant>>,
}

impl<T, C, S> fmt::Debug for Overlay<T, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlay")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl<T, C, S> Overlay<T, C, S>
where
    T: PeerTransport,
    C: ChainStore,
    S: SyncHandler,
{
    pub fn new(
        keypair: Keypair,
        host: impl Into<String>,
        port: u16,
        transport: T,
        chain: C,
        sync: S,
        config: OverlayConfig,
    ) -> Result<Self, RoutingError> {
        if config.alpha == 0 {
            return Err(RoutingError::OutOfRange {
                param: "alpha",
                value: 0,
            });
        }
        if config.k == 0 {
            return Err(RoutingError::OutOfRange {
                param: "k",
                value: 0,
            });
        }
        let local = BoundPeer::new(keypair.public_key(), host, port);
        let table = RoutingTable::new(local.address, config.table_size, config.bucket_size)?;
        Ok(Self {
            keypair,
            local,
            table: Arc::new(table),
            transport: Arc::new(transport),
            chain: Arc::new(chain),
            sync: Arc::new(sync),
            config,
            probe_guard: StdMutex::new(LruCache::new(
                NonZeroUsize::new(PROBE_GUARD_CAPACITY).expect("probe guard capacity is non-zero"),
            )),
        })
    }

    /// The local node's bound identity.
    pub fn local_peer(&self) -> &BoundPeer {
        &self.local
    }

    pub fn address(&self) -> Address {
        self.local.address
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Up to `2k` known peers closest to `target`, for higher layers.
    pub fn neighbors(&self, target: &Address, k: usize) -> Vec<BoundPeer> {
        self.table.neighbors(target, k)
    }

    // ------------------------------------------------------------------
    // Bootstrap and lookup
    // ------------------------------------------------------------------

    /// Join the network: ping every seed, insert the responders, then run a
    /// self-lookup to populate nearby buckets.
    ///
    /// Completes without error on an empty seed list; the table is simply
    /// left empty.
    pub async fn bootstrap(
        &self,
        seeds: &[BoundPeer],
        ping_timeout: Duration,
        find_peer_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_not_cancelled(cancel)?;

        let mut join_set = JoinSet::new();
        for seed in seeds {
            if seed.address == self.local.address {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let keypair = self.keypair.clone();
            let seed = seed.clone();
            join_set.spawn(async move {
                let alive = ping_via(transport.as_ref(), &keypair, &seed, ping_timeout).await;
                (seed, alive)
            });
        }

        let mut responded = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(Cancelled.into());
                }
                joined = join_set.join_next() => {
                    let Some(joined) = joined else { break };
                    if let Ok((seed, true)) = joined {
                        responded += 1;
                        self.insert_seen(seed).await;
                    }
                }
            }
        }

        if seeds.is_empty() {
            debug!("bootstrap without seeds; table left empty");
            return Ok(());
        }
        if responded == 0 {
            warn!(seeds = seeds.len(), "no bootstrap seed responded");
            return Ok(());
        }
        debug!(responded, seeds = seeds.len(), "seeds inserted, starting self-lookup");

        match timeout(find_peer_timeout, self.find_peer(self.local.address, cancel)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => debug!("self-lookup timed out during bootstrap"),
        }
        Ok(())
    }

    /// Iterative lookup for the `k` closest peers to `target`.
    ///
    /// Each round queries the α closest not-yet-queried shortlist members in
    /// parallel, merges their answers into the table and the shortlist, and
    /// stops once a full round brings nothing closer than already known.
    pub async fn find_peer(
        &self,
        target: Address,
        cancel: &CancellationToken,
    ) -> Result<Vec<BoundPeer>> {
        let k = self.config.k;
        let mut shortlist = self.table.neighbors(&target, k);
        let mut seen: HashSet<Address> = shortlist.iter().map(|p| p.address).collect();
        let mut queried: HashSet<Address> = HashSet::new();
        let mut pending_evictions = Vec::new();
        let mut best_distance = shortlist
            .first()
            .map(|p| p.address.xor_distance(&target));

        for round in 0..MAX_LOOKUP_ROUNDS {
            self.ensure_not_cancelled(cancel)?;

            let candidates: Vec<BoundPeer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.address))
                .take(self.config.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.address);
            }

            let mut join_set = JoinSet::new();
            for peer in candidates {
                let transport = Arc::clone(&self.transport);
                let round_timeout = self.config.lookup_round_timeout;
                join_set.spawn(async move {
                    let result =
                        match timeout(round_timeout, transport.find_peer(&peer, target)).await {
                            Ok(result) => result,
                            Err(_) => Err(anyhow!("find-peer query timed out")),
                        };
                    (peer, result)
                });
            }

            let mut discovered = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // In-flight probes are abandoned; committed table
                        // mutations stay.
                        join_set.abort_all();
                        return Err(Cancelled.into());
                    }
                    joined = join_set.join_next() => {
                        let Some(joined) = joined else { break };
                        let Ok((peer, result)) = joined else { continue };
                        match result {
                            Ok(found) => {
                                self.note_seen(peer, &mut pending_evictions);
                                discovered.extend(found);
                            }
                            Err(error) => {
                                trace!(peer = %peer, %error, "find-peer query failed");
                            }
                        }
                    }
                }
            }

            for peer in discovered {
                if peer.address == self.local.address {
                    continue;
                }
                self.note_seen(peer.clone(), &mut pending_evictions);
                if seen.insert(peer.address) {
                    shortlist.push(peer);
                }
            }
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(k);

            let round_best = shortlist
                .first()
                .map(|p| p.address.xor_distance(&target));
            let improved = match (&best_distance, &round_best) {
                (None, Some(_)) => true,
                (Some(prev), Some(cur)) => {
                    distance_cmp(cur, prev) == std::cmp::Ordering::Less
                }
                _ => false,
            };
            if improved {
                best_distance = round_best;
            } else {
                trace!(round, found = shortlist.len(), "lookup converged");
                break;
            }
        }

        self.settle_pending(pending_evictions).await;
        Ok(shortlist)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Refresh buckets that have seen no contact for `max_age`: look up a
    /// random address in the bucket's key range, then re-probe the bucket's
    /// members, removing the dead and promoting replacements.
    pub async fn refresh_table(&self, max_age: Duration, cancel: &CancellationToken) -> Result<()> {
        let stale = self.table.stale_buckets(max_age);
        if stale.is_empty() {
            return Ok(());
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");

        for index in stale {
            self.ensure_not_cancelled(cancel)?;
            let target = self.table.random_target_in_bucket(index);
            if let Err(error) = self.find_peer(target, cancel).await {
                if error.is::<Cancelled>() {
                    return Err(error);
                }
                debug!(bucket = index, %error, "bucket refresh lookup failed");
            }

            for peer in self.table.bucket_peers(index) {
                self.ensure_not_cancelled(cancel)?;
                if self.ping_peer(&peer, self.config.ping_timeout).await {
                    // Contact made: bump to most-recently-seen.
                    let _ = self.table.add_peer(peer);
                } else {
                    debug!(peer = %peer, "removing unresponsive peer during refresh");
                    let _ = self.table.remove_peer(&peer);
                    if let Some(replacement) = self.table.pop_replacement(index) {
                        debug!(peer = %replacement, "promoted replacement candidate");
                        let _ = self.table.add_peer(replacement);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reseed the table: a self-lookup plus a lookup for a random address in
    /// every empty bucket.
    pub async fn rebuild_connection(&self, cancel: &CancellationToken) -> Result<()> {
        self.find_peer(self.local.address, cancel).await?;
        for index in self.table.empty_buckets() {
            self.ensure_not_cancelled(cancel)?;
            let target = self.table.random_target_in_bucket(index);
            if let Err(error) = self.find_peer(target, cancel).await {
                if error.is::<Cancelled>() {
                    return Err(error);
                }
                debug!(bucket = index, %error, "rebuild lookup failed");
            }
        }
        Ok(())
    }

    /// Walk every bucket's replacement cache: ping candidates newest-first,
    /// promote the first live one (probing an unresponsive head out of the
    /// way), drop the dead.
    pub async fn check_replacement_cache(&self, cancel: &CancellationToken) -> Result<()> {
        for index in 0..self.table.table_size() {
            loop {
                self.ensure_not_cancelled(cancel)?;
                let Some(candidate) = self.table.pop_replacement(index) else {
                    break;
                };
                if !self.ping_peer(&candidate, self.config.ping_timeout).await {
                    debug!(peer = %candidate, "dropping dead replacement candidate");
                    continue;
                }
                match self.table.add_peer(candidate.clone()) {
                    Ok(Some(head)) => {
                        // Bucket still full; the candidate is back in the
                        // cache as newest. An unresponsive head makes room
                        // and the settle step promotes the candidate.
                        self.settle_eviction(head, true).await;
                    }
                    Ok(None) => {
                        debug!(peer = %candidate, "promoted replacement candidate");
                    }
                    Err(error) => {
                        debug!(peer = %candidate, %error, "replacement insert rejected");
                    }
                }
                break;
            }
        }
        Ok(())
    }

    /// Spawn the periodic maintenance task: refresh stale buckets, settle
    /// replacement caches, and rebuild from scratch if the table ever runs
    /// empty. Stops when `cancel` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(error) = overlay.refresh_table(max_age, &cancel).await {
                    debug!(%error, "table refresh failed");
                }
                if let Err(error) = overlay.check_replacement_cache(&cancel).await {
                    debug!(%error, "replacement cache check failed");
                }
                if overlay.table.is_empty() {
                    if let Err(error) = overlay.rebuild_connection(&cancel).await {
                        debug!(%error, "table rebuild failed");
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch a verified inbound message.
    ///
    /// The sender is recorded in the routing table first, whatever the
    /// variant; an eviction candidate bubbled up by the insert is
    /// liveness-probed. Requests are answered through [`ChainStore`],
    /// inventory and data are handed to [`SyncHandler`].
    pub async fn receive_message(&self, message: Message, sender: BoundPeer) -> Result<()> {
        if sender.address == self.local.address {
            warn!("dropping message claiming to be from the local node");
            return Ok(());
        }
        trace!(from = %sender, kind = message.body.name(), "inbound message");
        self.insert_seen(sender.clone()).await;

        match message.body {
            MessageBody::Ping => {
                let pong = Message::with_identity(MessageBody::Pong, sender.address);
                self.transport
                    .send(&sender, pong.to_frames(&self.keypair)?)
                    .await?;
            }
            MessageBody::Pong => {
                trace!(from = %sender, "pong; liveness recorded");
            }
            MessageBody::PeerSetDelta(delta) => {
                let mut pending = Vec::new();
                for carried in &delta.added {
                    // Rebind through the carried key so a forged address
                    // field cannot enter the table.
                    let rebound =
                        BoundPeer::new(carried.public_key, carried.host.clone(), carried.port);
                    if rebound.address == self.local.address {
                        continue;
                    }
                    self.note_seen(rebound, &mut pending);
                }
                self.settle_pending(pending).await;
                self.sync.on_peer_set_delta(&sender.peer(), delta).await;
            }
            MessageBody::GetBlockHashes { locators, stop } => {
                let hashes = self.chain.block_hashes_after(&locators, &stop).await?;
                let reply = Message::with_identity(MessageBody::BlockHashes(hashes), sender.address);
                self.transport
                    .send(&sender, reply.to_frames(&self.keypair)?)
                    .await?;
            }
            MessageBody::GetBlocks(hashes) => {
                for block in self.chain.blocks(&hashes).await? {
                    let reply = Message::with_identity(MessageBody::Block(block), sender.address);
                    self.transport
                        .send(&sender, reply.to_frames(&self.keypair)?)
                        .await?;
                }
            }
            MessageBody::GetTxs(ids) => {
                for tx in self.chain.transactions(&ids).await? {
                    let reply = Message::with_identity(MessageBody::Tx(tx), sender.address);
                    self.transport
                        .send(&sender, reply.to_frames(&self.keypair)?)
                        .await?;
                }
            }
            MessageBody::BlockHashes(hashes) => {
                self.sync.on_block_hashes(&sender.peer(), hashes).await;
            }
            MessageBody::TxIds(ids) => {
                self.sync.on_tx_ids(&sender.peer(), ids).await;
            }
            MessageBody::Block(block) => {
                self.sync.on_block(&sender.peer(), block).await;
            }
            MessageBody::Tx(tx) => {
                self.sync.on_tx(&sender.peer(), tx).await;
            }
        }
        Ok(())
    }

    /// Send a message to one random peer per non-empty bucket: the
    /// logarithmic gossip set.
    pub async fn broadcast(&self, body: MessageBody) -> Result<()> {
        let peers = self.table.peers_to_broadcast();
        debug!(count = peers.len(), kind = body.name(), "broadcasting");
        for peer in peers {
            let message = Message::with_identity(body.clone(), peer.address);
            let frames = message.to_frames(&self.keypair)?;
            if let Err(error) = self.transport.send(&peer, frames).await {
                debug!(peer = %peer, %error, "broadcast send failed");
            }
        }
        Ok(())
    }

    /// Gossip our current peer set as a delta to the broadcast set.
    pub async fn announce_peers(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_not_cancelled(cancel)?;
        let delta = PeerSetDelta {
            added: self.table.peers(),
            removed: Vec::new(),
        };
        self.broadcast(MessageBody::PeerSetDelta(delta)).await
    }

    /// Human-readable dump of bucket contents for diagnostics.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "routing table for {} ({} peers)",
            self.local.address,
            self.table.len()
        );
        for snapshot in self.table.bucket_snapshots() {
            if snapshot.peers.is_empty() && snapshot.replacement_len == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "bucket {:3} ({}/{} peers, {} cached):",
                snapshot.index,
                snapshot.peers.len(),
                self.table.bucket_size(),
                snapshot.replacement_len
            );
            for (peer, age) in snapshot.peers {
                let _ = writeln!(out, "  {} last seen {:.1}s ago", peer, age.as_secs_f64());
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn ping_peer(&self, to: &BoundPeer, limit: Duration) -> bool {
        ping_via(self.transport.as_ref(), &self.keypair, to, limit).await
    }

    /// Record contact with a peer and settle any eviction candidate inline.
    async fn insert_seen(&self, peer: BoundPeer) {
        let mut pending = Vec::new();
        self.note_seen(peer, &mut pending);
        self.settle_pending(pending).await;
    }

    /// Record contact with a peer; a bubbled-up eviction candidate is pushed
    /// onto `pending` for a later probe.
    fn note_seen(&self, peer: BoundPeer, pending: &mut Vec<BoundPeer>) {
        if peer.address == self.local.address {
            return;
        }
        match self.table.add_peer(peer) {
            Ok(Some(candidate)) => pending.push(candidate),
            Ok(None) => {}
            Err(error) => debug!(%error, "peer insert rejected"),
        }
    }

    async fn settle_pending(&self, pending: Vec<BoundPeer>) {
        let mut settled = HashSet::new();
        for head in pending {
            if !settled.insert(head.address) {
                continue;
            }
            self.settle_eviction(head, false).await;
        }
    }

    /// Probe an eviction candidate. Alive heads are kept (the newcomer stays
    /// cached); dead heads are removed and the newest replacement promoted.
    /// Unforced probes are deduplicated through the probe guard.
    async fn settle_eviction(&self, head: BoundPeer, force: bool) {
        if !self.mark_probed(&head.address) && !force {
            return;
        }
        if self.ping_peer(&head, self.config.ping_timeout).await {
            trace!(peer = %head, "eviction candidate responded, kept");
            return;
        }
        let index = self.table.bucket_index_of(&head.address);
        if matches!(self.table.remove_peer(&head), Ok(true)) {
            debug!(peer = %head, "removed unresponsive peer");
        }
        if let Some(replacement) = self.table.pop_replacement(index) {
            debug!(peer = %replacement, "promoted replacement candidate");
            let _ = self.table.add_peer(replacement);
        }
    }

    /// Record a probe of `address`; returns false when it was already probed
    /// within the guard window.
    fn mark_probed(&self, address: &Address) -> bool {
        let mut guard = self
            .probe_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if let Some(last) = guard.get(address) {
            if now.duration_since(*last) < PROBE_GUARD_WINDOW {
                return false;
            }
        }
        guard.put(*address, now);
        true
    }

    fn ensure_not_cancelled(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

/// Send a signed Ping and await a Pong from the right peer within `limit`.
/// Timeouts, transport failures, bad replies and identity mismatches all
/// count as the peer being unresponsive.
async fn ping_via<T: PeerTransport>(
    transport: &T,
    keypair: &Keypair,
    to: &BoundPeer,
    limit: Duration,
) -> bool {
    let message = Message::with_identity(MessageBody::Ping, to.address);
    let frames = match message.to_frames(keypair) {
        Ok(frames) => frames,
        Err(error) => {
            warn!(%error, "failed to encode ping");
            return false;
        }
    };
    let reply = match timeout(limit, transport.request(to, frames)).await {
        Ok(Ok(frames)) => frames,
        Ok(Err(error)) => {
            debug!(peer = %to, %error, "ping failed");
            return false;
        }
        Err(_) => {
            debug!(peer = %to, "ping timed out");
            return false;
        }
    };
    match Message::parse(&reply, true) {
        Ok(parsed) => {
            matches!(parsed.message.body, MessageBody::Pong)
                && parsed.sender.address == to.address
        }
        Err(error) => {
            debug!(peer = %to, %error, "invalid ping reply");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Peer;
    use crate::messages::{BlockHash, TxId};
    use crate::protocols::{ChainStore, PeerTransport, SyncHandler};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::HashMap;

    // In-memory transport: peers answer pings with a Pong signed by their
    // registered keypair, and find-peer queries from a canned results map.
    #[derive(Default)]
    struct MockTransport {
        keys: StdMutex<HashMap<Address, Keypair>>,
        dead: StdMutex<HashSet<Address>>,
        find_results: StdMutex<HashMap<Address, Vec<BoundPeer>>>,
        sent: StdMutex<Vec<(Address, Vec<Vec<u8>>)>>,
    }

    impl MockTransport {
        fn register(&self, keypair: &Keypair) {
            self.keys
                .lock()
                .unwrap()
                .insert(keypair.address(), keypair.clone());
        }

        fn set_dead(&self, address: Address, dead: bool) {
            let mut set = self.dead.lock().unwrap();
            if dead {
                set.insert(address);
            } else {
                set.remove(&address);
            }
        }

        fn set_find_results(&self, address: Address, peers: Vec<BoundPeer>) {
            self.find_results.lock().unwrap().insert(address, peers);
        }

        fn sent_to(&self, address: Address) -> Vec<Vec<Vec<u8>>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == address)
                .map(|(_, frames)| frames.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PeerTransport for Arc<MockTransport> {
        async fn send(&self, to: &BoundPeer, frames: Vec<Vec<u8>>) -> Result<()> {
            if self.dead.lock().unwrap().contains(&to.address) {
                bail!("peer unreachable");
            }
            self.sent.lock().unwrap().push((to.address, frames));
            Ok(())
        }

        async fn request(&self, to: &BoundPeer, _frames: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
            if self.dead.lock().unwrap().contains(&to.address) {
                bail!("peer unreachable");
            }
            let keys = self.keys.lock().unwrap();
            let Some(keypair) = keys.get(&to.address) else {
                bail!("unknown peer");
            };
            Ok(Message::new(MessageBody::Pong).to_frames(keypair)?)
        }

        async fn find_peer(&self, to: &BoundPeer, _target: Address) -> Result<Vec<BoundPeer>> {
            if self.dead.lock().unwrap().contains(&to.address) {
                bail!("peer unreachable");
            }
            Ok(self
                .find_results
                .lock()
                .unwrap()
                .get(&to.address)
                .cloned()
                .unwrap_or_default())
        }
    }

    struct TestChain {
        hashes: Vec<BlockHash>,
        blocks: Vec<Vec<u8>>,
        txs: Vec<Vec<u8>>,
    }

    impl Default for TestChain {
        fn default() -> Self {
            Self {
                hashes: vec![[0x11; 32], [0x22; 32]],
                blocks: vec![b"block-a".to_vec(), b"block-b".to_vec()],
                txs: vec![b"tx-a".to_vec()],
            }
        }
    }

    #[async_trait]
    impl ChainStore for TestChain {
        async fn block_hashes_after(
            &self,
            _locators: &[BlockHash],
            _stop: &BlockHash,
        ) -> Result<Vec<BlockHash>> {
            Ok(self.hashes.clone())
        }

        async fn blocks(&self, _hashes: &[BlockHash]) -> Result<Vec<Vec<u8>>> {
            Ok(self.blocks.clone())
        }

        async fn transactions(&self, _ids: &[TxId]) -> Result<Vec<Vec<u8>>> {
            Ok(self.txs.clone())
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum SyncEvent {
        BlockHashes(usize),
        TxIds(usize),
        Block(Vec<u8>),
        Tx(Vec<u8>),
        Delta(usize),
    }

    #[derive(Default)]
    struct RecordingSync {
        events: StdMutex<Vec<SyncEvent>>,
    }

    #[async_trait]
    impl SyncHandler for Arc<RecordingSync> {
        async fn on_block_hashes(&self, _from: &Peer, hashes: Vec<BlockHash>) {
            self.events
                .lock()
                .unwrap()
                .push(SyncEvent::BlockHashes(hashes.len()));
        }

        async fn on_tx_ids(&self, _from: &Peer, ids: Vec<TxId>) {
            self.events.lock().unwrap().push(SyncEvent::TxIds(ids.len()));
        }

        async fn on_block(&self, _from: &Peer, block: Vec<u8>) {
            self.events.lock().unwrap().push(SyncEvent::Block(block));
        }

        async fn on_tx(&self, _from: &Peer, tx: Vec<u8>) {
            self.events.lock().unwrap().push(SyncEvent::Tx(tx));
        }

        async fn on_peer_set_delta(&self, _from: &Peer, delta: PeerSetDelta) {
            self.events
                .lock()
                .unwrap()
                .push(SyncEvent::Delta(delta.added.len()));
        }
    }

    struct Node {
        overlay: Overlay<Arc<MockTransport>, TestChain, Arc<RecordingSync>>,
        transport: Arc<MockTransport>,
        sync: Arc<RecordingSync>,
    }

    fn fast_config(bucket_size: usize) -> OverlayConfig {
        OverlayConfig {
            bucket_size,
            k: bucket_size,
            ping_timeout: Duration::from_millis(200),
            find_peer_timeout: Duration::from_secs(2),
            lookup_round_timeout: Duration::from_millis(200),
            ..OverlayConfig::default()
        }
    }

    fn node_with_config(config: OverlayConfig) -> Node {
        let transport = Arc::new(MockTransport::default());
        let sync = Arc::new(RecordingSync::default());
        let overlay = Overlay::new(
            Keypair::generate(),
            "127.0.0.1",
            31234,
            Arc::clone(&transport),
            TestChain::default(),
            Arc::clone(&sync),
            config,
        )
        .expect("valid config");
        Node {
            overlay,
            transport,
            sync,
        }
    }

    fn node() -> Node {
        node_with_config(fast_config(DEFAULT_BUCKET_SIZE))
    }

    /// A live peer registered with the transport.
    fn live_peer(node: &Node) -> (Keypair, BoundPeer) {
        let keypair = Keypair::generate();
        node.transport.register(&keypair);
        let bound = BoundPeer::new(keypair.public_key(), "127.0.0.1", 42000);
        (keypair, bound)
    }

    /// Generate live peers until `count` of them share the same bucket
    /// relative to the overlay's local address.
    fn same_bucket_peers(node: &Node, count: usize) -> (usize, Vec<BoundPeer>) {
        let mut by_bucket: HashMap<usize, Vec<BoundPeer>> = HashMap::new();
        for _ in 0..10_000 {
            let (_, peer) = live_peer(node);
            let index = node.overlay.table().bucket_index_of(&peer.address);
            let bucket = by_bucket.entry(index).or_default();
            bucket.push(peer);
            if bucket.len() == count {
                return (index, bucket.clone());
            }
        }
        panic!("could not generate {count} same-bucket peers");
    }

    #[test]
    fn zero_alpha_or_k_is_rejected() {
        let result = Overlay::new(
            Keypair::generate(),
            "127.0.0.1",
            31234,
            Arc::new(MockTransport::default()),
            TestChain::default(),
            Arc::new(RecordingSync::default()),
            OverlayConfig {
                alpha: 0,
                ..OverlayConfig::default()
            },
        );
        assert!(matches!(
            result.unwrap_err(),
            RoutingError::OutOfRange { param: "alpha", .. }
        ));

        let result = Overlay::new(
            Keypair::generate(),
            "127.0.0.1",
            31234,
            Arc::new(MockTransport::default()),
            TestChain::default(),
            Arc::new(RecordingSync::default()),
            OverlayConfig {
                k: 0,
                ..OverlayConfig::default()
            },
        );
        assert!(matches!(
            result.unwrap_err(),
            RoutingError::OutOfRange { param: "k", .. }
        ));
    }

    #[tokio::test]
    async fn bootstrap_with_empty_seeds_is_a_noop() {
        let node = node();
        let cancel = CancellationToken::new();
        node.overlay
            .bootstrap(&[], Duration::from_millis(100), Duration::from_secs(1), &cancel)
            .await
            .expect("empty bootstrap succeeds");
        assert_eq!(node.overlay.table().len(), 0);
    }

    #[tokio::test]
    async fn bootstrap_inserts_responders_and_discovers_their_neighbors() {
        let node = node();
        let cancel = CancellationToken::new();

        let (_, alive_seed) = live_peer(&node);
        let (_, discovered) = live_peer(&node);
        let dead_seed = {
            let (_, peer) = live_peer(&node);
            node.transport.set_dead(peer.address, true);
            peer
        };
        node.transport
            .set_find_results(alive_seed.address, vec![discovered.clone()]);

        node.overlay
            .bootstrap(
                &[alive_seed.clone(), dead_seed.clone()],
                Duration::from_millis(200),
                Duration::from_secs(2),
                &cancel,
            )
            .await
            .expect("bootstrap succeeds");

        let table = node.overlay.table();
        assert!(table.contains(&alive_seed.address));
        assert!(table.contains(&discovered.address));
        assert!(!table.contains(&dead_seed.address));
    }

    #[tokio::test]
    async fn bootstrap_respects_cancellation() {
        let node = node();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_, seed) = live_peer(&node);
        let error = node
            .overlay
            .bootstrap(
                &[seed],
                Duration::from_millis(200),
                Duration::from_secs(1),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(error.is::<Cancelled>());
        assert_eq!(node.overlay.table().len(), 0);
    }

    #[tokio::test]
    async fn find_peer_walks_the_network() {
        let node = node();
        let cancel = CancellationToken::new();

        let (_, hop) = live_peer(&node);
        let (_, far) = live_peer(&node);
        node.overlay.table().add_peer(hop.clone()).unwrap();
        node.transport.set_find_results(hop.address, vec![far.clone()]);

        let found = node
            .overlay
            .find_peer(far.address, &cancel)
            .await
            .expect("lookup succeeds");

        assert!(found.iter().any(|p| p.address == far.address));
        assert!(node.overlay.table().contains(&far.address));
        // Closest result first.
        assert_eq!(found.first().map(|p| p.address), Some(far.address));
    }

    #[tokio::test]
    async fn receive_ping_replies_pong_and_records_sender() {
        let node = node();
        let (_, peer) = live_peer(&node);

        node.overlay
            .receive_message(Message::new(MessageBody::Ping), peer.clone())
            .await
            .expect("dispatch succeeds");

        assert!(node.overlay.table().contains(&peer.address));
        let sent = node.transport.sent_to(peer.address);
        assert_eq!(sent.len(), 1);
        let parsed = Message::parse(&sent[0], false).expect("valid pong");
        assert_eq!(parsed.message.body, MessageBody::Pong);
        assert_eq!(parsed.message.identity, Some(peer.address));
        assert_eq!(parsed.sender.address, node.overlay.address());
    }

    #[tokio::test]
    async fn receive_get_block_hashes_replies_inventory() {
        let node = node();
        let (_, peer) = live_peer(&node);

        node.overlay
            .receive_message(
                Message::new(MessageBody::GetBlockHashes {
                    locators: vec![[0xAA; 32]],
                    stop: [0xBB; 32],
                }),
                peer.clone(),
            )
            .await
            .expect("dispatch succeeds");

        let sent = node.transport.sent_to(peer.address);
        assert_eq!(sent.len(), 1);
        let parsed = Message::parse(&sent[0], false).expect("valid reply");
        assert_eq!(
            parsed.message.body,
            MessageBody::BlockHashes(vec![[0x11; 32], [0x22; 32]])
        );
    }

    #[tokio::test]
    async fn receive_get_blocks_streams_one_message_per_block() {
        let node = node();
        let (_, peer) = live_peer(&node);

        node.overlay
            .receive_message(
                Message::new(MessageBody::GetBlocks(vec![[1; 32], [2; 32]])),
                peer.clone(),
            )
            .await
            .expect("dispatch succeeds");

        let sent = node.transport.sent_to(peer.address);
        assert_eq!(sent.len(), 2);
        let first = Message::parse(&sent[0], false).expect("valid block");
        let second = Message::parse(&sent[1], false).expect("valid block");
        assert_eq!(first.message.body, MessageBody::Block(b"block-a".to_vec()));
        assert_eq!(second.message.body, MessageBody::Block(b"block-b".to_vec()));
    }

    #[tokio::test]
    async fn inventory_and_data_go_to_the_sync_handler() {
        let node = node();
        let (_, peer) = live_peer(&node);

        for body in [
            MessageBody::BlockHashes(vec![[1; 32], [2; 32]]),
            MessageBody::TxIds(vec![[3; 32]]),
            MessageBody::Block(b"blk".to_vec()),
            MessageBody::Tx(b"tx".to_vec()),
        ] {
            node.overlay
                .receive_message(Message::new(body), peer.clone())
                .await
                .expect("dispatch succeeds");
        }

        let events = node.sync.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                SyncEvent::BlockHashes(2),
                SyncEvent::TxIds(1),
                SyncEvent::Block(b"blk".to_vec()),
                SyncEvent::Tx(b"tx".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn peer_set_delta_inserts_carried_peers() {
        let node = node();
        let (_, sender) = live_peer(&node);
        let (carried_key, carried) = live_peer(&node);

        // A forged address in the carried record must not survive the
        // rebind: the receiver re-derives it from the key.
        let mut forged = carried.clone();
        forged.address = Address::from_bytes([0xEE; 20]);

        node.overlay
            .receive_message(
                Message::new(MessageBody::PeerSetDelta(PeerSetDelta {
                    added: vec![forged],
                    removed: vec![],
                })),
                sender.clone(),
            )
            .await
            .expect("dispatch succeeds");

        let table = node.overlay.table();
        assert!(table.contains(&carried_key.address()));
        assert!(!table.contains(&Address::from_bytes([0xEE; 20])));
        assert_eq!(
            *node.sync.events.lock().unwrap(),
            vec![SyncEvent::Delta(1)]
        );
        assert!(table.contains(&sender.address));
    }

    #[tokio::test]
    async fn full_bucket_with_live_head_caches_newcomer() {
        let node = node_with_config(fast_config(2));
        let (index, peers) = same_bucket_peers(&node, 3);

        for peer in &peers {
            node.overlay.insert_seen(peer.clone()).await;
        }

        let bucket = node.overlay.table().bucket_peers(index);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].address, peers[0].address);
        assert_eq!(bucket[1].address, peers[1].address);
        assert_eq!(node.overlay.table().replacement_len(index), 1);
        assert!(!node.overlay.table().contains(&peers[2].address));
    }

    #[tokio::test]
    async fn full_bucket_with_dead_head_promotes_newcomer() {
        let node = node_with_config(fast_config(2));
        let (index, peers) = same_bucket_peers(&node, 3);

        node.overlay.insert_seen(peers[0].clone()).await;
        node.overlay.insert_seen(peers[1].clone()).await;
        node.transport.set_dead(peers[0].address, true);
        node.overlay.insert_seen(peers[2].clone()).await;

        let bucket = node.overlay.table().bucket_peers(index);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].address, peers[1].address);
        assert_eq!(bucket[1].address, peers[2].address);
        assert_eq!(node.overlay.table().replacement_len(index), 0);
    }

    #[tokio::test]
    async fn replacement_check_promotes_over_a_dead_head() {
        let node = node_with_config(fast_config(2));
        let cancel = CancellationToken::new();
        let (index, peers) = same_bucket_peers(&node, 3);

        // Fill the bucket and cache the third peer while the head is alive.
        for peer in &peers {
            node.overlay.insert_seen(peer.clone()).await;
        }
        assert_eq!(node.overlay.table().replacement_len(index), 1);

        // Head dies later; the explicit check must re-probe it.
        node.transport.set_dead(peers[0].address, true);
        node.overlay
            .check_replacement_cache(&cancel)
            .await
            .expect("check succeeds");

        let bucket = node.overlay.table().bucket_peers(index);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket[0].address, peers[1].address);
        assert_eq!(bucket[1].address, peers[2].address);
        assert_eq!(node.overlay.table().replacement_len(index), 0);
    }

    #[tokio::test]
    async fn replacement_check_drops_dead_candidates() {
        let node = node_with_config(fast_config(2));
        let cancel = CancellationToken::new();
        let (index, peers) = same_bucket_peers(&node, 3);

        for peer in &peers {
            node.overlay.insert_seen(peer.clone()).await;
        }
        node.transport.set_dead(peers[2].address, true);

        node.overlay
            .check_replacement_cache(&cancel)
            .await
            .expect("check succeeds");

        // Dead candidate dropped, bucket untouched.
        assert_eq!(node.overlay.table().replacement_len(index), 0);
        let bucket = node.overlay.table().bucket_peers(index);
        assert_eq!(bucket.len(), 2);
        assert!(bucket.iter().all(|p| p.address != peers[2].address));
    }

    #[tokio::test]
    async fn refresh_removes_dead_peers_and_keeps_live_ones() {
        let node = node();
        let cancel = CancellationToken::new();

        let (_, alive) = live_peer(&node);
        let (_, dead) = live_peer(&node);
        node.overlay.table().add_peer(alive.clone()).unwrap();
        node.overlay.table().add_peer(dead.clone()).unwrap();
        node.transport.set_dead(dead.address, true);

        node.overlay
            .refresh_table(Duration::from_nanos(0), &cancel)
            .await
            .expect("refresh succeeds");

        assert!(node.overlay.table().contains(&alive.address));
        assert!(!node.overlay.table().contains(&dead.address));
    }

    #[tokio::test]
    async fn rebuild_reseeds_from_known_peers() {
        let node = node();
        let cancel = CancellationToken::new();

        let (_, hop) = live_peer(&node);
        let (_, fresh) = live_peer(&node);
        node.overlay.table().add_peer(hop.clone()).unwrap();
        node.transport
            .set_find_results(hop.address, vec![fresh.clone()]);

        node.overlay
            .rebuild_connection(&cancel)
            .await
            .expect("rebuild succeeds");

        assert!(node.overlay.table().contains(&fresh.address));
    }

    #[tokio::test]
    async fn broadcast_reaches_one_peer_per_bucket() {
        let node = node();
        let (_, p1) = live_peer(&node);
        let (_, p2) = live_peer(&node);
        node.overlay.table().add_peer(p1.clone()).unwrap();
        node.overlay.table().add_peer(p2.clone()).unwrap();
        let expected = node.overlay.table().non_empty_buckets().len();

        node.overlay
            .broadcast(MessageBody::TxIds(vec![[7; 32]]))
            .await
            .expect("broadcast succeeds");

        let sent = node.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), expected);
        for (to, frames) in sent.iter() {
            let parsed = Message::parse(frames, false).expect("valid frames");
            assert_eq!(parsed.message.body, MessageBody::TxIds(vec![[7; 32]]));
            assert_eq!(parsed.message.identity, Some(*to));
        }
    }

    #[tokio::test]
    async fn trace_renders_bucket_contents() {
        let node = node();
        let (_, peer) = live_peer(&node);
        node.overlay.table().add_peer(peer.clone()).unwrap();

        let dump = node.overlay.trace();
        assert!(dump.contains(&node.overlay.address().to_hex()));
        assert!(dump.contains(&hex::encode(&peer.address.as_bytes()[..6])));
        assert!(dump.contains("bucket"));
    }
}
