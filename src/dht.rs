//! # Kademlia DHT Core
//!
//! Routing table, local storage, the iterative lookup engine, and the
//! republication scheduler.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `store(key, value)` | Place a value on the K closest peers (and locally) |
//! | `find_value(key)` | Retrieve a value via iterative crawl |
//! | `node_lookup(id)` | Find the K closest contacts to an id |
//!
//! ## Routing Table
//!
//! 256 k-buckets indexed by shared-prefix length with the local id. Bucket i
//! holds contacts sharing exactly i leading bits with self (clamped to 255),
//! up to K of them, ordered least- to most-recently seen. A full bucket
//! drops newcomers; there is no eviction probe.
//!
//! ## Lookup Engine
//!
//! Both crawls share one skeleton over `{shortlist, contacted}` state: pick
//! the closest uncontacted candidate, query it, mark it contacted whatever
//! happens, merge any returned contacts (dedup by id, resort by distance).
//! `node_lookup` short-circuits when the exact target id shows up;
//! `find_value` returns on the first value reply. One query is kept in
//! flight; `ALPHA` in the config documents the declared concurrency knob.
//!
//! ## Republication
//!
//! Every locally stored key owns exactly one timer task. On each tick the
//! task re-reads the current value and re-runs `store`, pushing the key
//! toward whatever peers are now closest; storing a key again restarts its
//! timer rather than stacking a second one. A removed key stops its timer
//! at the next tick (or eagerly via `remove`).
//!
//! ## Concurrency
//!
//! Buckets take their own short `std` rwlocks and are never held across
//! awaits. The storage map and the timer table use async rwlocks. The
//! network side is reached only through the [`DhtRpc`] capability, which
//! keeps this module free of socket concerns and testable with a mock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ID_BITS, K};
use crate::identity::{distance_cmp, Contact, PeerId};
use crate::protocols::DhtRpc;

// ============================================================================
// K-Bucket
// ============================================================================

/// A bounded, LRU-ordered list of contacts: head is least recently seen.
#[derive(Debug, Default)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
        }
    }

    /// Insert or refresh a contact:
    /// 1. already present → move to the tail with a fresh `last_seen`
    /// 2. room left → append at the tail
    /// 3. bucket full → drop the newcomer
    fn update(&mut self, mut contact: Contact, k: usize) {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            contact.touch();
            self.contacts.push(contact);
            return;
        }
        if self.contacts.len() < k {
            contact.touch();
            self.contacts.push(contact);
        }
    }

    fn snapshot(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    fn len(&self) -> usize {
        self.contacts.len()
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// 256 k-buckets owned by a single self id. The table never contains the
/// self contact, and each contact lives in exactly one bucket: the one whose
/// index equals its shared-prefix length with self (clamped to 255).
#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<StdRwLock<KBucket>>,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(StdRwLock::new(KBucket::new()));
        }
        Self {
            self_id,
            k,
            buckets,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    fn bucket_index(&self, id: &PeerId) -> usize {
        self.self_id.prefix_len(id).min(ID_BITS - 1)
    }

    /// Insert or refresh a contact. The self id is never stored.
    pub fn update(&self, contact: Contact) {
        if contact.id == self.self_id {
            return;
        }
        let index = self.bucket_index(&contact.id);
        let mut bucket = self.buckets[index].write().expect("bucket lock poisoned");
        bucket.update(contact, self.k);
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let index = self.bucket_index(id);
        self.buckets[index]
            .read()
            .expect("bucket lock poisoned")
            .contacts
            .iter()
            .any(|c| &c.id == id)
    }

    /// The `count` closest known contacts to `target`, sorted ascending by
    /// XOR distance. Pools the target's bucket first, then expands outward
    /// one index at a time until enough candidates are gathered or both
    /// directions are exhausted.
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }
        let center = self.bucket_index(target);
        let mut pooled = self.bucket_snapshot(center);

        let mut offset = 1usize;
        while pooled.len() < count {
            let below = center.checked_sub(offset);
            let above = center + offset;
            if below.is_none() && above >= ID_BITS {
                break;
            }
            if let Some(index) = below {
                pooled.extend(self.bucket_snapshot(index));
            }
            if above < ID_BITS {
                pooled.extend(self.bucket_snapshot(above));
            }
            offset += 1;
        }

        pooled.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db)
        });
        pooled.truncate(count);
        pooled
    }

    fn bucket_snapshot(&self, index: usize) -> Vec<Contact> {
        self.buckets[index]
            .read()
            .expect("bucket lock poisoned")
            .snapshot()
    }

    /// Total number of known contacts.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read().expect("bucket lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(bucket_index, contact_count)` for every non-empty bucket.
    pub fn bucket_occupancy(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| {
                let len = bucket.read().expect("bucket lock poisoned").len();
                (len > 0).then_some((index, len))
            })
            .collect()
    }
}

// ============================================================================
// Lookup state
// ============================================================================

/// Per-lookup ephemeral state: the candidate shortlist (unique by id, kept
/// sorted by distance to the target) and the set of already-queried ids.
struct LookupState {
    target: PeerId,
    shortlist: Vec<Contact>,
    contacted: HashSet<PeerId>,
}

impl LookupState {
    fn new(target: PeerId, seed: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            shortlist: Vec::new(),
            contacted: HashSet::new(),
        };
        state.merge(seed);
        state
    }

    /// Add unseen contacts and resort the shortlist by distance.
    fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            if !self.shortlist.iter().any(|c| c.id == contact.id) {
                self.shortlist.push(contact);
            }
        }
        let target = self.target;
        self.shortlist.sort_by(|a, b| {
            let da = a.id.xor_distance(&target);
            let db = b.id.xor_distance(&target);
            distance_cmp(&da, &db)
        });
    }

    /// The closest shortlist entry not yet contacted.
    fn next_candidate(&self) -> Option<Contact> {
        self.shortlist
            .iter()
            .find(|c| !self.contacted.contains(&c.id))
            .cloned()
    }

    fn mark_contacted(&mut self, id: PeerId) {
        self.contacted.insert(id);
    }

    fn into_closest(mut self, count: usize) -> Vec<Contact> {
        self.shortlist.truncate(count);
        self.shortlist
    }
}

// ============================================================================
// Errors and reports
// ============================================================================

/// Failure of an iterative value lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// Every reachable node was asked and none had the value.
    NotFound { hops: u32 },
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound { hops } => {
                write!(f, "value not found after {hops} hops")
            }
        }
    }
}

impl std::error::Error for LookupError {}

/// Outcome of a `store` fan-out. Zero replicas is still a success: the value
/// is at least locally present and its timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReport {
    /// Remote peers that acknowledged the store.
    pub replicated: usize,
    /// Remote peers the store was attempted on.
    pub attempted: usize,
}

/// Read-only snapshot for status queries.
#[derive(Debug, Clone)]
pub struct DhtStatus {
    pub stored_keys: usize,
    pub known_peers: usize,
    pub bucket_occupancy: Vec<(usize, usize)>,
}

// ============================================================================
// DHT handle
// ============================================================================

struct ReplicationTimer {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
    /// Identifies this timer instance so a stopping task only ever removes
    /// its own table entry, never a replacement armed concurrently.
    generation: u64,
}

/// The DHT core, generic over the network capability. Cheap to clone; all
/// clones share the same routing table, storage and timer table.
pub struct Dht<N: DhtRpc> {
    inner: Arc<DhtInner<N>>,
}

struct DhtInner<N: DhtRpc> {
    self_contact: Contact,
    k: usize,
    republish_interval: Duration,
    network: Arc<N>,
    routing: RoutingTable,
    storage: RwLock<HashMap<PeerId, Vec<u8>>>,
    timers: RwLock<HashMap<PeerId, ReplicationTimer>>,
    timer_generation: AtomicU64,
}

impl<N: DhtRpc> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: DhtRpc> Dht<N> {
    pub fn new(self_contact: Contact, network: Arc<N>, republish_interval: Duration) -> Self {
        let self_id = self_contact.id;
        Self {
            inner: Arc::new(DhtInner {
                self_contact,
                k: K,
                republish_interval,
                network,
                routing: RoutingTable::new(self_id, K),
                storage: RwLock::new(HashMap::new()),
                timers: RwLock::new(HashMap::new()),
                timer_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_contact.id
    }

    pub fn self_contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    // ------------------------------------------------------------------
    // Iterative lookups
    // ------------------------------------------------------------------

    /// Iterative FIND_NODE crawl toward `target`. Returns the K closest
    /// contacts discovered, or just the target's own contact if it is met
    /// along the way. An empty routing table yields an empty result.
    pub async fn node_lookup(&self, target: PeerId) -> Vec<Contact> {
        let seed = self.inner.routing.closest(&target, self.inner.k);
        if seed.is_empty() {
            return Vec::new();
        }
        trace!(
            target = &target.to_hex()[..16],
            seed = seed.len(),
            "starting node lookup"
        );
        let mut state = LookupState::new(target, seed);

        while let Some(candidate) = state.next_candidate() {
            state.mark_contacted(candidate.id);

            match self.inner.network.find_node(&candidate, target).await {
                Ok(nodes) => {
                    // The candidate answered, so it is alive: refresh it.
                    self.inner.routing.update(candidate.clone());
                    if let Some(exact) = nodes.iter().find(|n| n.id == target) {
                        trace!(target = &target.to_hex()[..16], "lookup hit exact target");
                        return vec![exact.clone()];
                    }
                    let self_id = self.self_id();
                    state.merge(nodes.into_iter().filter(|n| n.id != self_id).collect());
                }
                Err(e) => {
                    debug!(
                        peer = &candidate.id.to_hex()[..16],
                        error = %e,
                        "lookup query failed, continuing"
                    );
                }
            }
        }

        state.into_closest(self.inner.k)
    }

    /// Iterative FIND_VALUE crawl. Local hits cost zero hops; otherwise the
    /// hop count is the number of peers queried before the value appeared.
    /// Values discovered remotely are returned but never cached locally:
    /// copies belong on the K closest peers to the key, not on whoever
    /// happened to ask.
    pub async fn find_value(&self, key: PeerId) -> Result<(Vec<u8>, u32), LookupError> {
        if let Some(value) = self.inner.storage.read().await.get(&key).cloned() {
            return Ok((value, 0));
        }

        let seed = self.inner.routing.closest(&key, self.inner.k);
        if seed.is_empty() {
            return Err(LookupError::NotFound { hops: 0 });
        }
        let mut state = LookupState::new(key, seed);
        let mut hops = 0u32;

        while let Some(candidate) = state.next_candidate() {
            state.mark_contacted(candidate.id);
            hops += 1;

            match self.inner.network.find_value(&candidate, key).await {
                Ok((Some(value), _)) => {
                    self.inner.routing.update(candidate);
                    debug!(key = &key.to_hex()[..16], hops, "value found");
                    return Ok((value, hops));
                }
                Ok((None, nodes)) => {
                    self.inner.routing.update(candidate.clone());
                    let self_id = self.self_id();
                    state.merge(nodes.into_iter().filter(|n| n.id != self_id).collect());
                }
                Err(e) => {
                    debug!(
                        peer = &candidate.id.to_hex()[..16],
                        error = %e,
                        "value query failed, continuing"
                    );
                }
            }
        }

        Err(LookupError::NotFound { hops })
    }

    // ------------------------------------------------------------------
    // Store and republication
    // ------------------------------------------------------------------

    /// Place `value` on the K closest peers to `key`, and always locally.
    /// Remote failures are counted, not fatal; the per-key republication
    /// timer is (re)armed in every case.
    ///
    /// Written as a plain fn returning a boxed future (rather than
    /// `async fn`) because this call is mutually recursive with the
    /// republication timer spawned in `start_or_restart_timer`; boxing
    /// gives the two an explicit, non-opaque return type so the compiler
    /// can prove `Send` instead of looping over an infinite opaque-type
    /// cycle.
    pub fn store(
        &self,
        key: PeerId,
        value: Vec<u8>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StoreReport> + Send + '_>> {
        Box::pin(async move {
            let candidates = self.node_lookup(key).await;

            let mut replicated = 0usize;
            let mut attempted = 0usize;
            for contact in &candidates {
                if contact.id == self.self_id() {
                    continue;
                }
                attempted += 1;
                match self.inner.network.store(contact, key, value.clone()).await {
                    Ok(true) => replicated += 1,
                    Ok(false) => {
                        debug!(peer = &contact.id.to_hex()[..16], "store not acknowledged");
                    }
                    Err(e) => {
                        debug!(
                            peer = &contact.id.to_hex()[..16],
                            error = %e,
                            "store rpc failed"
                        );
                    }
                }
            }

            self.inner.storage.write().await.insert(key, value);
            self.start_or_restart_timer(key).await;

            if attempted == 0 {
                info!(
                    key = &key.to_hex()[..16],
                    "no peers known, value stored locally only"
                );
            } else {
                debug!(
                    key = &key.to_hex()[..16],
                    replicated, attempted, "store fan-out complete"
                );
            }
            StoreReport {
                replicated,
                attempted,
            }
        })
    }

    /// Accept a value pushed by a peer. Restarting the timer here aligns a
    /// fresh replica's schedule so its first republication is not immediate.
    pub async fn store_local(&self, key: PeerId, value: Vec<u8>) {
        self.inner.storage.write().await.insert(key, value);
        self.start_or_restart_timer(key).await;
    }

    pub async fn get_local(&self, key: &PeerId) -> Option<Vec<u8>> {
        self.inner.storage.read().await.get(key).cloned()
    }

    /// Delete a key. Its timer is cancelled eagerly; a racing tick would
    /// also stop on seeing the key gone.
    pub async fn remove(&self, key: &PeerId) -> bool {
        let removed = self.inner.storage.write().await.remove(key).is_some();
        if let Some(timer) = self.inner.timers.write().await.remove(key) {
            let _ = timer.cancel.send(());
            timer.task.abort();
        }
        removed
    }

    /// Arm the republication timer for `key`, stopping any previous one
    /// first so fan-outs never stack.
    async fn start_or_restart_timer(&self, key: PeerId) {
        let mut timers = self.inner.timers.write().await;
        if let Some(previous) = timers.remove(&key) {
            let _ = previous.cancel.send(());
        }

        let generation = self
            .inner
            .timer_generation
            .fetch_add(1, AtomicOrdering::Relaxed);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let dht = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dht.inner.republish_interval);
            // The first interval tick fires immediately; skip it so the
            // first republication happens one full period from now.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => {
                        let current = dht.inner.storage.read().await.get(&key).cloned();
                        match current {
                            None => {
                                let mut timers = dht.inner.timers.write().await;
                                if timers.get(&key).map(|t| t.generation) == Some(generation) {
                                    timers.remove(&key);
                                }
                                debug!(key = &key.to_hex()[..16], "key gone, stopping republication");
                                break;
                            }
                            Some(value) => {
                                trace!(key = &key.to_hex()[..16], "republishing");
                                let report = dht.store(key, value).await;
                                if report.attempted > 0 && report.replicated == 0 {
                                    warn!(
                                        key = &key.to_hex()[..16],
                                        attempted = report.attempted,
                                        "republication reached no replicas"
                                    );
                                }
                                // dht.store restarted this key's timer, so
                                // the cancel signal is already on its way;
                                // the next select iteration exits.
                            }
                        }
                    }
                }
            }
        });

        timers.insert(
            key,
            ReplicationTimer {
                cancel: cancel_tx,
                task,
                generation,
            },
        );
    }

    /// Whether a republication timer is currently armed for `key`.
    pub async fn has_timer(&self, key: &PeerId) -> bool {
        self.inner.timers.read().await.contains_key(key)
    }

    // ------------------------------------------------------------------
    // Inbound request handlers (passive routing updates included)
    // ------------------------------------------------------------------

    pub fn handle_ping(&self, sender: Contact) {
        self.inner.routing.update(sender);
    }

    pub fn handle_find_node(&self, sender: Contact, target: PeerId) -> Vec<Contact> {
        self.inner.routing.update(sender);
        self.inner.routing.closest(&target, self.inner.k)
    }

    pub async fn handle_store(&self, sender: Contact, key: PeerId, value: Vec<u8>) {
        self.inner.routing.update(sender);
        self.store_local(key, value).await;
    }

    pub async fn handle_find_value(
        &self,
        sender: Contact,
        key: PeerId,
    ) -> (Option<Vec<u8>>, Vec<Contact>) {
        self.inner.routing.update(sender);
        if let Some(value) = self.inner.storage.read().await.get(&key).cloned() {
            return (Some(value), Vec::new());
        }
        (None, self.inner.routing.closest(&key, self.inner.k))
    }

    pub async fn status(&self) -> DhtStatus {
        DhtStatus {
            stored_keys: self.inner.storage.read().await.len(),
            known_peers: self.inner.routing.len(),
            bucket_occupancy: self.inner.routing.bucket_occupancy(),
        }
    }
}
