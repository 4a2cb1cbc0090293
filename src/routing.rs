//! # Routing Table
//!
//! Contacts live in a binary tree of buckets keyed by kad-key prefix. The tree
//! starts as a single root leaf; a full leaf shallower than the configured
//! prefix length splits on its next bit, and a full leaf that cannot split
//! defends its slots with liveness probes.
//!
//! ## Admission
//!
//! | Leaf state | Outcome of `add(peer)` |
//! |------------|------------------------|
//! | peer present | liveness timestamp refreshed |
//! | spare capacity or splittable | candidate probed, inserted if it answers |
//! | full, cannot split | oldest contacts probed; failures evicted, then the candidate is probed and inserted |
//!
//! A candidate is never inserted without a successful round trip. New and
//! old contacts are probed through separate bounded [`ProbeQueue`]s.
//!
//! ## Actor Architecture
//!
//! - `RoutingTable`: cloneable handle, runs probes and sequences admission
//! - `TableActor`: owns the bucket tree; every command is applied without
//!   suspending, so a split, an eviction or an insert is atomic
//!
//! Stopping the table cancels every pending probe and drops the tree.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{RoutingConfig, SplitPolicy};
use crate::identity::{Distance, KEY_BITS, KEY_LEN, KadKey, PeerId};
use crate::probe::{AdaptiveTimeout, ProbeError, ProbeQueue};
use crate::protocols::DhtRpc;

const COMMAND_CHANNEL_CAPACITY: usize = 100;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingTableError {
    #[error("routing table is not started")]
    NotStarted,
}

/// A peer tracked by the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub peer: PeerId,
    pub key: KadKey,
    pub last_verified: Instant,
}

impl Contact {
    fn new(peer: PeerId, key: KadKey) -> Self {
        Self {
            peer,
            key,
            last_verified: Instant::now(),
        }
    }
}

/// Result of [`RoutingTable::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Already present; its liveness timestamp was refreshed.
    Refreshed,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

/// Bit-string prefix of a bucket.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    bits: [u8; KEY_LEN],
    depth: usize,
}

impl Prefix {
    const ROOT: Prefix = Prefix {
        bits: [0; KEY_LEN],
        depth: 0,
    };

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    fn child(&self, bit: bool) -> Prefix {
        let mut bits = self.bits;
        if bit {
            bits[self.depth / 8] |= 0x80 >> (self.depth % 8);
        }
        Prefix {
            bits,
            depth: self.depth + 1,
        }
    }

    pub fn matches(&self, key: &KadKey) -> bool {
        (0..self.depth).all(|i| key.bit(i) == self.bit(i))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.depth {
            f.write_str(if self.bit(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix({self})")
    }
}

/// Leaf contents as seen from outside the actor.
#[derive(Clone, Debug)]
pub struct BucketSnapshot {
    pub prefix: Prefix,
    /// Least recently verified first.
    pub contacts: Vec<Contact>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutingStats {
    pub size: usize,
    pub buckets: usize,
    pub max_depth: usize,
    pub average_occupancy: f64,
    /// Admission and eviction probes queued or running.
    pub pending_probes: usize,
}

// ============================================================================
// Bucket Tree
// ============================================================================

type BucketId = usize;

#[derive(Debug)]
enum BucketKind {
    /// Ordered least recently verified first.
    Leaf(Vec<Contact>),
    Split { left: BucketId, right: BucketId },
}

#[derive(Debug)]
struct Bucket {
    prefix: Prefix,
    kind: BucketKind,
}

impl Bucket {
    fn leaf(prefix: Prefix, contacts: Vec<Contact>) -> Self {
        Self {
            prefix,
            kind: BucketKind::Leaf(contacts),
        }
    }

    fn contacts(&self) -> &[Contact] {
        match &self.kind {
            BucketKind::Leaf(contacts) => contacts,
            BucketKind::Split { .. } => &[],
        }
    }

    fn contacts_mut(&mut self) -> Option<&mut Vec<Contact>> {
        match &mut self.kind {
            BucketKind::Leaf(contacts) => Some(contacts),
            BucketKind::Split { .. } => None,
        }
    }
}

/// Where a key would land if it were inserted now.
#[derive(Debug)]
enum Placement {
    Present,
    Vacant,
    Splittable,
    Full { oldest: Vec<Contact> },
}

#[derive(Debug)]
enum InsertOutcome {
    Inserted,
    Refreshed,
    Full { oldest: Vec<Contact> },
}

/// Arena of buckets; index 0 is the root.
#[derive(Debug)]
struct BucketTree {
    local: KadKey,
    k: usize,
    max_depth: usize,
    split_policy: SplitPolicy,
    eviction_candidates: usize,
    buckets: Vec<Bucket>,
}

impl BucketTree {
    fn new(local: KadKey, config: &RoutingConfig) -> Self {
        Self {
            local,
            k: config.kbucket_size.max(1),
            max_depth: config.prefix_length.min(KEY_BITS),
            split_policy: config.split_policy,
            eviction_candidates: config.ping_old_contact_count.max(1),
            buckets: vec![Bucket::leaf(Prefix::ROOT, Vec::new())],
        }
    }

    fn leaf_for(&self, key: &KadKey) -> BucketId {
        let mut id = 0;
        while let BucketKind::Split { left, right } = self.buckets[id].kind {
            id = if key.bit(self.buckets[id].prefix.depth) {
                right
            } else {
                left
            };
        }
        id
    }

    fn can_split(&self, id: BucketId) -> bool {
        let prefix = &self.buckets[id].prefix;
        prefix.depth < self.max_depth
            && match self.split_policy {
                SplitPolicy::BelowMaxDepth => true,
                SplitPolicy::SelfPath => prefix.matches(&self.local),
            }
    }

    fn oldest(&self, id: BucketId) -> Vec<Contact> {
        self.buckets[id]
            .contacts()
            .iter()
            .take(self.eviction_candidates)
            .cloned()
            .collect()
    }

    fn get(&self, key: &KadKey) -> Option<&Contact> {
        self.buckets[self.leaf_for(key)]
            .contacts()
            .iter()
            .find(|c| c.key == *key)
    }

    fn placement(&self, key: &KadKey) -> Placement {
        let id = self.leaf_for(key);
        let contacts = self.buckets[id].contacts();
        if contacts.iter().any(|c| c.key == *key) {
            Placement::Present
        } else if contacts.len() < self.k {
            Placement::Vacant
        } else if self.can_split(id) {
            Placement::Splittable
        } else {
            Placement::Full {
                oldest: self.oldest(id),
            }
        }
    }

    /// Move the contact to the most-recently-verified end.
    fn touch(&mut self, key: &KadKey, now: Instant) -> bool {
        let id = self.leaf_for(key);
        let Some(contacts) = self.buckets[id].contacts_mut() else {
            return false;
        };
        let Some(pos) = contacts.iter().position(|c| c.key == *key) else {
            return false;
        };
        let mut contact = contacts.remove(pos);
        contact.last_verified = now;
        contacts.push(contact);
        true
    }

    fn insert(&mut self, contact: Contact) -> InsertOutcome {
        loop {
            let id = self.leaf_for(&contact.key);
            let can_split = self.can_split(id);
            let k = self.k;
            if let Some(contacts) = self.buckets[id].contacts_mut() {
                if let Some(pos) = contacts.iter().position(|c| c.key == contact.key) {
                    let mut existing = contacts.remove(pos);
                    existing.last_verified = contact.last_verified;
                    contacts.push(existing);
                    return InsertOutcome::Refreshed;
                }
                if contacts.len() < k {
                    contacts.push(contact);
                    return InsertOutcome::Inserted;
                }
            }
            if !can_split {
                return InsertOutcome::Full {
                    oldest: self.oldest(id),
                };
            }
            self.split(id);
        }
    }

    fn split(&mut self, id: BucketId) {
        let prefix = self.buckets[id].prefix;
        let contacts = match &mut self.buckets[id].kind {
            BucketKind::Leaf(contacts) => std::mem::take(contacts),
            BucketKind::Split { .. } => return,
        };
        let (right, left): (Vec<_>, Vec<_>) = contacts
            .into_iter()
            .partition(|c| c.key.bit(prefix.depth));

        let left_id = self.buckets.len();
        self.buckets.push(Bucket::leaf(prefix.child(false), left));
        let right_id = self.buckets.len();
        self.buckets.push(Bucket::leaf(prefix.child(true), right));
        self.buckets[id].kind = BucketKind::Split {
            left: left_id,
            right: right_id,
        };
        trace!(prefix = %prefix, depth = prefix.depth, "split bucket");
    }

    fn remove(&mut self, key: &KadKey) -> Option<Contact> {
        let id = self.leaf_for(key);
        let contacts = self.buckets[id].contacts_mut()?;
        let pos = contacts.iter().position(|c| c.key == *key)?;
        Some(contacts.remove(pos))
    }

    fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.contacts().iter())
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts().len()).sum()
    }

    /// Up to `count` contacts ordered by distance to `target`, ties broken by raw key.
    fn closest(&self, target: &KadKey, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        #[derive(PartialEq, Eq)]
        struct Ranked<'a> {
            dist: Distance,
            contact: &'a Contact,
        }

        impl Ord for Ranked<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                self.dist
                    .cmp(&other.dist)
                    .then_with(|| self.contact.key.cmp(&other.contact.key))
            }
        }

        impl PartialOrd for Ranked<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::with_capacity(count + 1);
        for contact in self.contacts() {
            heap.push(Ranked {
                dist: contact.key.distance(target),
                contact,
            });
            if heap.len() > count {
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|ranked| ranked.contact.clone())
            .collect()
    }

    /// Leaves in key-space order.
    fn leaves(&self) -> Vec<BucketSnapshot> {
        let mut out = Vec::new();
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            match &self.buckets[id].kind {
                BucketKind::Leaf(contacts) => out.push(BucketSnapshot {
                    prefix: self.buckets[id].prefix,
                    contacts: contacts.clone(),
                }),
                BucketKind::Split { left, right } => {
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }
        out
    }

    fn stats(&self) -> RoutingStats {
        let leaves: Vec<&Bucket> = self
            .buckets
            .iter()
            .filter(|b| matches!(b.kind, BucketKind::Leaf(_)))
            .collect();
        let size = self.len();
        RoutingStats {
            size,
            buckets: leaves.len(),
            max_depth: leaves.iter().map(|b| b.prefix.depth).max().unwrap_or(0),
            average_occupancy: size as f64 / (leaves.len().max(1) * self.k) as f64,
            pending_probes: 0,
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Place(KadKey, oneshot::Sender<Placement>),
    Insert(Contact, oneshot::Sender<InsertOutcome>),
    Touch(Vec<KadKey>, oneshot::Sender<()>),
    Remove(KadKey, oneshot::Sender<Option<Contact>>),
    Find(KadKey, oneshot::Sender<Option<Contact>>),
    Closest(KadKey, usize, oneshot::Sender<Vec<Contact>>),
    Size(oneshot::Sender<usize>),
    Snapshot(oneshot::Sender<Vec<BucketSnapshot>>),
    Stats(oneshot::Sender<RoutingStats>),
}

struct TableActor {
    tree: BucketTree,
    cmd_rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    events: broadcast::Sender<RoutingEvent>,
}

impl TableActor {
    async fn run(mut self) {
        loop {
            let cmd = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(cmd);
        }
        debug!(contacts = self.tree.len(), "routing table actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Place(key, reply) => {
                let placement = self.tree.placement(&key);
                if matches!(placement, Placement::Present) {
                    self.tree.touch(&key, Instant::now());
                }
                let _ = reply.send(placement);
            }
            Command::Insert(contact, reply) => {
                let peer = contact.peer;
                let outcome = self.tree.insert(contact);
                if matches!(outcome, InsertOutcome::Inserted) {
                    self.notify(RoutingEvent::PeerAdded(peer));
                }
                let _ = reply.send(outcome);
            }
            Command::Touch(keys, reply) => {
                let now = Instant::now();
                for key in &keys {
                    self.tree.touch(key, now);
                }
                let _ = reply.send(());
            }
            Command::Remove(key, reply) => {
                let removed = self.tree.remove(&key);
                if let Some(contact) = &removed {
                    self.notify(RoutingEvent::PeerRemoved(contact.peer));
                }
                let _ = reply.send(removed);
            }
            Command::Find(key, reply) => {
                let _ = reply.send(self.tree.get(&key).cloned());
            }
            Command::Closest(key, count, reply) => {
                let _ = reply.send(self.tree.closest(&key, count));
            }
            Command::Size(reply) => {
                let _ = reply.send(self.tree.len());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.tree.leaves());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.tree.stats());
            }
        }
    }

    fn notify(&self, event: RoutingEvent) {
        if self.events.send(event).is_err() {
            trace!(?event, "no routing event subscribers");
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
struct Running {
    cmd_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

struct TableInner<N: DhtRpc> {
    local: PeerId,
    local_key: KadKey,
    config: RoutingConfig,
    network: Arc<N>,
    running: RwLock<Option<Running>>,
    events: broadcast::Sender<RoutingEvent>,
    new_contacts: ProbeQueue,
    old_contacts: ProbeQueue,
    probe_timeout: AdaptiveTimeout,
}

pub struct RoutingTable<N: DhtRpc> {
    inner: Arc<TableInner<N>>,
}

impl<N: DhtRpc> Clone for RoutingTable<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtRpc> RoutingTable<N> {
    /// Create a stopped table. Call [`start`](Self::start) before adding peers.
    pub fn new(local: PeerId, network: Arc<N>, config: RoutingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = TableInner {
            local,
            local_key: local.kad_key(),
            new_contacts: ProbeQueue::new("new-contact", config.new_contact_probe),
            old_contacts: ProbeQueue::new("old-contact", config.old_contact_probe),
            probe_timeout: AdaptiveTimeout::new(config.probe_timeout),
            config,
            network,
            running: RwLock::new(None),
            events,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn local_key(&self) -> KadKey {
        self.inner.local_key
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.inner.config
    }

    /// Spawn the actor with an empty tree. Starting a running table is a no-op.
    pub fn start(&self) {
        let mut running = self.inner.running.write();
        if running.is_some() {
            return;
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let actor = TableActor {
            tree: BucketTree::new(self.inner.local_key, &self.inner.config),
            cmd_rx,
            shutdown: shutdown.clone(),
            events: self.inner.events.clone(),
        };
        tokio::spawn(actor.run());
        *running = Some(Running { cmd_tx, shutdown });
        info!(
            local = %self.inner.local,
            k = self.inner.config.kbucket_size,
            prefix_length = self.inner.config.prefix_length,
            "routing table started"
        );
    }

    /// Abort pending probes and discard every contact.
    pub fn stop(&self) {
        if let Some(running) = self.inner.running.write().take() {
            running.shutdown.cancel();
            info!(local = %self.inner.local, "routing table stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.running.read().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.inner.events.subscribe()
    }

    fn running(&self) -> Result<Running, RoutingTableError> {
        self.inner
            .running
            .read()
            .clone()
            .ok_or(RoutingTableError::NotStarted)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RoutingTableError> {
        let running = self.running()?;
        Self::send_to(&running, build).await
    }

    /// Send to one specific actor. Admissions pin the actor they started
    /// with so a restart in between cannot split them across two trees.
    async fn send_to<T>(
        running: &Running,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RoutingTableError> {
        let (tx, rx) = oneshot::channel();
        running
            .cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RoutingTableError::NotStarted)?;
        rx.await.map_err(|_| RoutingTableError::NotStarted)
    }

    /// Propose `peer` for the table. The peer must answer a probe before it
    /// occupies a slot.
    pub async fn add(&self, peer: PeerId) -> Result<Admission, RoutingTableError> {
        self.admit(peer, false).await
    }

    /// Admit a peer that just answered one of our own requests; that round
    /// trip stands in for the admission probe.
    pub(crate) async fn add_responsive(&self, peer: PeerId) -> Result<Admission, RoutingTableError> {
        self.admit(peer, true).await
    }

    async fn admit(&self, peer: PeerId, verified: bool) -> Result<Admission, RoutingTableError> {
        let running = self.running()?;
        if peer == self.inner.local {
            return Ok(Admission::Rejected);
        }
        let key = peer.kad_key();
        let admission = match Self::send_to(&running, |tx| Command::Place(key, tx)).await? {
            Placement::Present => Admission::Refreshed,
            Placement::Vacant | Placement::Splittable => {
                if !verified && !self.probe_new(&running, peer).await? {
                    return Ok(Admission::Rejected);
                }
                match Self::send_to(&running, |tx| Command::Insert(Contact::new(peer, key), tx)).await? {
                    InsertOutcome::Inserted => Admission::Added,
                    InsertOutcome::Refreshed => Admission::Refreshed,
                    // Filled up while the candidate was being probed.
                    InsertOutcome::Full { oldest } => {
                        self.contest(&running, peer, key, oldest, true).await?
                    }
                }
            }
            Placement::Full { oldest } => {
                self.contest(&running, peer, key, oldest, verified).await?
            }
        };
        trace!(peer = %peer, ?admission, "routing table admission");
        Ok(admission)
    }

    /// Probe the oldest contacts of a full leaf and replace those that fail.
    async fn contest(
        &self,
        running: &Running,
        peer: PeerId,
        key: KadKey,
        oldest: Vec<Contact>,
        verified: bool,
    ) -> Result<Admission, RoutingTableError> {
        let mut probes = JoinSet::new();
        for contact in oldest {
            let this = self.clone();
            let shutdown = running.shutdown.clone();
            probes.spawn(async move {
                let alive = this.probe_old(&shutdown, contact.peer).await;
                (contact, alive)
            });
        }

        let mut responsive = Vec::new();
        let mut unresponsive = Vec::new();
        let mut unqueued = 0;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((contact, Ok(true))) => responsive.push(contact.key),
                Ok((contact, Ok(false))) => unresponsive.push(contact),
                // No evidence either way: the incumbent stays, but is not
                // refreshed as if it had answered.
                Ok((contact, Err(ProbeError::QueueFull))) => {
                    trace!(peer = %contact.peer, "eviction probe not queued; keeping incumbent");
                    unqueued += 1;
                }
                Ok((_, Err(ProbeError::Cancelled))) => {
                    probes.abort_all();
                    return Err(RoutingTableError::NotStarted);
                }
                Err(e) => warn!(error = %e, "eviction probe task failed"),
            }
        }

        let responsive_count = responsive.len();
        if !responsive.is_empty() {
            Self::send_to(running, |tx| Command::Touch(responsive, tx)).await?;
        }
        if unresponsive.is_empty() {
            debug!(
                peer = %peer,
                responsive = responsive_count,
                unqueued,
                "bucket full and no incumbent failed; rejecting candidate"
            );
            return Ok(Admission::Rejected);
        }
        for contact in &unresponsive {
            debug!(evicted = %contact.peer, candidate = %peer, "evicting unresponsive contact");
            Self::send_to(running, |tx| Command::Remove(contact.key, tx)).await?;
        }

        if !verified && !self.probe_new(running, peer).await? {
            return Ok(Admission::Rejected);
        }
        Ok(
            match Self::send_to(running, |tx| Command::Insert(Contact::new(peer, key), tx)).await? {
                InsertOutcome::Inserted => Admission::Added,
                InsertOutcome::Refreshed => Admission::Refreshed,
                InsertOutcome::Full { .. } => Admission::Rejected,
            },
        )
    }

    async fn probe_new(&self, running: &Running, peer: PeerId) -> Result<bool, RoutingTableError> {
        match self.probe(&self.inner.new_contacts, &running.shutdown, peer).await {
            Ok(alive) => Ok(alive),
            Err(ProbeError::QueueFull) => {
                debug!(peer = %peer, "new-contact probe queue full; rejecting candidate");
                Ok(false)
            }
            Err(ProbeError::Cancelled) => Err(RoutingTableError::NotStarted),
        }
    }

    async fn probe_old(&self, shutdown: &CancellationToken, peer: PeerId) -> Result<bool, ProbeError> {
        self.probe(&self.inner.old_contacts, shutdown, peer).await
    }

    async fn probe(
        &self,
        queue: &ProbeQueue,
        shutdown: &CancellationToken,
        peer: PeerId,
    ) -> Result<bool, ProbeError> {
        let network = self.inner.network.clone();
        let timeout = &self.inner.probe_timeout;
        queue
            .probe(peer, shutdown, async move {
                let limit = timeout.current();
                let started = Instant::now();
                match tokio::time::timeout(limit, network.ping(&peer)).await {
                    Ok(Ok(())) => {
                        timeout.record_rtt(started.elapsed());
                        true
                    }
                    Ok(Err(e)) => {
                        trace!(peer = %peer, error = %e, "probe failed");
                        false
                    }
                    Err(_) => {
                        timeout.record_timeout();
                        trace!(peer = %peer, timeout_ms = limit.as_millis() as u64, "probe timed out");
                        false
                    }
                }
            })
            .await
    }

    /// Remove a peer. Removing an absent peer is a no-op.
    pub async fn remove(&self, peer: &PeerId) -> Result<(), RoutingTableError> {
        let key = peer.kad_key();
        if let Some(contact) = self.request(|tx| Command::Remove(key, tx)).await? {
            debug!(peer = %contact.peer, "removed from routing table");
        }
        Ok(())
    }

    pub async fn find(&self, peer: &PeerId) -> Option<Contact> {
        let key = peer.kad_key();
        self.request(|tx| Command::Find(key, tx)).await.ok().flatten()
    }

    /// Up to `count` contacts closest to `key`, nearest first.
    pub async fn closest_peers(&self, key: &KadKey, count: usize) -> Vec<Contact> {
        let key = *key;
        self.request(|tx| Command::Closest(key, count, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn closest_peer(&self, key: &KadKey) -> Option<PeerId> {
        self.closest_peers(key, 1).await.first().map(|c| c.peer)
    }

    pub async fn size(&self) -> usize {
        self.request(Command::Size).await.unwrap_or(0)
    }

    /// Leaves in key-space order.
    pub async fn buckets(&self) -> Vec<BucketSnapshot> {
        self.request(Command::Snapshot).await.unwrap_or_default()
    }

    pub async fn stats(&self) -> RoutingStats {
        let mut stats = self.request(Command::Stats).await.unwrap_or_default();
        stats.pending_probes = self.inner.new_contacts.pending() + self.inner.old_contacts.pending();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::sleep;

    use crate::config::{ProbeConfig, TimeoutConfig};
    use crate::messages::{DhtRequest, DhtResponse};

    /// Answers PING for every peer except the ones marked as failing.
    #[derive(Default)]
    struct TestNetwork {
        failures: Mutex<HashSet<PeerId>>,
        latencies: Mutex<HashMap<PeerId, Duration>>,
        pings: Mutex<Vec<PeerId>>,
    }

    impl TestNetwork {
        async fn set_failure(&self, peer: PeerId, fail: bool) {
            let mut failures = self.failures.lock().await;
            if fail {
                failures.insert(peer);
            } else {
                failures.remove(&peer);
            }
        }

        async fn set_latency(&self, peer: PeerId, latency: Duration) {
            self.latencies.lock().await.insert(peer, latency);
        }

        async fn ping_calls(&self) -> Vec<PeerId> {
            self.pings.lock().await.clone()
        }
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        async fn send(&self, to: &PeerId, request: DhtRequest) -> anyhow::Result<DhtResponse> {
            self.pings.lock().await.push(*to);
            let delay = self.latencies.lock().await.get(to).copied();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            if self.failures.lock().await.contains(to) {
                return Err(anyhow!("injected network failure"));
            }
            match request {
                DhtRequest::Ping => Ok(DhtResponse::Pong),
                other => Err(anyhow!("unexpected request {}", other.name())),
            }
        }
    }

    fn config(k: usize, prefix_length: usize) -> RoutingConfig {
        RoutingConfig {
            kbucket_size: k,
            prefix_length,
            probe_timeout: TimeoutConfig::fixed(Duration::from_millis(200)),
            ..RoutingConfig::default()
        }
    }

    fn table(local: PeerId, config: RoutingConfig) -> (RoutingTable<TestNetwork>, Arc<TestNetwork>) {
        let network = Arc::new(TestNetwork::default());
        let table = RoutingTable::new(local, network.clone(), config);
        table.start();
        (table, network)
    }

    fn peer(i: u32) -> PeerId {
        PeerId::from_seed(&i.to_be_bytes())
    }

    fn leading_bits(key: &KadKey, bits: usize) -> String {
        (0..bits).map(|i| if key.bit(i) { '1' } else { '0' }).collect()
    }

    /// Brute-force a fresh peer whose kad key starts with `prefix`.
    fn peer_with_prefix(prefix: &str, seed: &mut u32, taken: &HashSet<PeerId>) -> PeerId {
        loop {
            *seed += 1;
            let candidate = peer(*seed);
            if !taken.contains(&candidate)
                && leading_bits(&candidate.kad_key(), prefix.len()) == prefix
            {
                return candidate;
            }
        }
    }

    /// `count` distinct peers from one half of the key space: the local
    /// peer's half when `near`, the other half otherwise.
    fn peers_in_half(local: &PeerId, near: bool, count: usize) -> Vec<PeerId> {
        let half = if local.kad_key().bit(0) == near { "1" } else { "0" };
        let mut taken = HashSet::from([*local]);
        let mut seed = if near { 2_000_000 } else { 1_000_000 };
        (0..count)
            .map(|_| {
                let p = peer_with_prefix(half, &mut seed, &taken);
                taken.insert(p);
                p
            })
            .collect()
    }

    fn peers_far_from(local: &PeerId, count: usize) -> Vec<PeerId> {
        peers_in_half(local, false, count)
    }

    #[test]
    fn split_scenario_yields_expected_tree() {
        let mut seed = 0;
        let mut taken = HashSet::new();
        let local = peer_with_prefix("00010", &mut seed, &taken);
        taken.insert(local);

        let config = config(2, 3);
        let mut tree = BucketTree::new(local.kad_key(), &config);

        let order = ["00010", "00011", "00111", "01000", "10111", "11001", "11111", "11110"];
        let mut by_prefix = HashMap::new();
        for prefix in order {
            let p = peer_with_prefix(prefix, &mut seed, &taken);
            taken.insert(p);
            by_prefix.insert(p, prefix);
            let outcome = tree.insert(Contact::new(p, p.kad_key()));
            assert!(matches!(outcome, InsertOutcome::Inserted), "{prefix} rejected");
        }

        let shape: Vec<(String, Vec<&str>)> = tree
            .leaves()
            .into_iter()
            .filter(|leaf| !leaf.contacts.is_empty())
            .map(|leaf| {
                (
                    leaf.prefix.to_string(),
                    leaf.contacts.iter().map(|c| by_prefix[&c.peer]).collect(),
                )
            })
            .collect();

        assert_eq!(
            shape,
            vec![
                ("000".to_string(), vec!["00010", "00011"]),
                ("001".to_string(), vec!["00111"]),
                ("01".to_string(), vec!["01000"]),
                ("10".to_string(), vec!["10111"]),
                ("110".to_string(), vec!["11001"]),
                ("111".to_string(), vec!["11111", "11110"]),
            ]
        );
    }

    #[test]
    fn self_path_policy_only_splits_local_leaf() {
        let mut seed = 0;
        let mut taken = HashSet::new();
        let local = peer_with_prefix("0", &mut seed, &taken);
        taken.insert(local);

        let mut config = config(2, 8);
        config.split_policy = SplitPolicy::SelfPath;
        let mut tree = BucketTree::new(local.kad_key(), &config);

        // Fill the far half: it splits once off the root, then stays capped.
        let far: Vec<PeerId> = (0..3)
            .map(|_| {
                let p = peer_with_prefix("1", &mut seed, &taken);
                taken.insert(p);
                p
            })
            .collect();
        assert!(matches!(tree.insert(Contact::new(far[0], far[0].kad_key())), InsertOutcome::Inserted));
        assert!(matches!(tree.insert(Contact::new(far[1], far[1].kad_key())), InsertOutcome::Inserted));
        match tree.insert(Contact::new(far[2], far[2].kad_key())) {
            InsertOutcome::Full { oldest } => {
                assert_eq!(oldest.iter().map(|c| c.peer).collect::<Vec<_>>(), vec![far[0], far[1]]);
            }
            other => panic!("expected full bucket, got {other:?}"),
        }

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[1].prefix.to_string(), "1");
        assert_eq!(leaves[1].contacts.len(), 2);
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let local = peer(0);
        let mut tree = BucketTree::new(local.kad_key(), &config(20, 32));
        for i in 1..=18 {
            let p = peer(i);
            tree.insert(Contact::new(p, p.kad_key()));
        }
        assert_eq!(tree.len(), 18);

        let target = KadKey::from_raw(b"target");
        let closest = tree.closest(&target, 15);
        assert_eq!(closest.len(), 15);
        for pair in closest.windows(2) {
            assert!(pair[0].key.distance(&target) <= pair[1].key.distance(&target));
        }

        let chosen: HashSet<PeerId> = closest.iter().map(|c| c.peer).collect();
        let farthest_chosen = closest.last().map(|c| c.key.distance(&target)).unwrap();
        for contact in tree.contacts().filter(|c| !chosen.contains(&c.peer)) {
            assert!(contact.key.distance(&target) >= farthest_chosen);
        }
        assert!(tree.closest(&target, 0).is_empty());
    }

    #[test]
    fn tree_never_exceeds_capacity_bound() {
        let local = peer(0);
        let mut tree = BucketTree::new(local.kad_key(), &config(2, 3));
        for i in 1..200 {
            let p = peer(i);
            tree.insert(Contact::new(p, p.kad_key()));
        }
        assert!(tree.len() <= (1 << 3) * 2);
    }

    #[tokio::test]
    async fn bucket_invariants_hold_under_adds_and_removes() {
        let local = peer(0);
        let (table, _network) = table(local, config(3, 6));

        for i in 1..120 {
            table.add(peer(i)).await.expect("started");
            if i % 3 == 0 {
                table.remove(&peer(i / 2)).await.expect("started");
            }
        }

        let leaves = table.buckets().await;
        let mut seen = HashSet::new();
        let mut total = 0;
        for leaf in &leaves {
            assert!(leaf.contacts.len() <= 3, "leaf {} over capacity", leaf.prefix);
            for contact in &leaf.contacts {
                assert!(leaf.prefix.matches(&contact.key));
                assert_eq!(
                    leaves.iter().filter(|l| l.prefix.matches(&contact.key)).count(),
                    1,
                    "contact matches more than one leaf"
                );
                assert!(seen.insert(contact.peer), "duplicate contact");
                total += 1;
            }
        }
        assert_eq!(total, table.size().await);
        assert!(!seen.contains(&local));
    }

    #[tokio::test]
    async fn add_requires_successful_probe() {
        let (table, network) = table(peer(0), config(20, 32));
        let silent = peer(1);
        network.set_failure(silent, true).await;

        assert_eq!(table.add(silent).await, Ok(Admission::Rejected));
        assert!(table.find(&silent).await.is_none());
        assert_eq!(network.ping_calls().await, vec![silent]);

        let live = peer(2);
        assert_eq!(table.add(live).await, Ok(Admission::Added));
        assert!(table.find(&live).await.is_some());
    }

    #[tokio::test]
    async fn slow_probe_counts_as_unreachable() {
        let (table, network) = table(peer(0), config(20, 32));
        let slow = peer(1);
        network.set_latency(slow, Duration::from_secs(5)).await;

        assert_eq!(table.add(slow).await, Ok(Admission::Rejected));
        assert_eq!(table.size().await, 0);
    }

    #[tokio::test]
    async fn failed_incumbent_is_evicted_for_verified_candidate() {
        let local = peer(0);
        let (table, network) = table(local, config(2, 1));
        let far = peers_far_from(&local, 3);

        assert_eq!(table.add(far[0]).await, Ok(Admission::Added));
        assert_eq!(table.add(far[1]).await, Ok(Admission::Added));

        network.set_failure(far[0], true).await;
        assert_eq!(table.add(far[2]).await, Ok(Admission::Added));

        assert!(table.find(&far[0]).await.is_none());
        assert!(table.find(&far[1]).await.is_some());
        assert!(table.find(&far[2]).await.is_some());
    }

    #[tokio::test]
    async fn responsive_incumbents_keep_their_slots() {
        let local = peer(0);
        let (table, _network) = table(local, config(2, 1));
        let far = peers_far_from(&local, 3);

        table.add(far[0]).await.expect("started");
        table.add(far[1]).await.expect("started");
        let before = table.find(&far[0]).await.expect("present").last_verified;

        sleep(Duration::from_millis(5)).await;
        assert_eq!(table.add(far[2]).await, Ok(Admission::Rejected));
        assert!(table.find(&far[2]).await.is_none());

        let after = table.find(&far[0]).await.expect("present").last_verified;
        assert!(after > before, "incumbent liveness should be refreshed");
    }

    #[tokio::test]
    async fn incumbent_left_unpinged_is_kept_but_not_refreshed() {
        let local = peer(0);
        let mut config = config(2, 1);
        config.old_contact_probe = ProbeConfig {
            concurrency: 1,
            max_queue_size: 0,
        };
        let (table, network) = table(local, config);
        let far = peers_far_from(&local, 3);

        table.add(far[0]).await.expect("started");
        table.add(far[1]).await.expect("started");
        // Slow answers keep the single slot busy while the second incumbent asks for it.
        network.set_latency(far[0], Duration::from_millis(50)).await;
        network.set_latency(far[1], Duration::from_millis(50)).await;
        let before = [
            table.find(&far[0]).await.expect("present").last_verified,
            table.find(&far[1]).await.expect("present").last_verified,
        ];
        let pings_before = network.ping_calls().await.len();

        sleep(Duration::from_millis(5)).await;
        assert_eq!(table.add(far[2]).await, Ok(Admission::Rejected));

        let pinged = network.ping_calls().await.split_off(pings_before);
        assert_eq!(pinged.len(), 1);
        for (i, incumbent) in far[..2].iter().enumerate() {
            let after = table.find(incumbent).await.expect("incumbent kept").last_verified;
            if pinged.contains(incumbent) {
                assert!(after > before[i], "answering incumbent should be refreshed");
            } else {
                assert_eq!(after, before[i], "unpinged incumbent must not be refreshed");
            }
        }
        assert!(table.find(&far[2]).await.is_none());
    }

    #[tokio::test]
    async fn restart_does_not_reuse_previous_actor() {
        let local = peer(0);
        let (table, _network) = table(local, config(2, 1));
        table.add(peer(1)).await.expect("started");
        let previous = table.running().expect("started");

        table.stop();
        table.start();

        assert_eq!(
            RoutingTable::<TestNetwork>::send_to(&previous, Command::Size).await,
            Err(RoutingTableError::NotStarted)
        );
        assert_eq!(table.size().await, 0);
    }

    #[tokio::test]
    async fn admission_interrupted_by_restart_leaves_new_table_empty() {
        let local = peer(0);
        let (table, network) = table(local, config(2, 1));
        let candidate = peer(1);
        network.set_latency(candidate, Duration::from_millis(100)).await;

        let pending = tokio::spawn({
            let table = table.clone();
            async move { table.add(candidate).await }
        });
        sleep(Duration::from_millis(20)).await;
        table.stop();
        table.start();

        let outcome = pending.await.expect("admission task");
        assert_eq!(outcome, Err(RoutingTableError::NotStarted));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(table.size().await, 0);
        assert!(table.find(&candidate).await.is_none());
    }

    #[tokio::test]
    async fn candidate_must_answer_even_after_eviction() {
        let local = peer(0);
        let (table, network) = table(local, config(2, 1));
        let near = peers_in_half(&local, true, 1);
        let far = peers_far_from(&local, 3);

        // Root splits here, leaving the far leaf at maximum depth.
        table.add(near[0]).await.expect("started");
        table.add(far[0]).await.expect("started");
        table.add(far[1]).await.expect("started");
        assert_eq!(table.buckets().await.len(), 2);

        network.set_failure(far[0], true).await;
        network.set_failure(far[2], true).await;

        assert_eq!(table.add(far[2]).await, Ok(Admission::Rejected));
        assert!(table.find(&far[0]).await.is_none());
        assert!(table.find(&far[2]).await.is_none());
        assert_eq!(table.size().await, 2);
    }

    #[tokio::test]
    async fn readd_and_double_remove_are_idempotent() {
        let (table, _network) = table(peer(0), config(20, 32));
        let p = peer(7);

        assert_eq!(table.add(p).await, Ok(Admission::Added));
        let first = table.find(&p).await.expect("present").last_verified;
        sleep(Duration::from_millis(5)).await;
        assert_eq!(table.add(p).await, Ok(Admission::Refreshed));
        assert_eq!(table.size().await, 1);
        assert!(table.find(&p).await.expect("present").last_verified > first);

        let absent = peer(8);
        assert_eq!(table.remove(&absent).await, Ok(()));
        assert_eq!(table.remove(&absent).await, Ok(()));
        assert_eq!(table.remove(&p).await, Ok(()));
        assert_eq!(table.remove(&p).await, Ok(()));
        assert_eq!(table.size().await, 0);
    }

    #[tokio::test]
    async fn local_peer_is_never_admitted() {
        let local = peer(0);
        let (table, network) = table(local, config(20, 32));
        assert_eq!(table.add(local).await, Ok(Admission::Rejected));
        assert_eq!(table.size().await, 0);
        assert!(network.ping_calls().await.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_errors_and_cleared_state() {
        let network = Arc::new(TestNetwork::default());
        let table = RoutingTable::new(peer(0), network, config(20, 32));

        assert_eq!(table.add(peer(1)).await, Err(RoutingTableError::NotStarted));
        assert_eq!(table.remove(&peer(1)).await, Err(RoutingTableError::NotStarted));
        assert!(table.closest_peers(&peer(1).kad_key(), 5).await.is_empty());

        table.start();
        table.add(peer(1)).await.expect("started");
        assert_eq!(table.size().await, 1);

        table.stop();
        assert!(!table.is_started());
        assert_eq!(table.add(peer(2)).await, Err(RoutingTableError::NotStarted));
        assert_eq!(table.size().await, 0);

        table.start();
        assert_eq!(table.size().await, 0, "restart begins with an empty tree");
    }

    #[tokio::test]
    async fn stop_aborts_in_flight_admission() {
        let (table, network) = table(peer(0), config(20, 32));
        let slow = peer(1);
        network.set_latency(slow, Duration::from_millis(150)).await;

        let pending = {
            let table = table.clone();
            tokio::spawn(async move { table.add(slow).await })
        };
        sleep(Duration::from_millis(20)).await;
        table.stop();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("add should resolve promptly")
            .expect("join");
        assert_eq!(result, Err(RoutingTableError::NotStarted));
    }

    #[tokio::test]
    async fn events_follow_structural_changes() {
        let local = peer(0);
        let (table, network) = table(local, config(2, 1));
        let mut events = table.subscribe();
        let far = peers_far_from(&local, 3);

        table.add(far[0]).await.expect("started");
        table.add(far[1]).await.expect("started");
        network.set_failure(far[0], true).await;
        table.add(far[2]).await.expect("started");

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                RoutingEvent::PeerAdded(far[0]),
                RoutingEvent::PeerAdded(far[1]),
                RoutingEvent::PeerRemoved(far[0]),
                RoutingEvent::PeerAdded(far[2]),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_admissions_share_probes() {
        let (table, network) = table(peer(0), {
            let mut c = config(20, 32);
            c.new_contact_probe = ProbeConfig {
                concurrency: 2,
                max_queue_size: 50,
            };
            c
        });
        let p = peer(3);
        network.set_latency(p, Duration::from_millis(30)).await;

        let mut tasks = JoinSet::new();
        for _ in 0..4 {
            let table = table.clone();
            tasks.spawn(async move { table.add(p).await });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.expect("join").expect("started"));
        }

        assert_eq!(outcomes.iter().filter(|o| **o == Admission::Added).count(), 1);
        assert_eq!(table.size().await, 1);
        assert_eq!(network.ping_calls().await, vec![p]);
    }

    #[tokio::test]
    async fn closest_peers_end_to_end() {
        let (table, _network) = table(peer(0), config(20, 32));
        for i in 1..=18 {
            assert_eq!(table.add(peer(i)).await, Ok(Admission::Added));
        }
        assert_eq!(table.size().await, 18);

        let target = KadKey::from_raw(b"some content");
        let closest = table.closest_peers(&target, 15).await;
        assert_eq!(closest.len(), 15);

        let chosen: HashSet<PeerId> = closest.iter().map(|c| c.peer).collect();
        let cutoff = closest.last().map(|c| c.key.distance(&target)).unwrap();
        for i in 1..=18 {
            let p = peer(i);
            if !chosen.contains(&p) {
                assert!(p.kad_key().distance(&target) >= cutoff);
            }
        }

        let stats = table.stats().await;
        assert_eq!(stats.size, 18);
        assert!(stats.buckets >= 1);
        assert_eq!(stats.pending_probes, 0);
        assert_eq!(table.closest_peer(&target).await, closest.first().map(|c| c.peer));
    }
}
