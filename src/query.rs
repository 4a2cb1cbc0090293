//! # Query Engine
//!
//! Iterative lookups over `d` disjoint paths with at most `α` outstanding
//! RPCs per path. Each query runs as one spawned driver task that owns every
//! path and every in-flight RPC; callers observe it through a [`QueryStream`].
//!
//! ## Lifecycle of a path
//!
//! ```text
//! Seeded -> InFlight -> Converged | Exhausted | Satisfied
//! ```
//!
//! - **Converged**: α consecutive answers revealed nothing closer than the
//!   best peer the path already knew
//! - **Exhausted**: nothing left to ask and nothing in flight
//! - **Satisfied**: the mode's terminal condition was met (target found,
//!   value found)
//!
//! Peers are dispatched nearest first, ties in discovery order. A peer
//! claimed by one path is never queried by another, and paths never share
//! what they learn. Learned peers are proposed to the routing table; the
//! engine never evicts.
//!
//! ## Backpressure and cancellation
//!
//! Events flow through a channel of capacity one, so the driver stalls as
//! soon as the consumer stops pulling. Dropping the stream, calling
//! [`QueryStream::stop`], firing the caller's token or stopping the engine
//! drops the driver, which aborts every in-flight RPC.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use anyhow::anyhow;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::QueryConfig;
use crate::identity::{Distance, KadKey, PeerId};
use crate::messages::{DhtRequest, DhtResponse};
use crate::probe::AdaptiveTimeout;
use crate::protocols::DhtRpc;
use crate::record::{Record, RecordPolicy};
use crate::routing::{RoutingEvent, RoutingTable};

/// The key a query converges on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryTarget {
    raw: Vec<u8>,
    key: KadKey,
    peer: Option<PeerId>,
}

impl QueryTarget {
    pub fn peer(peer: &PeerId) -> Self {
        Self {
            raw: peer.as_bytes().to_vec(),
            key: peer.kad_key(),
            peer: Some(*peer),
        }
    }

    pub fn key(raw: impl Into<Vec<u8>>) -> Self {
        let raw = raw.into();
        Self {
            key: KadKey::from_raw(&raw),
            raw,
            peer: None,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn kad_key(&self) -> &KadKey {
        &self.key
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMode {
    /// Stops as soon as any path sees the target peer.
    FindPeer,
    GetClosestPeers,
    /// Without `seek_best` a path stops at its first valid value; with it,
    /// paths run to the end and only improving values are reported.
    GetValue { seek_best: bool },
    GetProviders,
    /// Closest-peer lookup ahead of a `PUT_VALUE` or `ADD_PROVIDER` fan-out.
    Put,
}

impl QueryMode {
    fn request(&self, target: &QueryTarget) -> DhtRequest {
        let key = target.raw.clone();
        match self {
            QueryMode::FindPeer | QueryMode::GetClosestPeers | QueryMode::Put => {
                DhtRequest::FindNode { key }
            }
            QueryMode::GetValue { .. } => DhtRequest::GetValue { key },
            QueryMode::GetProviders => DhtRequest::GetProviders { key },
        }
    }

    fn reports_closest(&self) -> bool {
        matches!(self, QueryMode::GetClosestPeers | QueryMode::Put)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryEvent {
    /// A queried peer answered.
    PeerResponse {
        from: PeerId,
        path: usize,
        closer: Vec<PeerId>,
        record: Option<Record>,
        providers: Vec<PeerId>,
    },
    /// The target peer was located, or (for closest-peer lookups) one of the
    /// K closest peers that answered.
    FinalPeer { from: PeerId, peer: PeerId },
    Value { from: PeerId, record: Record },
    Provider { from: PeerId, provider: PeerId },
    /// A peer failed, timed out, or returned something unusable.
    QueryError {
        from: PeerId,
        path: usize,
        error: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub alpha: Option<usize>,
    pub disjoint_paths: Option<usize>,
    pub cancel: Option<CancellationToken>,
    /// Peers queried in addition to the routing table's closest contacts.
    pub seeds: Vec<PeerId>,
    /// Overrides [`QueryConfig::allow_query_with_zero_peers`].
    pub allow_zero_peers: Option<bool>,
}

impl QueryOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::default()
        }
    }
}

/// Lazy, single-consumer sequence of [`QueryEvent`]s.
pub struct QueryStream {
    id: u64,
    rx: mpsc::Receiver<QueryEvent>,
    cancel: CancellationToken,
}

impl QueryStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn next_event(&mut self) -> Option<QueryEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Abort the query. No further events are yielded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Stream for QueryStream {
    type Item = QueryEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EngineInner<N: DhtRpc> {
    local: PeerId,
    routing: RoutingTable<N>,
    network: Arc<N>,
    policy: Arc<dyn RecordPolicy>,
    config: QueryConfig,
    k: usize,
    rpc_timeout: AdaptiveTimeout,
    shutdown: RwLock<Option<CancellationToken>>,
    next_id: AtomicU64,
}

impl<N: DhtRpc> EngineInner<N> {
    /// One RPC under the adaptive timeout. Refusals and answers of the wrong
    /// kind count as failures.
    async fn call(&self, peer: &PeerId, request: DhtRequest) -> anyhow::Result<DhtResponse> {
        let limit = self.rpc_timeout.current();
        let started = Instant::now();
        let name = request.name();
        let expected = request.clone();
        match tokio::time::timeout(limit, self.network.send(peer, request)).await {
            Ok(Ok(DhtResponse::Error { message })) => Err(anyhow!("peer refused {name}: {message}")),
            Ok(Ok(response)) if !expected.accepts(&response) => {
                trace!(peer = %peer, request = name, response = response.name(), "mismatched response");
                Err(anyhow!("unexpected {} response to {name}", response.name()))
            }
            Ok(Ok(response)) => {
                self.rpc_timeout.record_rtt(started.elapsed());
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.rpc_timeout.record_timeout();
                Err(anyhow!("{name} timed out after {}ms", limit.as_millis()))
            }
        }
    }
}

pub struct QueryEngine<N: DhtRpc> {
    inner: Arc<EngineInner<N>>,
}

impl<N: DhtRpc> Clone for QueryEngine<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtRpc> QueryEngine<N> {
    /// Create a stopped engine seeded from `routing`.
    pub fn new(
        routing: RoutingTable<N>,
        network: Arc<N>,
        policy: Arc<dyn RecordPolicy>,
        config: QueryConfig,
    ) -> Self {
        let inner = EngineInner {
            local: routing.local_peer(),
            k: routing.config().kbucket_size,
            rpc_timeout: AdaptiveTimeout::new(config.rpc_timeout),
            routing,
            network,
            policy,
            config,
            shutdown: RwLock::new(None),
            next_id: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn start(&self) {
        let mut shutdown = self.inner.shutdown.write();
        if shutdown.is_none() {
            *shutdown = Some(CancellationToken::new());
        }
    }

    /// Cancel every running query. Queries issued while stopped end immediately.
    pub fn stop(&self) {
        if let Some(token) = self.inner.shutdown.write().take() {
            token.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.shutdown.read().is_some()
    }

    pub fn routing(&self) -> &RoutingTable<N> {
        &self.inner.routing
    }

    /// Send one request outside any query, sharing the queries' adaptive
    /// timeout.
    pub(crate) async fn call(&self, peer: &PeerId, request: DhtRequest) -> anyhow::Result<DhtResponse> {
        self.inner.call(peer, request).await
    }

    pub fn query(&self, target: QueryTarget, mode: QueryMode, options: QueryOptions) -> QueryStream {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let stream = QueryStream {
            id,
            rx,
            cancel: cancel.clone(),
        };

        let Some(shutdown) = self.inner.shutdown.read().clone() else {
            debug!(query = id, "query engine stopped; query yields nothing");
            return stream;
        };

        let config = &self.inner.config;
        let alpha = options.alpha.unwrap_or(config.alpha).max(1);
        let disjoint_paths = options
            .disjoint_paths
            .unwrap_or_else(|| config.disjoint_paths())
            .max(1);
        let run = QueryRun {
            id,
            engine: self.inner.clone(),
            request: mode.request(&target),
            target,
            mode,
            alpha,
            disjoint_paths,
            seeds: options.seeds,
            allow_zero_peers: options
                .allow_zero_peers
                .unwrap_or(config.allow_query_with_zero_peers),
            tx,
        };
        tokio::spawn(run.drive(cancel, shutdown));
        stream
    }
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PathState {
    Seeded,
    InFlight,
    Converged,
    Exhausted,
    Satisfied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateStatus {
    Waiting,
    InFlight,
    Answered,
    Failed,
    /// Claimed by another path.
    Skipped,
}

#[derive(Debug)]
struct Candidate {
    peer: PeerId,
    distance: Distance,
    seq: u64,
    status: CandidateStatus,
}

struct Path {
    index: usize,
    alpha: usize,
    k: usize,
    /// Sorted by (distance, discovery order).
    candidates: Vec<Candidate>,
    known: HashSet<PeerId>,
    in_flight: HashMap<PeerId, AbortHandle>,
    best: Distance,
    stale: usize,
    state: PathState,
    next_seq: u64,
}

impl Path {
    fn new(index: usize, alpha: usize, k: usize) -> Self {
        Self {
            index,
            alpha,
            k,
            candidates: Vec::new(),
            known: HashSet::new(),
            in_flight: HashMap::new(),
            best: Distance::MAX,
            stale: 0,
            state: PathState::Seeded,
            next_seq: 0,
        }
    }

    fn is_done(&self) -> bool {
        matches!(
            self.state,
            PathState::Converged | PathState::Exhausted | PathState::Satisfied
        )
    }

    /// Add a peer to the frontier. Returns whether it beats the best known distance.
    fn offer(&mut self, peer: PeerId, distance: Distance) -> bool {
        if !self.known.insert(peer) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = self
            .candidates
            .partition_point(|c| (c.distance, c.seq) < (distance, seq));
        self.candidates.insert(
            pos,
            Candidate {
                peer,
                distance,
                seq,
                status: CandidateStatus::Waiting,
            },
        );

        let mut waiting = 0;
        let k = self.k;
        self.candidates.retain(|c| {
            if c.status != CandidateStatus::Waiting {
                return true;
            }
            waiting += 1;
            waiting <= k
        });

        if distance < self.best {
            self.best = distance;
            true
        } else {
            false
        }
    }

    /// Claim up to `α - in_flight` of the nearest waiting peers.
    fn next_batch(&mut self, claimed: &mut HashSet<PeerId>) -> Vec<PeerId> {
        let mut batch = Vec::new();
        for candidate in self.candidates.iter_mut() {
            if self.in_flight.len() + batch.len() >= self.alpha {
                break;
            }
            if candidate.status != CandidateStatus::Waiting {
                continue;
            }
            if !claimed.insert(candidate.peer) {
                candidate.status = CandidateStatus::Skipped;
                continue;
            }
            candidate.status = CandidateStatus::InFlight;
            batch.push(candidate.peer);
        }
        batch
    }

    fn set_status(&mut self, peer: &PeerId, status: CandidateStatus) {
        self.in_flight.remove(peer);
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.peer == *peer) {
            candidate.status = status;
        }
    }

    fn on_response(&mut self, peer: &PeerId, learned: &[(PeerId, Distance)]) {
        self.set_status(peer, CandidateStatus::Answered);
        let mut improved = false;
        for (learned, distance) in learned {
            improved |= self.offer(*learned, *distance);
        }
        if improved {
            self.stale = 0;
        } else {
            self.stale += 1;
        }
    }

    fn on_failure(&mut self, peer: &PeerId) {
        self.set_status(peer, CandidateStatus::Failed);
    }

    fn refresh_state(&mut self) {
        if self.is_done() {
            return;
        }
        let waiting = self
            .candidates
            .iter()
            .any(|c| c.status == CandidateStatus::Waiting);
        if self.stale >= self.alpha {
            self.finish(PathState::Converged);
        } else if self.in_flight.is_empty() && !waiting {
            self.finish(PathState::Exhausted);
        } else if !self.in_flight.is_empty() {
            self.state = PathState::InFlight;
        }
    }

    fn finish(&mut self, state: PathState) {
        self.state = state;
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
        trace!(path = self.index, ?state, "path finished");
    }
}

// ============================================================================
// Driver
// ============================================================================

struct RpcOutcome {
    path: usize,
    peer: PeerId,
    result: anyhow::Result<DhtResponse>,
}

/// Best value seen by a `seek_best` lookup.
struct BestValue {
    record: Record,
}

struct QueryRun<N: DhtRpc> {
    id: u64,
    engine: Arc<EngineInner<N>>,
    target: QueryTarget,
    mode: QueryMode,
    request: DhtRequest,
    alpha: usize,
    disjoint_paths: usize,
    seeds: Vec<PeerId>,
    allow_zero_peers: bool,
    tx: mpsc::Sender<QueryEvent>,
}

impl<N: DhtRpc> QueryRun<N> {
    async fn drive(self, cancel: CancellationToken, shutdown: CancellationToken) {
        let id = self.id;
        let started = Instant::now();
        tokio::select! {
            _ = cancel.cancelled() => debug!(query = id, "query cancelled"),
            _ = shutdown.cancelled() => debug!(query = id, "query aborted by engine shutdown"),
            _ = self.execute() => {
                trace!(query = id, elapsed_ms = started.elapsed().as_millis() as u64, "query finished");
            }
        }
    }

    async fn emit(&self, event: QueryEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn execute(self) {
        if !self.await_usable_peers().await {
            return;
        }

        let key = self.target.key;
        let local = self.engine.local;
        let mut seeds: Vec<(Distance, PeerId)> = self
            .engine
            .routing
            .closest_peers(&key, self.engine.k)
            .await
            .into_iter()
            .map(|c| c.peer)
            .chain(self.seeds.iter().copied())
            .filter(|p| *p != local)
            .map(|p| (p.kad_key().distance(&key), p))
            .collect();
        seeds.sort();
        seeds.dedup_by(|a, b| a.1 == b.1);
        if seeds.is_empty() {
            debug!(query = self.id, target = %key, "no peers to query");
            return;
        }

        let path_count = self.disjoint_paths.min(seeds.len());
        let mut paths: Vec<Path> = (0..path_count)
            .map(|i| Path::new(i, self.alpha, self.engine.k))
            .collect();
        for (i, (distance, peer)) in seeds.iter().enumerate() {
            paths[i % path_count].offer(*peer, *distance);
        }
        debug!(
            query = self.id,
            mode = ?self.mode,
            target = %key,
            seeds = seeds.len(),
            paths = path_count,
            alpha = self.alpha,
            "query started"
        );

        let mut claimed: HashSet<PeerId> = HashSet::new();
        let mut rpcs: JoinSet<RpcOutcome> = JoinSet::new();
        let mut answered: Vec<(Distance, PeerId)> = Vec::new();
        let mut providers_seen: HashSet<PeerId> = HashSet::new();
        let mut best_value: Option<BestValue> = None;

        loop {
            for path in paths.iter_mut().filter(|p| !p.is_done()) {
                for peer in path.next_batch(&mut claimed) {
                    trace!(query = self.id, path = path.index, peer = %peer, "dispatching {}", self.request.name());
                    let handle = rpcs.spawn(self.rpc(path.index, peer));
                    path.in_flight.insert(peer, handle);
                }
                path.refresh_state();
            }
            if paths.iter().all(Path::is_done) {
                break;
            }

            let Some(joined) = rpcs.join_next().await else {
                break;
            };
            let RpcOutcome { path, peer, result } = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    warn!(query = self.id, error = %e, "query rpc task failed");
                    continue;
                }
            };
            if paths[path].is_done() {
                continue;
            }

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    trace!(query = self.id, path, peer = %peer, error = %e, "query rpc failed");
                    paths[path].on_failure(&peer);
                    paths[path].refresh_state();
                    let event = QueryEvent::QueryError {
                        from: peer,
                        path,
                        error: e.to_string(),
                    };
                    if !self.emit(event).await {
                        return;
                    }
                    continue;
                }
            };

            self.propose(peer, true);
            answered.push((peer.kad_key().distance(&key), peer));

            let (closer, providers, record) = match response {
                DhtResponse::Nodes { closer } => (closer, Vec::new(), None),
                DhtResponse::Value { record, closer } => (closer, Vec::new(), record),
                DhtResponse::Providers { providers, closer } => (closer, providers, None),
                DhtResponse::Pong | DhtResponse::Ack | DhtResponse::Error { .. } => {
                    (Vec::new(), Vec::new(), None)
                }
            };
            let closer: Vec<PeerId> = closer.into_iter().filter(|p| *p != local).collect();
            for learned in &closer {
                self.propose(*learned, false);
            }
            let learned: Vec<(PeerId, Distance)> = closer
                .iter()
                .map(|p| (*p, p.kad_key().distance(&key)))
                .collect();
            paths[path].on_response(&peer, &learned);

            let (record, rejection) = match record {
                Some(record) => match self.check_record(&record) {
                    Ok(()) => (Some(record), None),
                    Err(reason) => (None, Some(reason)),
                },
                None => (None, None),
            };

            let mut events = vec![QueryEvent::PeerResponse {
                from: peer,
                path,
                closer: closer.clone(),
                record: record.clone(),
                providers: providers.clone(),
            }];
            if let Some(error) = rejection {
                events.push(QueryEvent::QueryError {
                    from: peer,
                    path,
                    error,
                });
            }

            let mut query_done = false;
            match self.mode {
                QueryMode::FindPeer => {
                    if let Some(wanted) = self.target.peer
                        && (peer == wanted || closer.contains(&wanted))
                    {
                        events.push(QueryEvent::FinalPeer { from: peer, peer: wanted });
                        query_done = true;
                    }
                }
                QueryMode::GetValue { seek_best } => {
                    if let Some(record) = record {
                        if !seek_best {
                            paths[path].finish(PathState::Satisfied);
                            events.push(QueryEvent::Value { from: peer, record });
                        } else if self.improves(&mut best_value, &record) {
                            events.push(QueryEvent::Value { from: peer, record });
                        }
                    }
                }
                QueryMode::GetProviders => {
                    for provider in providers {
                        if providers_seen.insert(provider) {
                            events.push(QueryEvent::Provider { from: peer, provider });
                        }
                    }
                }
                QueryMode::GetClosestPeers | QueryMode::Put => {}
            }
            paths[path].refresh_state();

            for event in events {
                if !self.emit(event).await {
                    return;
                }
            }
            if query_done {
                debug!(query = self.id, target = %key, "target peer found");
                return;
            }
        }

        debug!(
            query = self.id,
            target = %key,
            queried = claimed.len(),
            answered = answered.len(),
            "query paths terminated"
        );

        if self.mode.reports_closest() {
            answered.sort();
            answered.dedup_by(|a, b| a.1 == b.1);
            for (_, peer) in answered.into_iter().take(self.engine.k) {
                if !self.emit(QueryEvent::FinalPeer { from: local, peer }).await {
                    return;
                }
            }
        }
    }

    /// Wait until the routing table has a peer to seed from.
    async fn await_usable_peers(&self) -> bool {
        let routing = &self.engine.routing;
        if !routing.is_started() {
            debug!(query = self.id, "routing table not started; query yields nothing");
            return false;
        }
        if self.allow_zero_peers || !self.seeds.is_empty() {
            return true;
        }
        let mut events = routing.subscribe();
        if routing.size().await > 0 {
            return true;
        }

        debug!(query = self.id, "routing table empty; waiting for first peer");
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(RoutingEvent::PeerAdded(_)) => return true,
                    Ok(RoutingEvent::PeerRemoved(_)) => continue,
                    Err(RecvError::Lagged(_)) => {
                        if routing.size().await > 0 {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        };
        match tokio::time::timeout(self.engine.config.table_wait_timeout, wait).await {
            Ok(ready) => ready,
            Err(_) => {
                debug!(query = self.id, "no peers appeared; abandoning query");
                false
            }
        }
    }

    fn rpc(&self, path: usize, peer: PeerId) -> impl Future<Output = RpcOutcome> + Send + 'static {
        let engine = self.engine.clone();
        let request = self.request.clone();
        async move {
            let result = engine.call(&peer, request).await;
            RpcOutcome { path, peer, result }
        }
    }

    /// Hand a peer to the routing table without waiting on the outcome.
    fn propose(&self, peer: PeerId, responsive: bool) {
        let routing = self.engine.routing.clone();
        tokio::spawn(async move {
            let admitted = if responsive {
                routing.add_responsive(peer).await
            } else {
                routing.add(peer).await
            };
            if let Err(e) = admitted {
                trace!(peer = %peer, error = %e, "could not propose peer to routing table");
            }
        });
    }

    fn check_record(&self, record: &Record) -> Result<(), String> {
        if record.key != self.target.raw {
            return Err("record key does not match query key".to_string());
        }
        self.engine
            .policy
            .validate(&record.key, &record.value)
            .map_err(|e| e.to_string())
    }

    /// Track the best value for `seek_best`; true when `record` replaces it.
    fn improves(&self, best: &mut Option<BestValue>, record: &Record) -> bool {
        let Some(current) = best else {
            *best = Some(BestValue {
                record: record.clone(),
            });
            return true;
        };
        if current.record.value == record.value {
            return false;
        }
        let candidates = vec![current.record.value.clone(), record.value.clone()];
        if self.engine.policy.select(&record.key, &candidates) == 1 {
            current.record = record.clone();
            true
        } else {
            false
        }
    }
}
