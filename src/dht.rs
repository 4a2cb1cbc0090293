//! # Peer and Content Routing
//!
//! [`KadDht`] ties the routing table, the query engine and the local record
//! and provider stores together behind the usual Kademlia operations.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `bootstrap(seeds)` | Admit seed peers, then look up our own id |
//! | `find_peer(id)` | Local table first, then a `FindPeer` query |
//! | `get_closest_peers(key)` | Lazy stream of the K closest responsive peers |
//! | `get(key, seek_best)` | Local store first, then a `GetValue` query |
//! | `put(key, value)` | Store locally, then `PUT_VALUE` to the closest peers |
//! | `provide(key)` | Announce ourselves, then `ADD_PROVIDER` to the closest peers |
//! | `find_providers(key)` | Local providers, then remote ones, de-duplicated |
//! | `handle_request(from, req)` | Serve an inbound request |
//!
//! Replication is best-effort: `put` and `provide` report how many peers
//! acknowledged and never fail for want of a quorum.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::identity::{KadKey, PeerId};
use crate::messages::{DhtRequest, DhtResponse};
use crate::protocols::DhtRpc;
use crate::query::{QueryEngine, QueryEvent, QueryMode, QueryOptions, QueryTarget};
use crate::record::{ProviderStore, Record, RecordPolicy, RecordStore};
use crate::routing::{Admission, RoutingTable};

struct DhtInner<N: DhtRpc> {
    local: PeerId,
    config: DhtConfig,
    network: Arc<N>,
    policy: Arc<dyn RecordPolicy>,
    routing: RoutingTable<N>,
    queries: QueryEngine<N>,
    records: Mutex<RecordStore>,
    providers: Mutex<ProviderStore>,
}

pub struct KadDht<N: DhtRpc> {
    inner: Arc<DhtInner<N>>,
}

impl<N: DhtRpc> Clone for KadDht<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtRpc> KadDht<N> {
    pub fn new(
        local: PeerId,
        network: Arc<N>,
        config: DhtConfig,
        policy: Arc<dyn RecordPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let routing = RoutingTable::new(local, network.clone(), config.routing.clone());
        let queries = QueryEngine::new(
            routing.clone(),
            network.clone(),
            policy.clone(),
            config.query.clone(),
        );
        let store = &config.store;
        let records = RecordStore::new(store.max_records, store.record_ttl);
        let providers = ProviderStore::new(
            store.max_provider_keys,
            store.max_providers_per_key,
            store.provider_ttl,
        );
        let inner = DhtInner {
            local,
            network,
            policy,
            routing,
            queries,
            records: Mutex::new(records),
            providers: Mutex::new(providers),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn routing(&self) -> &RoutingTable<N> {
        &self.inner.routing
    }

    pub fn queries(&self) -> &QueryEngine<N> {
        &self.inner.queries
    }

    pub fn start(&self) {
        self.inner.routing.start();
        self.inner.queries.start();
        info!(local = %self.inner.local, "dht started");
    }

    /// Cancel running queries and probes. Local records are kept.
    pub fn stop(&self) {
        self.inner.queries.stop();
        self.inner.routing.stop();
        info!(local = %self.inner.local, "dht stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.routing.is_started() && self.inner.queries.is_started()
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.is_started() {
            bail!("dht is not started");
        }
        Ok(())
    }

    /// Admit `seeds`, then run a self-lookup through them. Returns the routing
    /// table size afterwards.
    pub async fn bootstrap(&self, seeds: &[PeerId]) -> Result<usize> {
        self.ensure_started()?;

        let mut admissions = JoinSet::new();
        for seed in seeds.iter().copied().filter(|s| *s != self.inner.local) {
            let routing = self.inner.routing.clone();
            admissions.spawn(async move { (seed, routing.add(seed).await) });
        }
        let mut admitted = 0;
        while let Some(joined) = admissions.join_next().await {
            match joined {
                Ok((_, Ok(Admission::Added | Admission::Refreshed))) => admitted += 1,
                Ok((seed, Ok(Admission::Rejected))) => {
                    debug!(seed = %seed, "bootstrap seed did not answer");
                }
                Ok((_, Err(e))) => return Err(e.into()),
                Err(e) => warn!(error = %e, "bootstrap admission task failed"),
            }
        }

        let options = QueryOptions {
            seeds: seeds.to_vec(),
            allow_zero_peers: Some(true),
            ..QueryOptions::default()
        };
        let mut lookup = self.inner.queries.query(
            QueryTarget::peer(&self.inner.local),
            QueryMode::GetClosestPeers,
            options,
        );
        let mut found = 0;
        while let Some(event) = lookup.next().await {
            if matches!(event, QueryEvent::FinalPeer { .. }) {
                found += 1;
            }
        }

        let size = self.inner.routing.size().await;
        info!(
            seeds = seeds.len(),
            admitted,
            found,
            table_size = size,
            "bootstrap complete"
        );
        Ok(size)
    }

    /// Locate `peer`. `None` when no path reached it.
    pub async fn find_peer(&self, peer: &PeerId) -> Result<Option<PeerId>> {
        self.ensure_started()?;
        if self.inner.routing.find(peer).await.is_some() {
            trace!(peer = %peer, "peer found in routing table");
            return Ok(Some(*peer));
        }

        let mut query = self.inner.queries.query(
            QueryTarget::peer(peer),
            QueryMode::FindPeer,
            QueryOptions::default(),
        );
        while let Some(event) = query.next().await {
            if let QueryEvent::FinalPeer { peer: found, from } = event {
                debug!(peer = %found, via = %from, "peer located");
                return Ok(Some(found));
            }
        }
        debug!(peer = %peer, "peer not found");
        Ok(None)
    }

    /// The K closest responsive peers to `key`, nearest first. Nothing is
    /// yielded until the lookup has converged.
    pub fn get_closest_peers(
        &self,
        key: impl Into<Vec<u8>>,
    ) -> impl Stream<Item = PeerId> + Send + Unpin + 'static {
        self.inner
            .queries
            .query(
                QueryTarget::key(key),
                QueryMode::GetClosestPeers,
                QueryOptions::default(),
            )
            .filter_map(|event| match event {
                QueryEvent::FinalPeer { peer, .. } => Some(peer),
                _ => None,
            })
    }

    pub async fn closest_peers(&self, key: impl Into<Vec<u8>>) -> Vec<PeerId> {
        self.get_closest_peers(key).collect().await
    }

    /// Fetch the record stored under `key`.
    ///
    /// Without `seek_best` the local store answers first and the first valid
    /// remote value wins. With it, every path runs to the end, the policy
    /// picks the best value (local copy included), and peers that returned a
    /// different value are sent the winner.
    pub async fn get(&self, key: impl Into<Vec<u8>>, seek_best: bool) -> Result<Option<Record>> {
        self.ensure_started()?;
        let key = key.into();
        let local = self.inner.records.lock().get(&key);
        if !seek_best && let Some(record) = local {
            trace!(key = %hex::encode(&key), "record served from local store");
            return Ok(Some(record));
        }

        let mut query = self.inner.queries.query(
            QueryTarget::key(key.clone()),
            QueryMode::GetValue { seek_best },
            QueryOptions::default(),
        );

        if !seek_best {
            while let Some(event) = query.next().await {
                if let QueryEvent::Value { record, from } = event {
                    debug!(key = %hex::encode(&key), from = %from, "record found");
                    return Ok(Some(record));
                }
            }
            return Ok(None);
        }

        let mut answers: Vec<(PeerId, Record)> = Vec::new();
        let mut best: Option<Record> = None;
        while let Some(event) = query.next().await {
            match event {
                QueryEvent::PeerResponse {
                    from,
                    record: Some(record),
                    ..
                } => answers.push((from, record)),
                QueryEvent::Value { record, .. } => best = Some(record),
                _ => {}
            }
        }

        let best = match (best, local.clone()) {
            (None, None) => return Ok(None),
            (Some(best), None) => best,
            (None, Some(local)) => local,
            (Some(remote), Some(local)) => self.better(remote, local),
        };
        if local.as_ref().is_some_and(|l| l.value != best.value) {
            self.inner.records.lock().put(best.clone());
        }

        let mut stale: Vec<PeerId> = answers
            .into_iter()
            .filter(|(_, record)| record.value != best.value)
            .map(|(peer, _)| peer)
            .collect();
        stale.sort();
        stale.dedup();
        if !stale.is_empty() {
            let request = DhtRequest::PutValue {
                record: best.clone(),
            };
            let corrected = self.fan_out(stale.clone(), request).await;
            debug!(
                key = %hex::encode(&key),
                stale = stale.len(),
                corrected,
                "sent corrections for outdated records"
            );
        }
        Ok(Some(best))
    }

    fn better(&self, a: Record, b: Record) -> Record {
        if a.value == b.value {
            return a;
        }
        let values = [a.value.clone(), b.value.clone()];
        if self.inner.policy.select(&a.key, &values) == 1 {
            b
        } else {
            a
        }
    }

    /// Validate and store a record locally, then replicate it to the closest
    /// peers. Returns the number of peers that acknowledged.
    pub async fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<usize> {
        self.ensure_started()?;
        let record = Record::new(key, value);
        self.inner.policy.validate(&record.key, &record.value)?;
        self.inner.records.lock().put(record.clone());

        let peers = self.replication_targets(&record.key).await;
        if peers.is_empty() {
            warn!(key = %hex::encode(&record.key), "no peers to replicate record to");
            return Ok(0);
        }
        let targets = peers.len();
        let key = hex::encode(&record.key);
        let stored = self.fan_out(peers, DhtRequest::PutValue { record }).await;
        info!(key = %key, targets, stored, "record replicated");
        Ok(stored)
    }

    /// Announce this node as a provider of `key`. Returns the number of peers
    /// that accepted the announcement.
    pub async fn provide(&self, key: impl Into<Vec<u8>>) -> Result<usize> {
        self.ensure_started()?;
        let key = key.into();
        self.inner.providers.lock().add(&key, self.inner.local);

        let peers = self.replication_targets(&key).await;
        if peers.is_empty() {
            warn!(key = %hex::encode(&key), "no peers to announce provider record to");
            return Ok(0);
        }
        let targets = peers.len();
        let request = DhtRequest::AddProvider {
            key: key.clone(),
            provider: self.inner.local,
        };
        let accepted = self.fan_out(peers, request).await;
        info!(key = %hex::encode(&key), targets, accepted, "provider announced");
        Ok(accepted)
    }

    /// Providers of `key`: locally known ones first, then whatever the
    /// network reports. Each provider is yielded once.
    pub fn find_providers(
        &self,
        key: impl Into<Vec<u8>>,
    ) -> impl Stream<Item = PeerId> + Send + Unpin + 'static {
        let key = key.into();
        let local = self.inner.providers.lock().providers(&key);
        let remote = self
            .inner
            .queries
            .query(
                QueryTarget::key(key),
                QueryMode::GetProviders,
                QueryOptions::default(),
            )
            .filter_map(|event| match event {
                QueryEvent::Provider { provider, .. } => Some(provider),
                _ => None,
            });
        let mut seen = HashSet::new();
        tokio_stream::iter(local)
            .chain(remote)
            .filter(move |provider| seen.insert(*provider))
    }

    /// A locally held record, without touching the network.
    pub fn local_record(&self, key: &[u8]) -> Option<Record> {
        self.inner.records.lock().get(key)
    }

    pub fn local_record_count(&self) -> usize {
        self.inner.records.lock().len()
    }

    async fn replication_targets(&self, key: &[u8]) -> Vec<PeerId> {
        let mut lookup = self.inner.queries.query(
            QueryTarget::key(key.to_vec()),
            QueryMode::Put,
            QueryOptions::default(),
        );
        let mut peers = Vec::new();
        while let Some(event) = lookup.next().await {
            if let QueryEvent::FinalPeer { peer, .. } = event {
                peers.push(peer);
            }
        }
        peers
    }

    /// Send `request` to every peer with at most α in flight; returns how many
    /// acknowledged.
    async fn fan_out(&self, peers: Vec<PeerId>, request: DhtRequest) -> usize {
        let alpha = self.inner.config.query.alpha.max(1);
        let name = request.name();
        let mut peers = peers.into_iter();
        let mut pending = JoinSet::new();
        let mut acked = 0;

        loop {
            while pending.len() < alpha
                && let Some(peer) = peers.next()
            {
                let queries = self.inner.queries.clone();
                let request = request.clone();
                pending.spawn(async move {
                    let result = queries.call(&peer, request).await;
                    (peer, result)
                });
            }
            let Some(joined) = pending.join_next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(_))) => acked += 1,
                Ok((peer, Err(e))) => {
                    debug!(peer = %peer, request = name, error = %e, "store not acknowledged");
                }
                Err(e) => warn!(error = %e, "store task failed"),
            }
        }
        acked
    }

    // ========================================================================
    // Inbound requests
    // ========================================================================

    /// Serve a request received from `from`. The sender is proposed to the
    /// routing table as a candidate.
    pub async fn handle_request(&self, from: &PeerId, request: DhtRequest) -> DhtResponse {
        let name = request.name();
        trace!(from = %from, request = name, "handling request");
        self.propose(*from);

        match request {
            DhtRequest::Ping => DhtResponse::Pong,
            DhtRequest::FindNode { key } => DhtResponse::Nodes {
                closer: self.closer_peers(&key, from).await,
            },
            DhtRequest::GetValue { key } => {
                let record = self.inner.records.lock().get(&key);
                DhtResponse::Value {
                    record,
                    closer: self.closer_peers(&key, from).await,
                }
            }
            DhtRequest::GetProviders { key } => {
                let providers = self.inner.providers.lock().providers(&key);
                DhtResponse::Providers {
                    providers,
                    closer: self.closer_peers(&key, from).await,
                }
            }
            DhtRequest::PutValue { record } => {
                if let Err(e) = self.inner.policy.validate(&record.key, &record.value) {
                    debug!(from = %from, error = %e, "rejected record");
                    return DhtResponse::Error {
                        message: e.to_string(),
                    };
                }
                let mut records = self.inner.records.lock();
                let keep = match records.get(&record.key) {
                    Some(existing) => self.better(existing, record),
                    None => record,
                };
                records.put(keep);
                DhtResponse::Ack
            }
            DhtRequest::AddProvider { key, provider } => {
                if provider != *from {
                    debug!(from = %from, provider = %provider, "rejected third-party provider record");
                    return DhtResponse::Error {
                        message: "provider must be the sender".to_string(),
                    };
                }
                self.inner.providers.lock().add(&key, provider);
                DhtResponse::Ack
            }
        }
    }

    async fn closer_peers(&self, key: &[u8], requester: &PeerId) -> Vec<PeerId> {
        let k = self.inner.config.routing.kbucket_size;
        self.inner
            .routing
            .closest_peers(&KadKey::from_raw(key), k + 1)
            .await
            .into_iter()
            .map(|contact| contact.peer)
            .filter(|peer| peer != requester)
            .take(k)
            .collect()
    }

    fn propose(&self, peer: PeerId) {
        if peer == self.inner.local || !self.inner.routing.is_started() {
            return;
        }
        let routing = self.inner.routing.clone();
        tokio::spawn(async move {
            if let Err(e) = routing.add(peer).await {
                trace!(peer = %peer, error = %e, "could not propose requester");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::RwLock;
    use tokio::time::{sleep, timeout};

    use crate::config::TimeoutConfig;
    use crate::record::{AcceptAllPolicy, ContentAddressedPolicy};

    #[derive(Default)]
    struct NetworkRegistry {
        peers: RwLock<HashMap<PeerId, KadDht<TestNetwork>>>,
        latency: RwLock<HashMap<PeerId, Duration>>,
    }

    impl NetworkRegistry {
        async fn register(&self, node: &KadDht<TestNetwork>) {
            self.peers.write().await.insert(node.local_peer(), node.clone());
        }

        async fn get(&self, id: &PeerId) -> Option<KadDht<TestNetwork>> {
            self.peers.read().await.get(id).cloned()
        }

        async fn slow_down(&self, peer: PeerId, latency: Duration) {
            self.latency.write().await.insert(peer, latency);
        }
    }

    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        local: PeerId,
    }

    #[async_trait]
    impl DhtRpc for TestNetwork {
        async fn send(&self, to: &PeerId, request: DhtRequest) -> anyhow::Result<DhtResponse> {
            let peer = self
                .registry
                .get(to)
                .await
                .ok_or_else(|| anyhow!("peer not reachable"))?;
            let delay = self.registry.latency.read().await.get(to).copied();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            Ok(peer.handle_request(&self.local, request).await)
        }
    }

    fn config() -> DhtConfig {
        let mut config = DhtConfig::default();
        config.routing.probe_timeout = TimeoutConfig::fixed(Duration::from_millis(200));
        config.query.rpc_timeout = TimeoutConfig::fixed(Duration::from_millis(200));
        config.query.table_wait_timeout = Duration::from_millis(100);
        config
    }

    async fn node(
        registry: &Arc<NetworkRegistry>,
        name: &str,
        policy: Arc<dyn RecordPolicy>,
    ) -> KadDht<TestNetwork> {
        node_with(registry, name, policy, config()).await
    }

    async fn node_with(
        registry: &Arc<NetworkRegistry>,
        name: &str,
        policy: Arc<dyn RecordPolicy>,
        config: DhtConfig,
    ) -> KadDht<TestNetwork> {
        let local = PeerId::from_seed(name.as_bytes());
        let network = Arc::new(TestNetwork {
            registry: registry.clone(),
            local,
        });
        let dht = KadDht::new(local, network, config, policy).expect("valid config");
        dht.start();
        registry.register(&dht).await;
        dht
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let registry = Arc::new(NetworkRegistry::default());
        let local = PeerId::from_seed(b"bad");
        let network = Arc::new(TestNetwork { registry, local });
        let mut config = config();
        config.query.alpha = 0;
        assert!(KadDht::new(local, network, config, Arc::new(AcceptAllPolicy)).is_err());
    }

    #[tokio::test]
    async fn operations_require_start() {
        let registry = Arc::new(NetworkRegistry::default());
        let dht = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        dht.stop();
        assert!(!dht.is_started());
        assert!(dht.get(b"key".to_vec(), false).await.is_err());
        assert!(dht.put(b"key".to_vec(), b"value".to_vec()).await.is_err());
        assert!(dht.bootstrap(&[]).await.is_err());
    }

    #[tokio::test]
    async fn stores_follow_the_learned_rpc_timeout() {
        let registry = Arc::new(NetworkRegistry::default());
        let mut adaptive = config();
        adaptive.query.rpc_timeout = TimeoutConfig {
            initial: Duration::from_secs(2),
            min: Duration::from_millis(20),
            max: Duration::from_secs(2),
        };
        let a = node_with(&registry, "a", Arc::new(AcceptAllPolicy), adaptive).await;
        let fast = node(&registry, "fast", Arc::new(AcceptAllPolicy)).await;
        let slow = node(&registry, "slow", Arc::new(AcceptAllPolicy)).await;
        registry.slow_down(slow.local_peer(), Duration::from_millis(300)).await;

        // Quick answers pull the timeout down to its lower bound.
        for _ in 0..5 {
            let pong = a.queries().call(&fast.local_peer(), DhtRequest::Ping).await;
            assert_eq!(pong.expect("fast peer answers"), DhtResponse::Pong);
        }

        let record = Record::new(b"key".to_vec(), b"value".to_vec());
        let acked = timeout(
            Duration::from_secs(1),
            a.fan_out(
                vec![fast.local_peer(), slow.local_peer()],
                DhtRequest::PutValue { record },
            ),
        )
        .await
        .expect("store should not wait for the initial timeout");
        assert_eq!(acked, 1);
        assert!(fast.local_record(b"key").is_some());
        assert!(slow.local_record(b"key").is_none());
    }

    #[tokio::test]
    async fn requester_is_proposed_to_routing_table() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        let b = node(&registry, "b", Arc::new(AcceptAllPolicy)).await;

        let response = a.handle_request(&b.local_peer(), DhtRequest::Ping).await;
        assert_eq!(response, DhtResponse::Pong);

        timeout(Duration::from_secs(2), async {
            while a.routing().find(&b.local_peer()).await.is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("requester should be admitted");
    }

    #[tokio::test]
    async fn find_node_omits_the_requester() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        let b = node(&registry, "b", Arc::new(AcceptAllPolicy)).await;
        let c = node(&registry, "c", Arc::new(AcceptAllPolicy)).await;
        a.routing().add(b.local_peer()).await.expect("started");
        a.routing().add(c.local_peer()).await.expect("started");

        let response = a
            .handle_request(
                &b.local_peer(),
                DhtRequest::FindNode {
                    key: b"anything".to_vec(),
                },
            )
            .await;
        assert_eq!(response.closer(), &[c.local_peer()]);
    }

    #[tokio::test]
    async fn put_value_requests_are_validated() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(ContentAddressedPolicy)).await;
        let from = PeerId::from_seed(b"remote");
        let value = b"content".to_vec();
        let key = ContentAddressedPolicy::key_for(&value);

        let forged = a
            .handle_request(
                &from,
                DhtRequest::PutValue {
                    record: Record::new(key.clone(), b"forged".to_vec()),
                },
            )
            .await;
        assert!(matches!(forged, DhtResponse::Error { .. }));
        assert!(a.local_record(&key).is_none());

        let accepted = a
            .handle_request(
                &from,
                DhtRequest::PutValue {
                    record: Record::new(key.clone(), value.clone()),
                },
            )
            .await;
        assert_eq!(accepted, DhtResponse::Ack);
        assert_eq!(a.local_record(&key), Some(Record::new(key.clone(), value.clone())));

        let response = a
            .handle_request(&from, DhtRequest::GetValue { key: key.clone() })
            .await;
        assert!(matches!(response, DhtResponse::Value { record: Some(r), .. } if r.value == value));
    }

    #[tokio::test]
    async fn provider_records_must_come_from_the_provider() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        let sender = PeerId::from_seed(b"sender");
        let other = PeerId::from_seed(b"other");

        let spoofed = a
            .handle_request(
                &sender,
                DhtRequest::AddProvider {
                    key: b"cid".to_vec(),
                    provider: other,
                },
            )
            .await;
        assert!(matches!(spoofed, DhtResponse::Error { .. }));

        let own = a
            .handle_request(
                &sender,
                DhtRequest::AddProvider {
                    key: b"cid".to_vec(),
                    provider: sender,
                },
            )
            .await;
        assert_eq!(own, DhtResponse::Ack);

        let response = a
            .handle_request(&sender, DhtRequest::GetProviders { key: b"cid".to_vec() })
            .await;
        assert!(matches!(response, DhtResponse::Providers { providers, .. } if providers == vec![sender]));
    }

    #[tokio::test]
    async fn lone_node_serves_its_own_records() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;

        let stored = a.put(b"key".to_vec(), b"value".to_vec()).await.expect("put");
        assert_eq!(stored, 0);
        assert_eq!(a.local_record_count(), 1);

        let record = a.get(b"key".to_vec(), false).await.expect("get");
        assert_eq!(record, Some(Record::new(b"key".to_vec(), b"value".to_vec())));
    }

    #[tokio::test]
    async fn invalid_values_are_not_stored() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(ContentAddressedPolicy)).await;
        assert!(a.put(b"key".to_vec(), b"value".to_vec()).await.is_err());
        assert_eq!(a.local_record_count(), 0);
    }

    #[tokio::test]
    async fn find_peer_answers_from_routing_table() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        let b = node(&registry, "b", Arc::new(AcceptAllPolicy)).await;
        a.routing().add(b.local_peer()).await.expect("started");
        // Unregister so any network lookup would fail.
        registry.peers.write().await.remove(&b.local_peer());

        assert_eq!(a.find_peer(&b.local_peer()).await.expect("started"), Some(b.local_peer()));
    }

    #[tokio::test]
    async fn local_providers_come_first() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = node(&registry, "a", Arc::new(AcceptAllPolicy)).await;
        assert_eq!(a.provide(b"cid".to_vec()).await.expect("provide"), 0);

        let providers: Vec<PeerId> = a.find_providers(b"cid".to_vec()).collect().await;
        assert_eq!(providers, vec![a.local_peer()]);
    }
}
