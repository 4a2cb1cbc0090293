//! Tunables for the routing table, the query engine and the local stores.
//!
//! Every struct implements [`Default`] with the values a public deployment
//! would use. Call [`DhtConfig::validate`] before handing a hand-built config
//! to [`KadDht`](crate::KadDht).

use std::time::Duration;

use thiserror::Error;

use crate::identity::KEY_BITS;

/// Default Kademlia bucket size (replication factor).
pub const DEFAULT_K: usize = 20;

/// Default per-path concurrency factor.
pub const DEFAULT_ALPHA: usize = 3;

/// Default maximum split depth of the bucket tree.
pub const DEFAULT_PREFIX_LENGTH: usize = 32;

/// How many least-recently-verified contacts are probed when a full leaf is contested.
pub const DEFAULT_PING_OLD_CONTACT_COUNT: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bucket size must be at least 1")]
    ZeroBucketSize,
    #[error("prefix length must be between 1 and 256, got {0}")]
    PrefixLength(usize),
    #[error("alpha must be at least 1")]
    ZeroAlpha,
    #[error("disjoint path count must be at least 1")]
    ZeroDisjointPaths,
    #[error("{0} probe concurrency must be at least 1")]
    ZeroProbeConcurrency(&'static str),
    #[error("{0} timeout bounds are inverted")]
    TimeoutBounds(&'static str),
}

/// Which full leaves may split instead of evicting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Any full leaf shallower than the prefix length splits.
    #[default]
    BelowMaxDepth,
    /// Only the leaf covering the local key splits (classic Kademlia).
    SelfPath,
}

/// Concurrency and queue caps of one probe direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub concurrency: usize,
    /// Probes allowed to wait for a concurrency slot before new ones are refused.
    pub max_queue_size: usize,
}

/// Bounds of an adaptive timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Timeout used before any round trip has been observed.
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimeoutConfig {
    /// A fixed timeout that never adapts.
    pub const fn fixed(timeout: Duration) -> Self {
        Self {
            initial: timeout,
            min: timeout,
            max: timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// K: contacts per leaf.
    pub kbucket_size: usize,
    /// Deepest a leaf may be split.
    pub prefix_length: usize,
    pub split_policy: SplitPolicy,
    pub ping_old_contact_count: usize,
    pub old_contact_probe: ProbeConfig,
    pub new_contact_probe: ProbeConfig,
    pub probe_timeout: TimeoutConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            kbucket_size: DEFAULT_K,
            prefix_length: DEFAULT_PREFIX_LENGTH,
            split_policy: SplitPolicy::default(),
            ping_old_contact_count: DEFAULT_PING_OLD_CONTACT_COUNT,
            old_contact_probe: ProbeConfig {
                concurrency: 1,
                max_queue_size: 100,
            },
            new_contact_probe: ProbeConfig {
                concurrency: 10,
                max_queue_size: 100,
            },
            probe_timeout: TimeoutConfig {
                initial: Duration::from_secs(10),
                min: Duration::from_millis(500),
                max: Duration::from_secs(10),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryConfig {
    /// α: outstanding RPCs per path.
    pub alpha: usize,
    /// d: independent paths per query. `None` uses α.
    pub disjoint_paths: Option<usize>,
    pub rpc_timeout: TimeoutConfig,
    /// Run queries against an empty routing table instead of waiting for a peer.
    pub allow_query_with_zero_peers: bool,
    /// How long a query waits for the first routing table entry.
    pub table_wait_timeout: Duration,
}

impl QueryConfig {
    pub fn disjoint_paths(&self) -> usize {
        self.disjoint_paths.unwrap_or(self.alpha)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            disjoint_paths: None,
            rpc_timeout: TimeoutConfig {
                initial: Duration::from_secs(10),
                min: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            allow_query_with_zero_peers: false,
            table_wait_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub max_records: usize,
    pub record_ttl: Duration,
    pub max_provider_keys: usize,
    pub max_providers_per_key: usize,
    pub provider_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            record_ttl: Duration::from_secs(36 * 60 * 60),
            max_provider_keys: 10_000,
            max_providers_per_key: 20,
            provider_ttl: Duration::from_secs(48 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DhtConfig {
    pub routing: RoutingConfig,
    pub query: QueryConfig,
    pub store: StoreConfig,
}

impl DhtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let routing = &self.routing;
        if routing.kbucket_size == 0 {
            return Err(ConfigError::ZeroBucketSize);
        }
        if routing.prefix_length == 0 || routing.prefix_length > KEY_BITS {
            return Err(ConfigError::PrefixLength(routing.prefix_length));
        }
        if routing.old_contact_probe.concurrency == 0 {
            return Err(ConfigError::ZeroProbeConcurrency("old contact"));
        }
        if routing.new_contact_probe.concurrency == 0 {
            return Err(ConfigError::ZeroProbeConcurrency("new contact"));
        }
        check_bounds("probe", &routing.probe_timeout)?;

        let query = &self.query;
        if query.alpha == 0 {
            return Err(ConfigError::ZeroAlpha);
        }
        if query.disjoint_paths() == 0 {
            return Err(ConfigError::ZeroDisjointPaths);
        }
        check_bounds("rpc", &query.rpc_timeout)?;
        Ok(())
    }
}

fn check_bounds(name: &'static str, timeout: &TimeoutConfig) -> Result<(), ConfigError> {
    if timeout.min > timeout.max {
        return Err(ConfigError::TimeoutBounds(name));
    }
    Ok(())
}
