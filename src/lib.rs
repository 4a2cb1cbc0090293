//! # Kadmesh - Kademlia DHT Core
//!
//! Kadmesh implements the routing core of a Kademlia distributed hash table:
//!
//! - **Routing Table**: binary tree of k-buckets with probe-verified admission
//!   and least-recently-seen eviction
//! - **Query Engine**: iterative lookups over disjoint paths with bounded
//!   concurrency, observed as a lazy, cancellable event stream
//! - **Peer and Content Routing**: `find_peer`, `get_closest_peers`, `get`,
//!   `put`, `provide` and `find_providers` on top of the two
//!
//! ## Architecture
//!
//! - The routing table is a cloneable handle over a private actor that owns
//!   the bucket tree; every structural change is one actor command
//! - Each query is one spawned driver task feeding a capacity-one channel
//! - Transport, wire encoding and record semantics are supplied by the
//!   embedder through [`DhtRpc`] and [`RecordPolicy`]
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Peer ids, kad keys, XOR distance |
//! | `config` | Tunables and validation |
//! | `routing` | K-bucket tree and admission |
//! | `probe` | Bounded liveness probing, adaptive timeouts |
//! | `query` | Disjoint-path iterative queries |
//! | `dht` | Peer and content routing façade, inbound request handling |
//! | `record` | Records, record policies, local stores |
//! | `protocols` | Transport trait |
//! | `messages` | Request and response types |

mod config;
mod dht;
mod identity;
mod messages;
mod probe;
mod protocols;
mod query;
mod record;
mod routing;

pub use config::{
    ConfigError, DEFAULT_ALPHA, DEFAULT_K, DEFAULT_PING_OLD_CONTACT_COUNT, DEFAULT_PREFIX_LENGTH,
    DhtConfig, ProbeConfig, QueryConfig, RoutingConfig, SplitPolicy, StoreConfig, TimeoutConfig,
};
pub use dht::KadDht;
pub use identity::{Distance, KEY_BITS, KEY_LEN, KadKey, PeerId};
pub use messages::{DhtRequest, DhtResponse};
pub use probe::ProbeError;
pub use protocols::DhtRpc;
pub use query::{QueryEngine, QueryEvent, QueryMode, QueryOptions, QueryStream, QueryTarget};
pub use record::{
    AcceptAllPolicy, ContentAddressedPolicy, MAX_VALUE_SIZE, NamespacedPolicy, Record, RecordError,
    RecordPolicy,
};
pub use routing::{
    Admission, BucketSnapshot, Contact, Prefix, RoutingEvent, RoutingStats, RoutingTable,
    RoutingTableError,
};
