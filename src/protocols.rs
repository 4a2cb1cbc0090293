//! Transport seam of the DHT.
//!
//! The core never opens connections itself. Everything it needs from the
//! network goes through [`DhtRpc`], implemented by the embedding transport
//! (or by an in-memory network in tests).
//!
//! Cancellation is by drop: the query engine and the probe queues abort the
//! task awaiting [`DhtRpc::send`], so implementations must not rely on the
//! returned future running to completion.

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{DhtRequest, DhtResponse};

#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Send `request` to `to` and wait for its response.
    async fn send(&self, to: &PeerId, request: DhtRequest) -> Result<DhtResponse>;

    /// Round-trip liveness check.
    async fn ping(&self, to: &PeerId) -> Result<()> {
        match self.send(to, DhtRequest::Ping).await? {
            DhtResponse::Pong => Ok(()),
            other => bail!("unexpected response to PING: {other:?}"),
        }
    }
}
