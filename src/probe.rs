//! Bounded liveness probing for routing table admission and eviction.
//!
//! A [`ProbeQueue`] caps how many probes run at once and how many may wait
//! for a slot. A probe requested while another probe of the same peer is
//! pending joins it instead of issuing a second round trip. Every wait is
//! raced against the owning table's shutdown token.
//!
//! [`AdaptiveTimeout`] derives the per-probe (and per-RPC) timeout from an
//! exponentially weighted moving average of observed round-trip times.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::{ProbeConfig, TimeoutConfig};
use crate::identity::PeerId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe queue is full")]
    QueueFull,
    #[error("probe cancelled by shutdown")]
    Cancelled,
}

type Outcome = watch::Receiver<Option<bool>>;

enum Slot {
    Join(Outcome),
    Lead(watch::Sender<Option<bool>>),
}

pub(crate) struct ProbeQueue {
    name: &'static str,
    permits: Semaphore,
    max_pending: usize,
    pending: Mutex<HashMap<PeerId, Outcome>>,
}

impl ProbeQueue {
    pub fn new(name: &'static str, config: ProbeConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            name,
            permits: Semaphore::new(concurrency),
            max_pending: concurrency + config.max_queue_size,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Probes queued or running.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run `probe` for `peer` once a slot frees up, or join the probe already
    /// pending for that peer. Returns whether the peer answered.
    pub async fn probe<F>(
        &self,
        peer: PeerId,
        shutdown: &CancellationToken,
        probe: F,
    ) -> Result<bool, ProbeError>
    where
        F: Future<Output = bool>,
    {
        let mut probe = Some(probe);
        loop {
            match self.claim(peer)? {
                Slot::Join(outcome) => {
                    trace!(queue = self.name, peer = %peer, "joining pending probe");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(ProbeError::Cancelled),
                        alive = wait_outcome(outcome) => {
                            if let Some(alive) = alive {
                                return Ok(alive);
                            }
                            // The leading caller went away before finishing; take over.
                        }
                    }
                }
                Slot::Lead(outcome) => {
                    let _pending = PendingGuard {
                        pending: &self.pending,
                        peer,
                    };
                    let Some(probe) = probe.take() else {
                        return Err(ProbeError::Cancelled);
                    };
                    let alive = tokio::select! {
                        _ = shutdown.cancelled() => return Err(ProbeError::Cancelled),
                        alive = self.run_limited(probe) => alive,
                    };
                    outcome.send_replace(Some(alive));
                    return Ok(alive);
                }
            }
        }
    }

    fn claim(&self, peer: PeerId) -> Result<Slot, ProbeError> {
        let mut pending = self.pending.lock();
        if let Some(outcome) = pending.get(&peer) {
            return Ok(Slot::Join(outcome.clone()));
        }
        if pending.len() >= self.max_pending {
            trace!(queue = self.name, peer = %peer, "probe queue full");
            return Err(ProbeError::QueueFull);
        }
        let (tx, rx) = watch::channel(None);
        pending.insert(peer, rx);
        Ok(Slot::Lead(tx))
    }

    async fn run_limited<F: Future<Output = bool>>(&self, probe: F) -> bool {
        let Ok(_permit) = self.permits.acquire().await else {
            return false;
        };
        probe.await
    }
}

async fn wait_outcome(mut outcome: Outcome) -> Option<bool> {
    outcome.wait_for(Option::is_some).await.ok().and_then(|v| *v)
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<PeerId, Outcome>>,
    peer: PeerId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.peer);
    }
}

/// Weight of the newest sample in the RTT average.
const RTT_EWMA_ALPHA: f64 = 0.3;

/// Timeout as a multiple of the smoothed RTT.
const RTT_TIMEOUT_MULTIPLIER: f64 = 3.0;

#[derive(Debug)]
pub(crate) struct AdaptiveTimeout {
    bounds: TimeoutConfig,
    smoothed_us: Mutex<Option<f64>>,
}

impl AdaptiveTimeout {
    pub fn new(bounds: TimeoutConfig) -> Self {
        Self {
            bounds,
            smoothed_us: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Duration {
        match *self.smoothed_us.lock() {
            None => self.bounds.initial,
            Some(us) => {
                let scaled = Duration::from_micros((us * RTT_TIMEOUT_MULTIPLIER).round() as u64);
                scaled.clamp(self.bounds.min, self.bounds.max)
            }
        }
    }

    pub fn record_rtt(&self, rtt: Duration) {
        let sample = rtt.as_micros() as f64;
        let mut smoothed = self.smoothed_us.lock();
        *smoothed = Some(match *smoothed {
            None => sample,
            Some(prev) => RTT_EWMA_ALPHA * sample + (1.0 - RTT_EWMA_ALPHA) * prev,
        });
    }

    /// A timeout doubles the estimate, capped at the upper bound.
    pub fn record_timeout(&self) {
        let cap = self.bounds.max.as_micros() as f64 / RTT_TIMEOUT_MULTIPLIER;
        let mut smoothed = self.smoothed_us.lock();
        if let Some(prev) = *smoothed {
            *smoothed = Some((prev * 2.0).min(cap));
        }
    }
}
