//! Runtime state for a watched resource.
//!
//! One `WatchedResource` exists per [`ResourceSpec`] for the lifetime of the
//! process. It is owned and mutated exclusively by the engine task; events
//! emitted to subscribers carry cloned payloads, never references into this
//! state.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::resource::spec::ResourceSpec;
use crate::store::types::Secret;

/// Renewal is scheduled within this fraction of the lease duration, keeping
/// at least a 5% safety margin before expiry while desynchronising sidecars
/// across a fleet.
const RENEWAL_MINIMUM: f64 = 0.80;
const RENEWAL_MAXIMUM: f64 = 0.95;

/// Engine-owned state tracking a single resource.
#[derive(Debug)]
pub struct WatchedResource {
    /// The immutable description this state belongs to
    pub spec: Arc<ResourceSpec>,
    /// When the secret was last retrieved or renewed
    pub last_updated: Option<Instant>,
    /// When the store considers the current lease expired
    pub lease_expire_time: Option<Instant>,
    /// The delay chosen for the next renewal attempt
    pub renewal_time: Option<Duration>,
    /// Consecutive failures since the last success
    pub retries: u32,
    /// The current secret, if any fetch has succeeded yet
    pub secret: Option<Secret>,
    /// Whether the retry budget has been exhausted; dead resources are
    /// never rescheduled
    pub dead: bool,
    /// One-shot bookkeeping: the resource has completed its single fetch
    pub settled: bool,
}

impl WatchedResource {
    pub fn new(spec: Arc<ResourceSpec>) -> Self {
        Self {
            spec,
            last_updated: None,
            lease_expire_time: None,
            renewal_time: None,
            retries: 0,
            secret: None,
            dead: false,
            settled: false,
        }
    }

    /// Record a successful fetch or renewal at `now`.
    pub fn record_success(&mut self, secret: Secret, now: Instant) {
        self.last_updated = Some(now);
        self.lease_expire_time = Some(now + secret.lease());
        self.secret = Some(secret);
        self.retries = 0;
    }

    /// Whether the retry budget is spent. A budget of zero means unlimited.
    pub fn exhausted_retries(&self) -> bool {
        self.spec.max_retries > 0 && self.retries > self.spec.max_retries
    }

    /// Compute the delay until the next renewal attempt.
    ///
    /// An `update=` override wins outright. Otherwise the delay is drawn
    /// uniformly from 80–95% of the lease duration; a non-positive lease
    /// means the resource cannot be refreshed and `None` is returned. When
    /// `jitter=` is set the delay is then contracted by a uniform random
    /// amount up to the configured maximum, clamped to stay positive.
    pub fn renewal_delay(&self) -> Option<Duration> {
        let mut rng = rand::thread_rng();

        let base = if !self.spec.update_override.is_zero() {
            self.spec.update_override.as_secs_f64()
        } else {
            let lease = self.secret.as_ref().map(|s| s.lease_duration).unwrap_or(0);
            if lease <= 0 {
                return None;
            }
            let lease = lease as f64;
            rng.gen_range((lease * RENEWAL_MINIMUM)..(lease * RENEWAL_MAXIMUM))
        };

        let delay = if self.spec.max_jitter.is_zero() {
            base
        } else {
            let jitter = rng.gen_range(0.0..=self.spec.max_jitter.as_secs_f64());
            (base - jitter).max(0.001)
        };

        Some(Duration::from_secs_f64(delay))
    }
}
