//! # Lifecycle Engine
//!
//! The single-task scheduler that owns every watched resource and drives it
//! through fetch, renewal, and revocation. Four bounded channels feed the
//! engine (admit, retrieve, renew, revoke); every delay is implemented by a
//! helper task that sleeps and posts back, so the engine itself never blocks
//! on a timer. All resource state lives on the engine task; subscribers
//! only ever see cloned payloads.
//!
//! ```text
//! EngineHandle ──admit──▶ ┌────────────────────┐ ──events──▶ OutputWriter
//!                         │  LifecycleEngine   │
//!        sleep-then-send ◀│  select loop       │▶ store requests
//!        helper tasks  ──▶└────────────────────┘
//! ```

pub mod event;
pub mod token;

pub use event::{EventKind, ResourceEvent};
pub use token::run_token_renewal;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;
use crate::resource::{ResourceSpec, WatchedResource};
use crate::store::{fetch_secret, SecretStore};

/// Capacity of the admission channel
const ADMIT_QUEUE: usize = 20;
/// Capacity of the retrieve/renew/revoke channels
const WORK_QUEUE: usize = 10;

/// Failed attempts are retried after a random delay in this window, so a
/// flaky store is not hammered in lockstep.
const RETRY_MIN_SECS: u64 = 3;
const RETRY_MAX_SECS: u64 = 10;

/// Handle used to admit resources into a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    admit_tx: mpsc::Sender<Arc<ResourceSpec>>,
}

impl EngineHandle {
    /// Add a resource to the engine's working set.
    pub async fn watch(&self, spec: Arc<ResourceSpec>) -> Result<()> {
        self.admit_tx
            .send(spec)
            .await
            .map_err(|_| Error::internal("the lifecycle engine has stopped"))
    }
}

/// The resource lifecycle engine.
pub struct LifecycleEngine<S> {
    core: EngineCore<S>,
    admit_rx: mpsc::Receiver<Arc<ResourceSpec>>,
    retrieve_rx: mpsc::Receiver<usize>,
    renew_rx: mpsc::Receiver<usize>,
    revoke_rx: mpsc::Receiver<String>,
    admit_tx: mpsc::Sender<Arc<ResourceSpec>>,
}

/// Shared pieces the select-loop handlers need; split from the receivers so
/// the loop can poll the channels while handlers borrow the rest.
struct EngineCore<S> {
    config: Arc<Config>,
    store: Arc<S>,
    metrics: MetricsRecorder,
    events: mpsc::Sender<ResourceEvent>,
    retrieve_tx: mpsc::Sender<usize>,
    renew_tx: mpsc::Sender<usize>,
    revoke_tx: mpsc::Sender<String>,
}

impl<S: SecretStore + 'static> LifecycleEngine<S> {
    pub fn new(
        config: Arc<Config>,
        store: Arc<S>,
        events: mpsc::Sender<ResourceEvent>,
        metrics: MetricsRecorder,
    ) -> Self {
        let (admit_tx, admit_rx) = mpsc::channel(ADMIT_QUEUE);
        let (retrieve_tx, retrieve_rx) = mpsc::channel(WORK_QUEUE);
        let (renew_tx, renew_rx) = mpsc::channel(WORK_QUEUE);
        let (revoke_tx, revoke_rx) = mpsc::channel(WORK_QUEUE);

        Self {
            core: EngineCore { config, store, metrics, events, retrieve_tx, renew_tx, revoke_tx },
            admit_rx,
            retrieve_rx,
            renew_rx,
            revoke_rx,
            admit_tx,
        }
    }

    /// A handle for admitting resources; can be cloned freely.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle { admit_tx: self.admit_tx.clone() }
    }

    /// Run the engine until termination.
    ///
    /// In one-shot mode the engine returns once every configured resource
    /// has either been fetched once or exhausted its retry budget, with an
    /// error if any did the latter. In watch mode it only returns on a
    /// fatal store error.
    pub async fn run(self) -> Result<()> {
        let LifecycleEngine { core, mut admit_rx, mut retrieve_rx, mut renew_rx, mut revoke_rx, .. } =
            self;

        let mut items: Vec<WatchedResource> = Vec::new();
        let expected = core.config.resources.len();

        if core.config.one_shot && expected == 0 {
            return Ok(());
        }

        let mut stats = time::interval_at(
            Instant::now() + core.config.stats_interval,
            core.config.stats_interval,
        );

        loop {
            tokio::select! {
                Some(spec) = admit_rx.recv() => {
                    core.handle_admit(&mut items, spec);
                }
                Some(idx) = retrieve_rx.recv() => {
                    core.handle_retrieve(&mut items, idx).await?;
                }
                Some(idx) = renew_rx.recv() => {
                    core.handle_renew(&mut items, idx).await?;
                }
                Some(lease_id) = revoke_rx.recv() => {
                    core.handle_revoke(&lease_id).await;
                }
                _ = stats.tick() => {
                    core.log_stats(&items);
                }
            }

            if core.config.one_shot
                && items.len() == expected
                && items.iter().all(|item| item.settled)
            {
                break;
            }
        }

        let exhausted = items.iter().filter(|item| item.dead).count();
        if exhausted > 0 {
            return Err(Error::internal(format!(
                "{} resource(s) exhausted their retry budget",
                exhausted
            )));
        }

        Ok(())
    }
}

impl<S: SecretStore + 'static> EngineCore<S> {
    fn handle_admit(&self, items: &mut Vec<WatchedResource>, spec: Arc<ResourceSpec>) {
        info!(resource = %spec, "adding resource into the service processor");
        let idx = items.len();
        items.push(WatchedResource::new(spec));
        self.schedule(self.retrieve_tx.clone(), idx, Duration::ZERO);
    }

    async fn handle_retrieve(&self, items: &mut [WatchedResource], idx: usize) -> Result<()> {
        let Some(item) = items.get_mut(idx) else { return Ok(()) };
        if item.dead {
            debug!(resource = %item.spec, "skipping dead resource");
            return Ok(());
        }

        let spec = item.spec.clone();
        let previous_lease = item
            .secret
            .as_ref()
            .map(|s| s.lease_id.clone())
            .filter(|lease| !lease.is_empty() && lease.as_str() != "raw");

        self.metrics.resource_total(spec.id());

        let secret = match fetch_secret(self.store.as_ref(), &spec).await {
            Ok(secret) => secret,
            Err(e) if e.is_fatal() => {
                error!(resource = %spec, error = %e, "the store token is no longer valid");
                return Err(e);
            }
            Err(e) => {
                self.metrics.resource_error(spec.id());
                error!(resource = %spec, error = %e, "failed to retrieve the resource");
                item.retries += 1;
                self.emit(EventKind::Failure, &spec, None).await;
                self.handle_attempt_failure(item, idx, Direction::Retrieve);
                return Ok(());
            }
        };

        self.metrics.resource_success(spec.id());
        info!(
            resource = %spec,
            lease_id = %secret.lease_id,
            lease_secs = secret.lease_duration,
            "successfully retrieved resource"
        );

        let payload = secret.data.clone();
        let lease = secret.lease();
        item.record_success(secret, Instant::now());
        self.metrics.resource_expiry(spec.id(), lease.as_secs_f64());

        self.emit(EventKind::Success, &spec, Some(payload)).await;

        // revoke is scheduled only after the success event for the new
        // lease is out, keeping rotation and revocation ordered; a refetch
        // that hands back the same lease id is not a rotation
        let rotated = item.secret.as_ref().map(|s| s.lease_id.clone());
        if let Some(old_lease) = previous_lease.filter(|old| Some(old) != rotated.as_ref()) {
            if spec.revoke_on_rotate {
                debug!(resource = %spec, lease_id = %old_lease, "scheduling revocation of rotated lease");
                self.schedule_revoke(old_lease, spec.revoke_delay);
            }
        }

        if self.config.one_shot {
            item.settled = true;
        } else {
            self.schedule_renewal(item, idx);
        }

        Ok(())
    }

    async fn handle_renew(&self, items: &mut [WatchedResource], idx: usize) -> Result<()> {
        let Some(item) = items.get_mut(idx) else { return Ok(()) };
        if item.dead {
            debug!(resource = %item.spec, "skipping dead resource");
            return Ok(());
        }

        let spec = item.spec.clone();

        // an expired lease cannot be renewed, only replaced
        let expired =
            item.lease_expire_time.map(|at| Instant::now() >= at).unwrap_or(true);
        if expired {
            info!(resource = %spec, "the lease has expired, we need to get a new one");
            self.schedule(self.retrieve_tx.clone(), idx, Duration::ZERO);
            return Ok(());
        }

        if !spec.renewable {
            debug!(resource = %spec, "resource flagged as not renewable, regenerating instead");
            self.schedule(self.retrieve_tx.clone(), idx, Duration::ZERO);
            return Ok(());
        }

        let (lease_id, secret_renewable) = match item.secret.as_ref() {
            Some(secret) => (secret.lease_id.clone(), secret.renewable),
            None => {
                self.schedule(self.retrieve_tx.clone(), idx, Duration::ZERO);
                return Ok(());
            }
        };

        // the store itself must agree the lease is renewable
        if !secret_renewable {
            debug!(resource = %spec, "the lease is not renewable, retrieving a new one instead");
            self.schedule(self.retrieve_tx.clone(), idx, Duration::ZERO);
            return Ok(());
        }

        self.metrics.resource_total(spec.id());

        let renewed = match self.store.renew_lease(&lease_id, 0).await {
            Ok(renewed) => renewed,
            Err(e) if e.is_fatal() => {
                error!(resource = %spec, error = %e, "the store token is no longer valid");
                return Err(e);
            }
            Err(e) => {
                self.metrics.resource_error(spec.id());
                error!(resource = %spec, error = %e, "failed to renew the lease");
                item.retries += 1;
                self.emit(EventKind::Failure, &spec, None).await;
                self.handle_attempt_failure(item, idx, Direction::Renew);
                return Ok(());
            }
        };

        self.metrics.resource_success(spec.id());

        let renewed_lease_secs = renewed.lease().as_secs_f64();
        let now = Instant::now();
        item.last_updated = Some(now);
        item.lease_expire_time = Some(now + renewed.lease());
        item.retries = 0;
        if let Some(secret) = item.secret.as_mut() {
            secret.lease_duration = renewed.lease_duration;
            secret.renewable = renewed.renewable;
            if !renewed.lease_id.is_empty() {
                secret.lease_id = renewed.lease_id;
            }
        }
        self.metrics.resource_expiry(spec.id(), renewed_lease_secs);

        info!(
            resource = %spec,
            lease_id = %lease_id,
            lease_secs = renewed.lease_duration,
            "successfully renewed resource"
        );

        let payload = item.secret.as_ref().map(|s| s.data.clone());
        self.emit(EventKind::Success, &spec, payload).await;

        self.schedule_renewal(item, idx);

        Ok(())
    }

    async fn handle_revoke(&self, lease_id: &str) {
        debug!(lease_id = %lease_id, "attempting to revoke the lease");
        match self.store.revoke_lease(lease_id).await {
            Ok(()) => info!(lease_id = %lease_id, "successfully revoked the lease"),
            // the old lease will expire naturally
            Err(e) => {
                self.metrics.error("revoke");
                warn!(lease_id = %lease_id, error = %e, "failed to revoke the lease");
            }
        }
    }

    /// Common bookkeeping after a failed attempt has been counted and its
    /// failure event emitted: either give up on the resource or put the
    /// attempt back on the right channel.
    fn handle_attempt_failure(&self, item: &mut WatchedResource, idx: usize, direction: Direction) {
        if item.exhausted_retries() {
            warn!(
                resource = %item.spec,
                attempts = item.retries,
                "giving up on resource, retry budget exhausted"
            );
            item.dead = true;
            item.settled = true;
            return;
        }

        let tx = match direction {
            Direction::Retrieve => self.retrieve_tx.clone(),
            Direction::Renew => self.renew_tx.clone(),
        };
        self.schedule(tx, idx, retry_backoff());
    }

    /// Compute and arm the next renewal notification for a resource.
    fn schedule_renewal(&self, item: &mut WatchedResource, idx: usize) {
        match item.renewal_delay() {
            Some(delay) => {
                item.renewal_time = Some(delay);
                debug!(resource = %item.spec, delay = ?delay, "setting a renewal notification");
                self.schedule(self.renew_tx.clone(), idx, delay);
            }
            None => {
                item.renewal_time = None;
                warn!(
                    resource = %item.spec,
                    "resource has no lease duration, no further updates will be scheduled"
                );
            }
        }
    }

    /// Post a message back to the engine after `delay`, without ever
    /// blocking the engine task itself.
    fn schedule(&self, tx: mpsc::Sender<usize>, idx: usize, delay: Duration) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let _ = tx.send(idx).await;
        });
    }

    fn schedule_revoke(&self, lease_id: String, delay: Duration) {
        let tx = self.revoke_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let _ = tx.send(lease_id).await;
        });
    }

    async fn emit(&self, kind: EventKind, spec: &Arc<ResourceSpec>, payload: Option<Map<String, Value>>) {
        let event = ResourceEvent { kind, resource: spec.clone(), payload };
        if self.events.send(event).await.is_err() {
            debug!("no event listeners remain");
        }
    }

    fn log_stats(&self, items: &[WatchedResource]) {
        info!(watched = items.len(), "stats: resources being watched");
        let now = Instant::now();
        for item in items {
            let lease_id = item
                .secret
                .as_ref()
                .map(|s| s.lease_id.as_str())
                .unwrap_or("<none>");
            let expires_in = item
                .lease_expire_time
                .map(|at| at.saturating_duration_since(now));
            info!(
                resource = %item.spec,
                lease_id = %lease_id,
                renewal_in = ?item.renewal_time,
                expires_in = ?expires_in,
                retries = item.retries,
                "stats: watched resource"
            );
        }
    }
}

enum Direction {
    Retrieve,
    Renew,
}

fn retry_backoff() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(RETRY_MIN_SECS..RETRY_MAX_SECS))
}
