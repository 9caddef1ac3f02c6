//! Background renewal of the store client token.
//!
//! Runs alongside the lifecycle engine when `--renew-token` is set: the
//! token's TTL is looked up once, then the task sleeps for half the TTL and
//! renews. A failed renewal halves the period and tries again; once the
//! period collapses below one second the token is considered lost and the
//! task returns a fatal error.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::observability::MetricsRecorder;
use crate::store::SecretStore;

const MINIMUM_PERIOD: Duration = Duration::from_secs(1);

pub async fn run_token_renewal<S: SecretStore>(
    store: Arc<S>,
    metrics: MetricsRecorder,
) -> Result<()> {
    let status = store.lookup_self().await?;
    info!(ttl = ?status.ttl, renewable = status.renewable, "store token looked up");

    let mut period = status.ttl / 2;

    loop {
        if period < MINIMUM_PERIOD {
            metrics.token_error();
            return Err(Error::auth("token renew period fell below one second, aborting"));
        }

        info!(period = ?period, "scheduling token renewal");
        time::sleep(period).await;

        metrics.token_total();
        match store.renew_self().await {
            Ok(status) => {
                metrics.token_success();
                info!(ttl = ?status.ttl, "renewed the store token");
                period = status.ttl / 2;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                metrics.token_error();
                period /= 2;
                warn!(error = %e, retry_in = ?period, "failed to renew the store token");
            }
        }
    }
}
