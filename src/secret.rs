// =============================================================================
// PROVIDER SECRET KEY CACHE
// =============================================================================
// The provider authenticates requests with a secret key it hands out
// asynchronously: we ask for a renewal, and some time later the provider
// POSTs the new key to our secret callback URL. Renewal is therefore
// fire-and-wait, never fire-and-return.
//
// - The current key lives in a `watch` channel; pushes publish with
//   `send_replace`, readers clone out of `borrow()`.
// - A key older than one hour is stale and triggers a renewal before use.
// - Only one renewal is in flight at a time (tokio Mutex); callers queued
//   behind it re-check the cache and usually find the fresh key.
// =============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{AppError, AppResult};
use crate::metrics;

/// Age after which a cached key is renewed before use
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Period of the background refresh task
pub const REFRESH_PERIOD: Duration = Duration::from_secs(60);

/// Asks the provider to push a new key to the secret callback URL.
#[async_trait]
pub trait SecretRenewer: Send + Sync {
    async fn request_secret_renewal(&self) -> AppResult<()>;
}

#[derive(Debug, Clone)]
struct CachedSecret {
    value: String,
    renewed_at: Instant,
}

pub struct SecretKeyCache {
    current: watch::Sender<Option<CachedSecret>>,
    renewal: Mutex<()>,
    renewal_interval: Duration,
    grace_period: Duration,
}

impl SecretKeyCache {
    pub fn new(renewal_interval: Duration, grace_period: Duration) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            current,
            renewal: Mutex::new(()),
            renewal_interval,
            grace_period,
        }
    }

    /// Return a usable key, renewing it first when missing or stale.
    ///
    /// If no push arrives within the grace period but a previous key is
    /// still cached, that key is reused and its age reset; the provider
    /// keeps accepting a key until it pushes the next one.
    ///
    /// # Errors
    /// `SecretRenewalFailed` when the renewal request fails, or when no key
    /// at all is cached once the grace period is over.
    pub async fn ensure_valid(&self, renewer: &dyn SecretRenewer) -> AppResult<String> {
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        let _renewal = self.renewal.lock().await;

        // Renewed by the caller we queued behind
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        // Subscribe before asking, so a push racing the request is seen.
        // Pushes are the only other writer; a changed `renewed_at` means one landed.
        let mut updates = self.current.subscribe();
        let observed = updates.borrow_and_update().as_ref().map(|secret| secret.renewed_at);

        tracing::info!("Requesting secret key renewal");
        if let Err(err) = renewer.request_secret_renewal().await {
            metrics::record_secret_renewal("failed");
            return Err(AppError::SecretRenewalFailed(format!(
                "renewal request failed: {}",
                err
            )));
        }

        let _ = tokio::time::timeout(self.grace_period, updates.changed()).await;

        // Reset the age only if the slot still holds the key we saw before
        // asking; checked and written under the channel lock.
        let mut outcome = None;
        self.current.send_if_modified(|slot| match slot {
            Some(current) if Some(current.renewed_at) == observed => {
                current.renewed_at = Instant::now();
                outcome = Some((current.value.clone(), true));
                true
            }
            Some(current) => {
                outcome = Some((current.value.clone(), false));
                false
            }
            None => false,
        });

        match outcome {
            Some((value, false)) => {
                metrics::record_secret_renewal("pushed");
                tracing::info!("Secret key renewed");
                Ok(value)
            }
            Some((value, true)) => {
                metrics::record_secret_renewal("kept");
                tracing::warn!(
                    grace_ms = self.grace_period.as_millis() as u64,
                    "No secret key pushed within the grace period, keeping the cached key"
                );
                Ok(value)
            }
            None => {
                metrics::record_secret_renewal("failed");
                Err(AppError::SecretRenewalFailed(
                    "no secret key was received after renewal".to_string(),
                ))
            }
        }
    }

    /// Provider push: overwrite the key and reset its age.
    pub fn on_secret_pushed(&self, key: String) {
        self.current.send_replace(Some(CachedSecret {
            value: key,
            renewed_at: Instant::now(),
        }));
        tracing::info!("New secret key received");
    }

    fn fresh_key(&self) -> Option<String> {
        self.current
            .borrow()
            .as_ref()
            .filter(|secret| secret.renewed_at.elapsed() < self.renewal_interval)
            .map(|secret| secret.value.clone())
    }
}

/// Keep the key warm so payment requests rarely pay for a renewal.
pub fn spawn_refresh_task(
    cache: Arc<SecretKeyCache>,
    renewer: Arc<dyn SecretRenewer>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = cache.ensure_valid(renewer.as_ref()).await {
                tracing::warn!(error = %err, "Background secret key refresh failed");
            }
        }
    })
}
