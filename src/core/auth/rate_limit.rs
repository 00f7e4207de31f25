//! Fixed-window rate limiting on the secondary store
//!
//! Each attempt is one atomic [`SecondaryStore::increment`] on
//! `rate:{action}:{identifier}`, so concurrent attempts are all counted.
//! Limiting is fail-open: when the store errors the attempt is allowed.

use std::sync::Arc;

use crate::core::error::AuthError;
use crate::core::options::RateLimitOptions;
use crate::core::storage::SecondaryStore;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SecondaryStore>,
    options: RateLimitOptions,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SecondaryStore>, options: RateLimitOptions) -> Self {
        Self { store, options }
    }

    /// Count one attempt of `action` by `identifier`
    pub async fn check(&self, action: &str, identifier: &str) -> Result<(), AuthError> {
        if !self.options.enabled {
            return Ok(());
        }

        let key = format!("rate:{}:{}", action, identifier.to_lowercase());
        let counter = match self.store.increment(&key, self.options.window).await {
            Ok(counter) => counter,
            Err(e) => {
                // An unavailable cache must not block sign-in
                tracing::warn!("Rate limiter storage unavailable: {}", e);
                return Ok(());
            }
        };

        if counter.count > u64::from(self.options.max_attempts) {
            let retry_after_ms = u64::try_from(counter.resets_in.as_millis()).unwrap_or(u64::MAX);
            let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
            tracing::warn!("Rate limit exceeded for action '{}'", action);
            return Err(AuthError::RateLimited { retry_after_secs });
        }

        Ok(())
    }
}
