//! Coarse call-rate limiting for remote API calls.

use super::{ApiError, EdgeApi, Filter, FirewallRule, IpList, IpListItem, NewFirewallRule, NewIpListItem, Zone};
use async_trait::async_trait;
use prometheus::IntCounter;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Calls allowed per window before callers are slowed down.
pub const DEFAULT_CALL_CEILING: u32 = 4;

/// Length of one counting window, and of the pause once the ceiling is exceeded.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

struct Window {
    started: Instant,
    calls: u32,
}

/// Fixed-window call counter.
///
/// Every call is recorded after it completes. Once more than `ceiling`
/// calls land in the current window, the caller sleeps for one window
/// length before returning.
pub struct CallRateLimiter {
    ceiling: u32,
    window_len: Duration,
    window: Mutex<Window>,
}

impl CallRateLimiter {
    pub fn new(ceiling: u32, window_len: Duration) -> Self {
        Self {
            ceiling,
            window_len,
            window: Mutex::new(Window {
                started: Instant::now(),
                calls: 0,
            }),
        }
    }

    /// Count one call, sleeping if the ceiling is exceeded.
    pub async fn record(&self) {
        let throttle = {
            let mut window = match self.window.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if window.started.elapsed() >= self.window_len {
                window.started = Instant::now();
                window.calls = 0;
            }
            window.calls += 1;
            window.calls > self.ceiling
        };

        if throttle {
            debug!(ceiling = self.ceiling, "Remote call ceiling exceeded, pausing");
            tokio::time::sleep(self.window_len).await;
        }
    }

    /// Calls counted in the current window.
    pub fn calls_in_window(&self) -> u32 {
        self.window.lock().map(|w| w.calls).unwrap_or(0)
    }
}

impl Default for CallRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_CEILING, DEFAULT_WINDOW)
    }
}

/// An [`EdgeApi`] whose every call goes through a [`CallRateLimiter`] and
/// is counted in `calls`.
///
/// One [`EdgeApi`] method counts as one call, even when the client spends
/// several HTTP requests on it (pagination, bulk-operation polling).
pub struct RateLimitedApi<A> {
    inner: A,
    limiter: CallRateLimiter,
    calls: IntCounter,
}

impl<A: EdgeApi> RateLimitedApi<A> {
    pub fn new(inner: A, limiter: CallRateLimiter, calls: IntCounter) -> Self {
        Self {
            inner,
            limiter,
            calls,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    async fn throttled<T>(&self, call: impl Future<Output = T>) -> T {
        self.calls.inc();
        let result = call.await;
        self.limiter.record().await;
        result
    }
}

#[async_trait]
impl<A: EdgeApi> EdgeApi for RateLimitedApi<A> {
    async fn list_zones(&self) -> Result<Vec<Zone>, ApiError> {
        self.throttled(self.inner.list_zones()).await
    }

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, ApiError> {
        self.throttled(self.inner.list_ip_lists()).await
    }

    async fn create_ip_list(&self, name: &str, description: &str) -> Result<IpList, ApiError> {
        self.throttled(self.inner.create_ip_list(name, description))
            .await
    }

    async fn delete_ip_list(&self, list_id: &str) -> Result<(), ApiError> {
        self.throttled(self.inner.delete_ip_list(list_id)).await
    }

    async fn create_ip_list_items(
        &self,
        list_id: &str,
        items: &[NewIpListItem],
    ) -> Result<Vec<IpListItem>, ApiError> {
        self.throttled(self.inner.create_ip_list_items(list_id, items))
            .await
    }

    async fn delete_ip_list_items(
        &self,
        list_id: &str,
        item_ids: &[String],
    ) -> Result<(), ApiError> {
        self.throttled(self.inner.delete_ip_list_items(list_id, item_ids))
            .await
    }

    async fn firewall_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>, ApiError> {
        self.throttled(self.inner.firewall_rules(zone_id)).await
    }

    async fn create_firewall_rules(
        &self,
        zone_id: &str,
        rules: &[NewFirewallRule],
    ) -> Result<Vec<FirewallRule>, ApiError> {
        self.throttled(self.inner.create_firewall_rules(zone_id, rules))
            .await
    }

    async fn delete_firewall_rules(
        &self,
        zone_id: &str,
        rule_ids: &[String],
    ) -> Result<(), ApiError> {
        self.throttled(self.inner.delete_firewall_rules(zone_id, rule_ids))
            .await
    }

    async fn filters(&self, zone_id: &str) -> Result<Vec<Filter>, ApiError> {
        self.throttled(self.inner.filters(zone_id)).await
    }

    async fn update_filters(
        &self,
        zone_id: &str,
        filters: &[Filter],
    ) -> Result<Vec<Filter>, ApiError> {
        self.throttled(self.inner.update_filters(zone_id, filters))
            .await
    }

    async fn delete_filters(&self, zone_id: &str, filter_ids: &[String]) -> Result<(), ApiError> {
        self.throttled(self.inner.delete_filters(zone_id, filter_ids))
            .await
    }
}
