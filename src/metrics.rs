//! Prometheus metrics.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `cloudflare_api_calls_total` | Counter | `account_id` |

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Metrics registry shared by every account worker.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_calls: IntCounterVec,
}

impl Metrics {
    /// Create a registry with every metric registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let api_calls = IntCounterVec::new(
            Opts::new(
                "cloudflare_api_calls_total",
                "Calls made to the Cloudflare API",
            ),
            &["account_id"],
        )?;
        registry.register(Box::new(api_calls.clone()))?;

        Ok(Self {
            registry,
            api_calls,
        })
    }

    /// Call counter of one account.
    pub fn api_calls(&self, account_id: &str) -> IntCounter {
        self.api_calls.with_label_values(&[account_id])
    }

    /// Calls counted across every account.
    pub fn api_calls_total(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == "cloudflare_api_calls_total")
            .flat_map(|family| family.get_metric())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    /// Encode every metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
