//! Remote edge platform API.

pub mod cloudflare;
#[cfg(test)]
pub mod memory;
pub mod rate_limit;

use crate::decision::Action;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A zone visible to the account credential.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plan: ZonePlan,
    /// Account owning the zone.
    #[serde(default)]
    pub account: ZoneAccount,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ZoneAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Subscription metadata of a zone.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ZonePlan {
    #[serde(default)]
    pub name: String,
    /// Paid plans allow more than one firewall action per zone.
    #[serde(default)]
    pub is_subscribed: bool,
}

/// Identity of a remote IP list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpList {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub num_items: usize,
    #[serde(default)]
    pub created_on: Option<String>,
}

/// An entry of a remote IP list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpListItem {
    pub id: String,
    pub ip: String,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Request body for a new IP list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewIpListItem {
    pub ip: String,
    pub comment: String,
}

/// A zone-scoped filter expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Filter {
    pub id: String,
    pub expression: String,
}

/// A firewall rule binding a filter to an action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirewallRule {
    pub id: String,
    pub filter: Filter,
    /// Rules created outside this process may carry actions we don't manage.
    pub action: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for a new firewall rule.
#[derive(Debug, Clone, Serialize)]
pub struct NewFirewallRule {
    pub filter: NewFilter,
    pub action: Action,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewFilter {
    pub expression: String,
}

/// Error from a remote platform call.
#[derive(Debug)]
pub enum ApiError {
    /// HTTP request failed.
    Http(reqwest::Error),
    /// Timeout.
    Timeout,
    /// Rate limited by the remote platform.
    RateLimited,
    /// The platform answered with an error envelope or status.
    Remote { status: u16, message: String },
    /// Response could not be understood.
    InvalidResponse(String),
    /// An asynchronous bulk operation failed or never completed.
    BulkOperation(String),
    /// Other error.
    Other(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Http(e) => write!(f, "HTTP error: {}", e),
            ApiError::Timeout => write!(f, "Request timed out"),
            ApiError::RateLimited => write!(f, "Rate limited"),
            ApiError::Remote { status, message } => {
                write!(f, "Remote error (HTTP {}): {}", status, message)
            }
            ApiError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            ApiError::BulkOperation(msg) => write!(f, "Bulk operation failed: {}", msg),
            ApiError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Http(e)
        }
    }
}

/// Operations the sync engine needs from the edge platform.
///
/// Lists are account-scoped; rules and filters are zone-scoped.
#[async_trait]
pub trait EdgeApi: Send + Sync {
    async fn list_zones(&self) -> Result<Vec<Zone>, ApiError>;

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, ApiError>;

    async fn create_ip_list(&self, name: &str, description: &str) -> Result<IpList, ApiError>;

    async fn delete_ip_list(&self, list_id: &str) -> Result<(), ApiError>;

    /// Add entries and return them as stored remotely (with their ids).
    async fn create_ip_list_items(
        &self,
        list_id: &str,
        items: &[NewIpListItem],
    ) -> Result<Vec<IpListItem>, ApiError>;

    async fn delete_ip_list_items(&self, list_id: &str, item_ids: &[String])
        -> Result<(), ApiError>;

    async fn firewall_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>, ApiError>;

    async fn create_firewall_rules(
        &self,
        zone_id: &str,
        rules: &[NewFirewallRule],
    ) -> Result<Vec<FirewallRule>, ApiError>;

    async fn delete_firewall_rules(&self, zone_id: &str, rule_ids: &[String])
        -> Result<(), ApiError>;

    async fn filters(&self, zone_id: &str) -> Result<Vec<Filter>, ApiError>;

    async fn update_filters(&self, zone_id: &str, filters: &[Filter])
        -> Result<Vec<Filter>, ApiError>;

    async fn delete_filters(&self, zone_id: &str, filter_ids: &[String]) -> Result<(), ApiError>;
}
