//! Cloudflare v4 REST client.

use super::{ApiError, EdgeApi, Filter, FirewallRule, IpList, IpListItem, NewFirewallRule, NewIpListItem, Zone};
use crate::config::AccountConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Page size for page-numbered listings.
const PER_PAGE: u32 = 50;

/// Polls of an asynchronous bulk list operation before giving up.
const BULK_POLL_ATTEMPTS: u32 = 30;

const BULK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<EnvelopeMessage>,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    cursors: Option<Cursors>,
}

#[derive(Debug, Default, Deserialize)]
struct Cursors {
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkOperationRef {
    operation_id: String,
}

#[derive(Debug, Deserialize)]
struct BulkOperation {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateListRequest<'a> {
    name: &'a str,
    description: &'a str,
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct DeleteItemsRequest<'a> {
    items: Vec<ItemId<'a>>,
}

#[derive(Debug, Serialize)]
struct ItemId<'a> {
    id: &'a str,
}

/// Client for one account, authenticated with that account's API token.
pub struct CloudflareClient {
    client: Client,
    base_url: String,
    account_id: String,
    token: String,
}

impl CloudflareClient {
    /// Create a client for `account`.
    pub fn new(base_url: &str, account: &AccountConfig, timeout: Duration) -> Result<Self, ApiError> {
        Self::build(base_url, &account.id, &account.token, timeout)
    }

    /// Create a client bound to no account. Only zone listing works.
    pub fn for_token(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        Self::build(base_url, "", token, timeout)
    }

    fn build(base_url: &str, account_id: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    fn lists_path(&self) -> String {
        format!("/accounts/{}/rules/lists", self.account_id)
    }

    /// Send a request and unwrap the response envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(T, Option<ResultInfo>), ApiError> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Cloudflare rate limit exceeded");
            return Err(ApiError::RateLimited);
        }

        let body = response.text().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to read response: {}", e))
        })?;

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                ApiError::InvalidResponse(format!("Failed to parse response: {}", e))
            } else {
                ApiError::Remote {
                    status: status.as_u16(),
                    message: body.clone(),
                }
            }
        })?;

        if !status.is_success() || !envelope.success {
            let message = envelope
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ApiError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        let result = envelope
            .result
            .ok_or_else(|| ApiError::InvalidResponse("Missing result".to_string()))?;
        Ok((result, envelope.result_info))
    }

    /// Fetch every page of a page-numbered listing.
    async fn get_all_pages<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ApiError> {
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let request = self
                .request(Method::GET, path)
                .query(&[("page", page), ("per_page", PER_PAGE)]);
            let (items, info): (Vec<T>, _) = self.send(request).await?;
            all.extend(items);

            let info = info.unwrap_or_default();
            if info.total_pages == 0 || info.page >= info.total_pages {
                break;
            }
            page = info.page + 1;
        }

        Ok(all)
    }

    async fn list_items(&self, list_id: &str) -> Result<Vec<IpListItem>, ApiError> {
        let path = format!("{}/{}/items", self.lists_path(), list_id);
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, &path);
            if let Some(after) = &cursor {
                request = request.query(&[("cursor", after)]);
            }
            let (items, info): (Vec<IpListItem>, _) = self.send(request).await?;
            all.extend(items);

            cursor = info.and_then(|i| i.cursors).and_then(|c| c.after);
            if cursor.is_none() {
                break;
            }
        }

        Ok(all)
    }

    /// Wait for an asynchronous list operation to finish.
    async fn wait_for_bulk_operation(&self, operation_id: &str) -> Result<(), ApiError> {
        let path = format!(
            "/accounts/{}/rules/lists/bulk_operations/{}",
            self.account_id, operation_id
        );

        for _ in 0..BULK_POLL_ATTEMPTS {
            let (operation, _): (BulkOperation, _) =
                self.send(self.request(Method::GET, &path)).await?;

            match operation.status.as_str() {
                "completed" => return Ok(()),
                "failed" => {
                    return Err(ApiError::BulkOperation(
                        operation.error.unwrap_or_else(|| operation_id.to_string()),
                    ))
                }
                status => {
                    debug!(operation_id, status, "Waiting for bulk list operation");
                    tokio::time::sleep(BULK_POLL_INTERVAL).await;
                }
            }
        }

        Err(ApiError::BulkOperation(format!(
            "operation {} did not complete",
            operation_id
        )))
    }
}

/// Repeated `id=` query parameters for bulk deletes.
fn id_query(ids: &[String]) -> Vec<(&'static str, &str)> {
    ids.iter().map(|id| ("id", id.as_str())).collect()
}

#[async_trait]
impl EdgeApi for CloudflareClient {
    async fn list_zones(&self) -> Result<Vec<Zone>, ApiError> {
        self.get_all_pages("/zones").await
    }

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, ApiError> {
        let (lists, _) = self
            .send(self.request(Method::GET, &self.lists_path()))
            .await?;
        Ok(lists)
    }

    async fn create_ip_list(&self, name: &str, description: &str) -> Result<IpList, ApiError> {
        let body = CreateListRequest {
            name,
            description,
            kind: "ip",
        };
        let (list, _) = self
            .send(self.request(Method::POST, &self.lists_path()).json(&body))
            .await?;
        Ok(list)
    }

    async fn delete_ip_list(&self, list_id: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}", self.lists_path(), list_id);
        let (_, _): (serde_json::Value, _) =
            self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn create_ip_list_items(
        &self,
        list_id: &str,
        items: &[NewIpListItem],
    ) -> Result<Vec<IpListItem>, ApiError> {
        let path = format!("{}/{}/items", self.lists_path(), list_id);
        let (operation, _): (BulkOperationRef, _) = self
            .send(self.request(Method::POST, &path).json(items))
            .await?;
        self.wait_for_bulk_operation(&operation.operation_id).await?;

        // The bulk endpoint doesn't return item ids; read them back.
        let wanted: HashSet<&str> = items.iter().map(|i| i.ip.as_str()).collect();
        let created = self
            .list_items(list_id)
            .await?
            .into_iter()
            .filter(|item| wanted.contains(item.ip.as_str()))
            .collect();
        Ok(created)
    }

    async fn delete_ip_list_items(
        &self,
        list_id: &str,
        item_ids: &[String],
    ) -> Result<(), ApiError> {
        let path = format!("{}/{}/items", self.lists_path(), list_id);
        let body = DeleteItemsRequest {
            items: item_ids.iter().map(|id| ItemId { id }).collect(),
        };
        let (operation, _): (BulkOperationRef, _) = self
            .send(self.request(Method::DELETE, &path).json(&body))
            .await?;
        self.wait_for_bulk_operation(&operation.operation_id).await
    }

    async fn firewall_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>, ApiError> {
        self.get_all_pages(&format!("/zones/{}/firewall/rules", zone_id))
            .await
    }

    async fn create_firewall_rules(
        &self,
        zone_id: &str,
        rules: &[NewFirewallRule],
    ) -> Result<Vec<FirewallRule>, ApiError> {
        let path = format!("/zones/{}/firewall/rules", zone_id);
        let (created, _) = self
            .send(self.request(Method::POST, &path).json(rules))
            .await?;
        Ok(created)
    }

    async fn delete_firewall_rules(
        &self,
        zone_id: &str,
        rule_ids: &[String],
    ) -> Result<(), ApiError> {
        let path = format!("/zones/{}/firewall/rules", zone_id);
        let (_, _): (serde_json::Value, _) = self
            .send(self.request(Method::DELETE, &path).query(&id_query(rule_ids)))
            .await?;
        Ok(())
    }

    async fn filters(&self, zone_id: &str) -> Result<Vec<Filter>, ApiError> {
        self.get_all_pages(&format!("/zones/{}/filters", zone_id))
            .await
    }

    async fn update_filters(
        &self,
        zone_id: &str,
        filters: &[Filter],
    ) -> Result<Vec<Filter>, ApiError> {
        let path = format!("/zones/{}/filters", zone_id);
        let (updated, _) = self
            .send(self.request(Method::PUT, &path).json(filters))
            .await?;
        Ok(updated)
    }

    async fn delete_filters(&self, zone_id: &str, filter_ids: &[String]) -> Result<(), ApiError> {
        let path = format!("/zones/{}/filters", zone_id);
        let (_, _): (serde_json::Value, _) = self
            .send(self.request(Method::DELETE, &path).query(&id_query(filter_ids)))
            .await?;
        Ok(())
    }
}
