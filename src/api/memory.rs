//! In-memory edge platform used by tests.

use super::{
    ApiError, EdgeApi, Filter, FirewallRule, IpList, IpListItem, NewFirewallRule, NewIpListItem, Zone,
    ZoneAccount, ZonePlan,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

struct StoredRule {
    id: String,
    filter_id: String,
    action: String,
    description: Option<String>,
}

#[derive(Default)]
struct Inner {
    zones: Vec<Zone>,
    lists: Vec<IpList>,
    items: HashMap<String, Vec<IpListItem>>,
    rules: HashMap<String, Vec<StoredRule>>,
    filters: HashMap<String, Vec<Filter>>,
    calls: Vec<String>,
    failing: HashSet<String>,
    held: HashMap<String, Arc<Semaphore>>,
    next_id: u64,
}

impl Inner {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{}", prefix, self.next_id)
    }

    fn record(&mut self, call: &str) -> Result<(), ApiError> {
        self.calls.push(call.to_string());
        if self.failing.contains(call) {
            return Err(ApiError::Remote {
                status: 500,
                message: format!("{} failed", call),
            });
        }
        Ok(())
    }

    fn rule_views(&self, zone_id: &str) -> Vec<FirewallRule> {
        let filters = self.filters.get(zone_id).cloned().unwrap_or_default();
        self.rules
            .get(zone_id)
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| FirewallRule {
                        id: rule.id.clone(),
                        filter: filters
                            .iter()
                            .find(|f| f.id == rule.filter_id)
                            .cloned()
                            .unwrap_or_default(),
                        action: rule.action.clone(),
                        description: rule.description.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Records every call; cloned handles share state.
#[derive(Clone, Default)]
pub struct MemoryApi {
    inner: Arc<Mutex<Inner>>,
}

const MUTATING: &[&str] = &[
    "create_ip_list",
    "delete_ip_list",
    "create_ip_list_items",
    "delete_ip_list_items",
    "create_firewall_rules",
    "delete_firewall_rules",
    "update_filters",
    "delete_filters",
];

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn with_zone(self, id: &str, is_subscribed: bool) -> Self {
        self.with_account_zone("acc", id, is_subscribed)
    }

    pub fn with_account_zone(self, account_id: &str, id: &str, is_subscribed: bool) -> Self {
        self.lock().zones.push(Zone {
            id: id.to_string(),
            name: format!("{}.example", id),
            plan: ZonePlan {
                name: "test".to_string(),
                is_subscribed,
            },
            account: ZoneAccount {
                id: account_id.to_string(),
                name: format!("{} account", account_id),
            },
        });
        self
    }

    /// Make every later call to `call` fail.
    pub fn fail_on(&self, call: &str) {
        self.lock().failing.insert(call.to_string());
    }

    pub fn recover(&self, call: &str) {
        self.lock().failing.remove(call);
    }

    /// Hold every later call to `call` until a permit is added to the
    /// returned semaphore. Held calls are recorded once they proceed.
    pub fn hold(&self, call: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.lock().held.insert(call.to_string(), gate.clone());
        gate
    }

    async fn pass(&self, call: &str) {
        let gate = self.lock().held.get(call).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATING.contains(&c.as_str()))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn list(&self, name: &str) -> Option<IpList> {
        self.lock().lists.iter().find(|l| l.name == name).cloned()
    }

    pub fn list_ips(&self, name: &str) -> Vec<String> {
        let inner = self.lock();
        let Some(list) = inner.lists.iter().find(|l| l.name == name) else {
            return Vec::new();
        };
        let mut ips: Vec<String> = inner
            .items
            .get(&list.id)
            .map(|items| items.iter().map(|i| i.ip.clone()).collect())
            .unwrap_or_default();
        ips.sort();
        ips
    }

    pub fn rules(&self, zone_id: &str) -> Vec<FirewallRule> {
        self.lock().rule_views(zone_id)
    }

    pub fn filters_in(&self, zone_id: &str) -> Vec<Filter> {
        self.lock().filters.get(zone_id).cloned().unwrap_or_default()
    }

    /// Leave a list behind as a crashed run would.
    pub fn seed_list(&self, name: &str) -> String {
        let mut inner = self.lock();
        let id = inner.id("list-");
        inner.lists.push(IpList {
            id: id.clone(),
            name: name.to_string(),
            num_items: 0,
            created_on: Some("2024-01-01T00:00:00Z".to_string()),
        });
        id
    }

    pub fn seed_rule(&self, zone_id: &str, expression: &str, action: &str) {
        self.seed_stored_rule(zone_id, expression, action, None);
    }

    pub fn seed_rule_described(&self, zone_id: &str, expression: &str, action: &str, description: &str) {
        self.seed_stored_rule(zone_id, expression, action, Some(description.to_string()));
    }

    fn seed_stored_rule(&self, zone_id: &str, expression: &str, action: &str, description: Option<String>) {
        let mut inner = self.lock();
        let filter_id = inner.id("filter-");
        let rule_id = inner.id("rule-");
        inner.filters.entry(zone_id.to_string()).or_default().push(Filter {
            id: filter_id.clone(),
            expression: expression.to_string(),
        });
        inner
            .rules
            .entry(zone_id.to_string())
            .or_default()
            .push(StoredRule {
                id: rule_id,
                filter_id,
                action: action.to_string(),
                description,
            });
    }

    pub fn seed_filter(&self, zone_id: &str, expression: &str) {
        let mut inner = self.lock();
        let filter_id = inner.id("filter-");
        inner.filters.entry(zone_id.to_string()).or_default().push(Filter {
            id: filter_id,
            expression: expression.to_string(),
        });
    }
}

#[async_trait]
impl EdgeApi for MemoryApi {
    async fn list_zones(&self) -> Result<Vec<Zone>, ApiError> {
        let mut inner = self.lock();
        inner.record("list_zones")?;
        Ok(inner.zones.clone())
    }

    async fn list_ip_lists(&self) -> Result<Vec<IpList>, ApiError> {
        let mut inner = self.lock();
        inner.record("list_ip_lists")?;
        Ok(inner.lists.clone())
    }

    async fn create_ip_list(&self, name: &str, _description: &str) -> Result<IpList, ApiError> {
        self.pass("create_ip_list").await;
        let mut inner = self.lock();
        inner.record("create_ip_list")?;
        let list = IpList {
            id: inner.id("list-"),
            name: name.to_string(),
            num_items: 0,
            created_on: Some("2024-06-01T00:00:00Z".to_string()),
        };
        inner.lists.push(list.clone());
        Ok(list)
    }

    async fn delete_ip_list(&self, list_id: &str) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record("delete_ip_list")?;
        inner.lists.retain(|l| l.id != list_id);
        inner.items.remove(list_id);
        Ok(())
    }

    async fn create_ip_list_items(
        &self,
        list_id: &str,
        items: &[NewIpListItem],
    ) -> Result<Vec<IpListItem>, ApiError> {
        let mut inner = self.lock();
        inner.record("create_ip_list_items")?;
        let mut created = Vec::new();
        for item in items {
            created.push(IpListItem {
                id: inner.id("item-"),
                ip: item.ip.clone(),
                comment: Some(item.comment.clone()),
            });
        }
        inner
            .items
            .entry(list_id.to_string())
            .or_default()
            .extend(created.iter().cloned());
        Ok(created)
    }

    async fn delete_ip_list_items(
        &self,
        list_id: &str,
        item_ids: &[String],
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record("delete_ip_list_items")?;
        if let Some(items) = inner.items.get_mut(list_id) {
            items.retain(|i| !item_ids.contains(&i.id));
        }
        Ok(())
    }

    async fn firewall_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>, ApiError> {
        let mut inner = self.lock();
        inner.record("firewall_rules")?;
        Ok(inner.rule_views(zone_id))
    }

    async fn create_firewall_rules(
        &self,
        zone_id: &str,
        rules: &[NewFirewallRule],
    ) -> Result<Vec<FirewallRule>, ApiError> {
        let mut inner = self.lock();
        inner.record("create_firewall_rules")?;
        let mut created = Vec::new();
        for rule in rules {
            let filter = Filter {
                id: inner.id("filter-"),
                expression: rule.filter.expression.clone(),
            };
            let rule_id = inner.id("rule-");
            inner
                .filters
                .entry(zone_id.to_string())
                .or_default()
                .push(filter.clone());
            inner.rules.entry(zone_id.to_string()).or_default().push(StoredRule {
                id: rule_id.clone(),
                filter_id: filter.id.clone(),
                action: rule.action.to_string(),
                description: Some(rule.description.clone()),
            });
            created.push(FirewallRule {
                id: rule_id,
                filter,
                action: rule.action.to_string(),
                description: Some(rule.description.clone()),
            });
        }
        Ok(created)
    }

    async fn delete_firewall_rules(
        &self,
        zone_id: &str,
        rule_ids: &[String],
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record("delete_firewall_rules")?;
        if let Some(rules) = inner.rules.get_mut(zone_id) {
            rules.retain(|rule| !rule_ids.contains(&rule.id));
        }
        Ok(())
    }

    async fn filters(&self, zone_id: &str) -> Result<Vec<Filter>, ApiError> {
        let mut inner = self.lock();
        inner.record("filters")?;
        Ok(inner.filters.get(zone_id).cloned().unwrap_or_default())
    }

    async fn update_filters(
        &self,
        zone_id: &str,
        filters: &[Filter],
    ) -> Result<Vec<Filter>, ApiError> {
        let mut inner = self.lock();
        inner.record("update_filters")?;
        let stored = inner.filters.entry(zone_id.to_string()).or_default();
        for update in filters {
            match stored.iter_mut().find(|f| f.id == update.id) {
                Some(existing) => existing.expression = update.expression.clone(),
                None => {
                    return Err(ApiError::Remote {
                        status: 404,
                        message: format!("filter {} not found", update.id),
                    })
                }
            }
        }
        Ok(filters.to_vec())
    }

    async fn delete_filters(&self, zone_id: &str, filter_ids: &[String]) -> Result<(), ApiError> {
        let mut inner = self.lock();
        inner.record("delete_filters")?;
        if let Some(filters) = inner.filters.get_mut(zone_id) {
            filters.retain(|f| !filter_ids.contains(&f.id));
        }
        Ok(())
    }
}
