//! Provisioning and reconciliation of remote IP lists, rules and filters.

use crate::api::{ApiError, EdgeApi, Filter, NewFilter, NewFirewallRule, NewIpListItem};
use crate::state::ActionState;
use crate::zone_lock::ZoneLockTable;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Description of the firewall rule enforcing the list named `list_name`.
fn rule_description(list_name: &str) -> String {
    format!("CrowdSec {} rule", list_name)
}

/// Applies local [`ActionState`] changes to the remote platform for one account.
pub struct ListRuleController<A> {
    api: A,
    account_id: String,
    locks: Arc<ZoneLockTable>,
}

impl<A: EdgeApi> ListRuleController<A> {
    pub fn new(api: A, account_id: &str, locks: Arc<ZoneLockTable>) -> Self {
        Self {
            api,
            account_id: account_id.to_string(),
            locks,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Delete lists a previous run left behind, along with every rule and
    /// filter referencing them. Returns how many lists were removed.
    pub async fn remove_orphaned_lists<'a, I>(&self, states: I) -> Result<usize, ApiError>
    where
        I: IntoIterator<Item = &'a ActionState>,
    {
        let remote_lists = self.api.list_ip_lists().await?;
        let mut removed = 0;

        for state in states {
            let name = &state.ip_list.list.name;
            let Some(existing) = remote_lists.iter().find(|l| &l.name == name) else {
                info!(account_id = %self.account_id, list = %name, "IP list does not exist");
                continue;
            };

            info!(account_id = %self.account_id, list = %name, "IP list already exists, removing it");
            self.remove_list_dependencies(&state.ip_list.reference(), name)
                .await?;
            self.api.delete_ip_list(&existing.id).await?;
            removed += 1;
        }

        Ok(removed)
    }

    /// Remove rules and standalone filters referencing a list in every zone
    /// visible to the account. Rules created for `list_name` are matched by
    /// their exact description too, since their expression may not name the
    /// list.
    async fn remove_list_dependencies(&self, reference: &str, list_name: &str) -> Result<(), ApiError> {
        let zones = self.api.list_zones().await?;
        debug!(account_id = %self.account_id, zones = zones.len(), "Found zones on this account");
        let description = rule_description(list_name);

        for zone in &zones {
            let _guard = self.locks.lock(&zone.id).await;
            let rule_filters = self
                .delete_rules_referencing(&zone.id, reference, &description)
                .await?;
            // Filters outlive their rules and are only visible through the API.
            self.delete_filters_referencing(&zone.id, reference, &rule_filters)
                .await?;
        }

        Ok(())
    }

    /// Delete matching rules, returning the ids of their filters.
    async fn delete_rules_referencing(
        &self,
        zone_id: &str,
        reference: &str,
        description: &str,
    ) -> Result<HashSet<String>, ApiError> {
        let (rule_ids, filter_ids): (Vec<String>, HashSet<String>) = self
            .api
            .firewall_rules(zone_id)
            .await?
            .into_iter()
            .filter(|rule| {
                rule.filter.expression.contains(reference)
                    || rule.description.as_deref() == Some(description)
            })
            .map(|rule| (rule.id, rule.filter.id))
            .unzip();

        if !rule_ids.is_empty() {
            self.api.delete_firewall_rules(zone_id, &rule_ids).await?;
            info!(
                zone_id = %zone_id,
                rules = rule_ids.len(),
                reference = %reference,
                "Deleted firewall rules referencing list"
            );
        }

        Ok(filter_ids)
    }

    async fn delete_filters_referencing(
        &self,
        zone_id: &str,
        reference: &str,
        rule_filters: &HashSet<String>,
    ) -> Result<(), ApiError> {
        let filter_ids: Vec<String> = self
            .api
            .filters(zone_id)
            .await?
            .into_iter()
            .filter(|filter| filter.expression.contains(reference) || rule_filters.contains(&filter.id))
            .inspect(|filter| {
                debug!(zone_id = %zone_id, filter_id = %filter.id, expression = %filter.expression, "Deleting filter");
            })
            .map(|filter| filter.id)
            .collect();

        if !filter_ids.is_empty() {
            self.api.delete_filters(zone_id, &filter_ids).await?;
            info!(zone_id = %zone_id, filters = filter_ids.len(), "Deleted filters referencing list");
        }

        Ok(())
    }

    /// Create the remote list for `state` and reset its local item cache.
    pub async fn create_list(&self, state: &mut ActionState) -> Result<(), ApiError> {
        let description = format!("{} IP list by crowdsec", state.action);
        let list = self
            .api
            .create_ip_list(&state.ip_list.list.name, &description)
            .await?;

        info!(account_id = %self.account_id, list = %list.name, list_id = %list.id, "IP list created");
        state.ip_list.list = list;
        state.ip_list.items.clear();
        state.update_expression();
        Ok(())
    }

    /// Create the firewall rule enforcing `state` in one zone.
    pub async fn create_rule(&self, zone_id: &str, state: &mut ActionState) -> Result<(), ApiError> {
        let rule = NewFirewallRule {
            filter: NewFilter {
                expression: state.expression().to_string(),
            },
            action: state.action,
            description: rule_description(&state.ip_list.list.name),
        };

        let created = {
            let _guard = self.locks.lock(zone_id).await;
            self.api
                .create_firewall_rules(zone_id, std::slice::from_ref(&rule))
                .await?
        };

        let filter_id = created
            .into_iter()
            .next()
            .map(|r| r.filter.id)
            .ok_or_else(|| ApiError::InvalidResponse("No firewall rule created".to_string()))?;
        state.filter_ids.insert(zone_id.to_string(), filter_id);
        Ok(())
    }

    /// Add entries missing from the local cache. Returns how many were sent.
    pub async fn add_items(
        &self,
        state: &mut ActionState,
        items: Vec<NewIpListItem>,
    ) -> Result<usize, ApiError> {
        let items: Vec<NewIpListItem> = items
            .into_iter()
            .filter(|item| !state.ip_list.contains(&item.ip))
            .collect();
        if items.is_empty() {
            return Ok(0);
        }

        let created = self
            .api
            .create_ip_list_items(&state.ip_list.list.id, &items)
            .await?;
        state.ip_list.insert_items(created);

        info!(account_id = %self.account_id, action = %state.action, ips = items.len(), "Banned IPs");
        Ok(items.len())
    }

    /// Remove cached entries for `ips`. Returns how many were removed.
    pub async fn remove_items(&self, state: &mut ActionState, ips: &[String]) -> Result<usize, ApiError> {
        let known: Vec<(&str, String)> = ips
            .iter()
            .filter_map(|ip| {
                state
                    .ip_list
                    .items
                    .get(ip)
                    .map(|item| (ip.as_str(), item.id.clone()))
            })
            .collect();
        if known.is_empty() {
            return Ok(0);
        }

        let item_ids: Vec<String> = known.iter().map(|(_, id)| id.clone()).collect();
        self.api
            .delete_ip_list_items(&state.ip_list.list.id, &item_ids)
            .await?;

        let removed: Vec<&str> = known.iter().map(|(ip, _)| *ip).collect();
        state.ip_list.remove_items(removed.iter().copied());

        info!(account_id = %self.account_id, action = %state.action, ips = removed.len(), "Unbanned IPs");
        Ok(removed.len())
    }

    /// Push the current expression of `state` to its filter in one zone.
    pub async fn push_filter(&self, zone_id: &str, state: &ActionState) -> Result<(), ApiError> {
        let filter_id = state.filter_ids.get(zone_id).ok_or_else(|| {
            ApiError::Other(format!(
                "no filter for action {} in zone {}",
                state.action, zone_id
            ))
        })?;

        let filter = Filter {
            id: filter_id.clone(),
            expression: state.expression().to_string(),
        };

        let _guard = self.locks.lock(zone_id).await;
        self.api
            .update_filters(zone_id, std::slice::from_ref(&filter))
            .await?;
        info!(zone_id = %zone_id, action = %state.action, "Updated firewall rule");
        Ok(())
    }
}
