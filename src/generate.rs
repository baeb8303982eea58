//! Builds account sections from API tokens.

use crate::api::{EdgeApi, Zone};
use crate::config::{AccountConfig, ZoneConfig};
use crate::decision::Action;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use tracing::{info, warn};

/// Actions given to a generated zone. Free plans allow a single rule action.
fn zone_actions(zone: &Zone) -> Vec<Action> {
    if zone.plan.is_subscribed {
        vec![Action::Challenge, Action::Block, Action::JsChallenge]
    } else {
        vec![Action::Challenge]
    }
}

/// List the zones visible to every token and group them by owning account.
///
/// A zone visible to several tokens is kept under the first. Zones without
/// an owning account are skipped.
pub async fn discover_accounts<A, M>(tokens: &[String], mut make_api: M) -> Result<Vec<AccountConfig>>
where
    A: EdgeApi,
    M: FnMut(&str) -> Result<A>,
{
    let mut accounts: Vec<AccountConfig> = Vec::new();
    let mut seen = HashSet::new();

    for (index, token) in tokens.iter().enumerate() {
        let api = make_api(token)?;
        let zones = api
            .list_zones()
            .await
            .with_context(|| format!("failed to list zones for token #{}", index + 1))?;
        info!(token = index + 1, zones = zones.len(), "Listed zones");

        for zone in zones {
            if zone.account.id.is_empty() {
                warn!(zone_id = %zone.id, "Zone has no owning account, skipping");
                continue;
            }
            if !seen.insert(zone.id.clone()) {
                continue;
            }

            let position = match accounts.iter().position(|a| a.id == zone.account.id) {
                Some(position) => position,
                None => {
                    accounts.push(AccountConfig {
                        id: zone.account.id.clone(),
                        token: token.clone(),
                        ip_list_prefix: "crowdsec".to_string(),
                        default_action: Some(Action::Challenge),
                        zones: Vec::new(),
                    });
                    accounts.len() - 1
                }
            };
            accounts[position].zones.push(ZoneConfig {
                actions: zone_actions(&zone),
                zone_id: zone.id,
            });
        }
    }

    if accounts.is_empty() {
        bail!("no zones are visible to the given tokens");
    }
    Ok(accounts)
}
