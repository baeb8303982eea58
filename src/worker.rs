//! Per-account synchronization worker.
//!
//! A worker owns every [`ActionState`] of its account. It buffers decisions
//! arriving on its inbound channel and, on every tick of its update timer,
//! applies them to the remote platform in a fixed order:
//!
//! 1. expired IP/range bans are removed from the IP lists
//! 2. new IP/range bans are added to the IP lists
//! 3. expired country bans, then 4. new country bans
//! 5. expired AS bans, then 6. new AS bans
//! 7. changed expressions are pushed to every zone enforcing them
//!
//! Failures inside a step are logged and the cycle moves on; the buffered
//! decisions are dropped either way.

use crate::api::{ApiError, EdgeApi, NewIpListItem};
use crate::classifier::classify;
use crate::config::{AccountConfig, ZoneConfig};
use crate::controller::ListRuleController;
use crate::decision::{Action, Decision, DecisionBatch, Scope};
use crate::state::ActionState;
use crate::zone_lock::ZoneLockTable;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Barrier};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Lifecycle of a worker. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    ProvisioningIfNew,
    SteadyState,
}

/// Fatal worker error.
#[derive(Debug)]
pub enum WorkerError {
    /// Remote call failed during initialization or provisioning.
    Api(ApiError),
    /// A configured zone isn't visible to the account credential.
    ZoneInaccessible { account_id: String, zone_id: String },
    /// A zone lists several actions but its plan allows only one.
    PlanForbidsMultipleActions { zone_id: String },
    /// No state was built for an action a zone requires.
    MissingActionState(Action),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Api(e) => write!(f, "{}", e),
            WorkerError::ZoneInaccessible {
                account_id,
                zone_id,
            } => write!(f, "account {} doesn't have access to zone {}", account_id, zone_id),
            WorkerError::PlanForbidsMultipleActions { zone_id } => {
                write!(f, "plan of zone {} doesn't support multiple actions", zone_id)
            }
            WorkerError::MissingActionState(action) => {
                write!(f, "no state for action {}", action)
            }
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<ApiError> for WorkerError {
    fn from(e: ApiError) -> Self {
        WorkerError::Api(e)
    }
}

/// Decisions waiting for the next update cycle.
#[derive(Debug, Default)]
struct PendingDecisions {
    new_ips: Vec<Arc<Decision>>,
    expired_ips: Vec<Arc<Decision>>,
    new_countries: Vec<Arc<Decision>>,
    expired_countries: Vec<Arc<Decision>>,
    new_as: Vec<Arc<Decision>>,
    expired_as: Vec<Arc<Decision>>,
}

impl PendingDecisions {
    fn insert(&mut self, decision: Arc<Decision>, expired: bool) {
        let buffer = match (decision.scope, expired) {
            (Scope::Ip | Scope::Range, false) => &mut self.new_ips,
            (Scope::Ip | Scope::Range, true) => &mut self.expired_ips,
            (Scope::Country, false) => &mut self.new_countries,
            (Scope::Country, true) => &mut self.expired_countries,
            (Scope::As, false) => &mut self.new_as,
            (Scope::As, true) => &mut self.expired_as,
        };
        buffer.push(decision);
    }

    fn len(&self) -> usize {
        self.new_ips.len()
            + self.expired_ips.len()
            + self.new_countries.len()
            + self.expired_countries.len()
            + self.new_as.len()
            + self.expired_as.len()
    }
}

/// Keeps one account's remote lists and rules in sync with the decision feed.
pub struct SyncWorker<A> {
    account: AccountConfig,
    controller: ListRuleController<A>,
    states: BTreeMap<Action, ActionState>,
    pending: PendingDecisions,
    inbound: mpsc::Receiver<Arc<DecisionBatch>>,
    update_frequency: Duration,
    ready: Option<Arc<Barrier>>,
    phase: Phase,
}

impl<A: EdgeApi> SyncWorker<A> {
    /// Create a worker. `ready` is shared by every worker so rule creation
    /// only starts once all of them have provisioned their lists.
    pub fn new(
        account: AccountConfig,
        api: A,
        locks: Arc<ZoneLockTable>,
        inbound: mpsc::Receiver<Arc<DecisionBatch>>,
        update_frequency: Duration,
        ready: Arc<Barrier>,
    ) -> Self {
        let controller = ListRuleController::new(api, &account.id, locks);
        Self {
            account,
            controller,
            states: BTreeMap::new(),
            pending: PendingDecisions::default(),
            inbound,
            update_frequency,
            ready: Some(ready),
            phase: Phase::Initializing,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self, action: Action) -> Option<&ActionState> {
        self.states.get(&action)
    }

    /// Number of decisions buffered for the next cycle.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Initialize, provision, then alternate between buffering decisions and
    /// running update cycles until the inbound channel closes. Decisions
    /// still buffered at that point are applied before returning.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        if let Err(e) = self.start().await {
            error!(account_id = %self.account.id, error = %e, "Worker failed to start");
            return Err(e);
        }

        let mut ticker = interval_at(Instant::now() + self.update_frequency, self.update_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_update_cycle().await;
                }
                batch = self.inbound.recv() => match batch {
                    Some(batch) => {
                        debug!(account_id = %self.account.id, "Collecting decisions from feed");
                        self.collect(&batch);
                    }
                    None => {
                        if self.pending_len() > 0 {
                            self.run_update_cycle().await;
                        }
                        info!(account_id = %self.account.id, "Decision stream closed, stopping worker");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn start(&mut self) -> Result<(), WorkerError> {
        self.init().await?;
        self.provision_if_new().await
    }

    /// Validate the account's zones and build one state per required action.
    pub async fn init(&mut self) -> Result<(), WorkerError> {
        if !self.states.is_empty() {
            debug!(account_id = %self.account.id, "Action state already built");
            return Ok(());
        }

        let zones = self.controller.api().list_zones().await?;
        let zones_by_id: HashMap<&str, _> = zones.iter().map(|z| (z.id.as_str(), z)).collect();

        for zone_cfg in &self.account.zones {
            let zone = zones_by_id
                .get(zone_cfg.zone_id.as_str())
                .ok_or_else(|| WorkerError::ZoneInaccessible {
                    account_id: self.account.id.clone(),
                    zone_id: zone_cfg.zone_id.clone(),
                })?;

            if !zone.plan.is_subscribed && zone_cfg.actions.len() > 1 {
                return Err(WorkerError::PlanForbidsMultipleActions {
                    zone_id: zone_cfg.zone_id.clone(),
                });
            }
        }

        for action in self.account.actions() {
            let state = ActionState::new(&self.account.id, action, &self.account.ip_list_prefix);
            self.states.insert(action, state);
        }

        info!(
            account_id = %self.account.id,
            zones = self.account.zones.len(),
            actions = self.states.len(),
            "Worker initialized"
        );
        Ok(())
    }

    /// Whether any action's list has yet to be created remotely.
    pub fn is_new(&self) -> bool {
        self.states.values().any(|s| !s.ip_list.is_provisioned())
    }

    /// Tear down leftovers of a previous run and create lists and rules,
    /// unless every list is already provisioned.
    pub async fn provision_if_new(&mut self) -> Result<(), WorkerError> {
        if self.phase == Phase::SteadyState {
            debug!(account_id = %self.account.id, "Already provisioned");
            return Ok(());
        }
        self.phase = Phase::ProvisioningIfNew;

        let fresh = self.is_new();
        if fresh {
            self.controller
                .remove_orphaned_lists(self.states.values())
                .await?;
            for state in self.states.values_mut() {
                self.controller.create_list(state).await?;
            }
            debug!(account_id = %self.account.id, "IP list setup complete");
        } else {
            info!(account_id = %self.account.id, "State already provisioned, skipping setup");
        }

        if let Some(ready) = self.ready.take() {
            ready.wait().await;
        }

        if fresh {
            self.create_rules().await?;
        }

        self.phase = Phase::SteadyState;
        Ok(())
    }

    async fn create_rules(&mut self) -> Result<(), WorkerError> {
        for zone in &self.account.zones {
            for action in &zone.actions {
                let state = self
                    .states
                    .get_mut(action)
                    .ok_or(WorkerError::MissingActionState(*action))?;

                if let Err(e) = self.controller.create_rule(&zone.zone_id, state).await {
                    error!(
                        zone_id = %zone.zone_id,
                        expression = %state.expression(),
                        error = %e,
                        "Failed to create firewall rule"
                    );
                    return Err(e.into());
                }
            }
            info!(zone_id = %zone.zone_id, "Firewall rules created");
        }

        info!(account_id = %self.account.id, "Setup of firewall rules complete");
        Ok(())
    }

    /// Buffer a batch for the next update cycle.
    pub fn collect(&mut self, batch: &DecisionBatch) {
        for (decisions, expired) in [(&batch.new, false), (&batch.expired, true)] {
            let status = if expired { "expired" } else { "new" };
            for decision in decisions {
                info!(
                    account_id = %self.account.id,
                    status,
                    value = %decision.value,
                    scope = %decision.scope,
                    kind = %decision.kind,
                    "Found decision"
                );
                self.pending.insert(decision.clone(), expired);
            }
        }
    }

    /// Apply every buffered decision, then push changed expressions.
    pub async fn run_update_cycle(&mut self) {
        if !self.pending.expired_ips.is_empty() {
            let decisions = std::mem::take(&mut self.pending.expired_ips);
            self.delete_ips(decisions).await;
        }
        if !self.pending.new_ips.is_empty() {
            let decisions = std::mem::take(&mut self.pending.new_ips);
            self.add_ips(decisions).await;
        }
        if !self.pending.expired_countries.is_empty() {
            let decisions = std::mem::take(&mut self.pending.expired_countries);
            self.apply_per_zone(decisions, |state, zone_id, value| {
                if state.countries.remove(value) {
                    debug!(zone_id = %zone_id, country = %value, action = %state.action, "Found expired country ban");
                }
            });
        }
        if !self.pending.new_countries.is_empty() {
            let decisions = std::mem::take(&mut self.pending.new_countries);
            self.apply_per_zone(decisions, |state, zone_id, value| {
                if state.countries.insert(value.to_string()) {
                    debug!(zone_id = %zone_id, country = %value, action = %state.action, "Found new country ban");
                }
            });
        }
        if !self.pending.expired_as.is_empty() {
            let decisions = std::mem::take(&mut self.pending.expired_as);
            self.apply_per_zone(decisions, |state, zone_id, value| {
                if let Some(asn) = parse_asn(value) {
                    if state.autonomous_systems.remove(&asn) {
                        debug!(zone_id = %zone_id, asn, action = %state.action, "Found expired AS ban");
                    }
                }
            });
        }
        if !self.pending.new_as.is_empty() {
            let decisions = std::mem::take(&mut self.pending.new_as);
            self.apply_per_zone(decisions, |state, zone_id, value| match parse_asn(value) {
                Some(asn) => {
                    if state.autonomous_systems.insert(asn) {
                        debug!(zone_id = %zone_id, asn, action = %state.action, "Found new AS ban");
                    }
                }
                None => debug!(value = %value, "Dropping AS ban with malformed number"),
            });
        }

        self.update_rules().await;
    }

    /// Account-wide action for an address ban, or `None` to drop it.
    fn resolve_account_action(&self, bucket: Option<Action>) -> Option<Action> {
        match bucket {
            Some(action) if self.account.all_zones_support(action) => Some(action),
            _ => {
                match self.account.default_action {
                    Some(default) => debug!(from = ?bucket, to = %default, "IP action defaulted"),
                    None => debug!(action = ?bucket, "Dropping IP decisions with unsupported action"),
                }
                self.account.default_action
            }
        }
    }

    async fn delete_ips(&mut self, decisions: Vec<Arc<Decision>>) {
        debug!(account_id = %self.account.id, decisions = decisions.len(), "Processing expired IP decisions");
        let classified = classify(decisions.iter().map(Arc::as_ref));

        for (bucket, entries) in classified.buckets() {
            let Some(action) = self.resolve_account_action(bucket) else {
                continue;
            };
            let Some(state) = self.states.get_mut(&action) else {
                error!(action = %action, "No state for action, dropping IP decisions");
                continue;
            };

            let ips: Vec<String> = entries.iter().map(|n| n.value.clone()).collect();
            if let Err(e) = self.controller.remove_items(state, &ips).await {
                error!(account_id = %self.account.id, action = %action, error = %e, "Failed to unban IPs");
            }
        }
    }

    async fn add_ips(&mut self, decisions: Vec<Arc<Decision>>) {
        debug!(account_id = %self.account.id, decisions = decisions.len(), "Processing new IP decisions");
        let classified = classify(decisions.iter().map(Arc::as_ref));

        for (bucket, entries) in classified.buckets() {
            let Some(action) = self.resolve_account_action(bucket) else {
                continue;
            };
            let Some(state) = self.states.get_mut(&action) else {
                error!(action = %action, "No state for action, dropping IP decisions");
                continue;
            };

            let items = entries
                .iter()
                .map(|n| NewIpListItem {
                    ip: n.value.clone(),
                    comment: n.decision.label.clone(),
                })
                .collect();
            if let Err(e) = self.controller.add_items(state, items).await {
                error!(account_id = %self.account.id, action = %action, error = %e, "Failed to ban IPs");
            }
        }
    }

    /// Apply geographic/ASN decisions zone by zone, resolving each action
    /// against the zone's own supported actions.
    fn apply_per_zone<F>(&mut self, decisions: Vec<Arc<Decision>>, mut apply: F)
    where
        F: FnMut(&mut ActionState, &str, &str),
    {
        let classified = classify(decisions.iter().map(Arc::as_ref));

        for zone in &self.account.zones {
            for (bucket, entries) in classified.buckets() {
                let Some(action) = resolve_zone_action(bucket, zone) else {
                    continue;
                };
                let Some(state) = self.states.get_mut(&action) else {
                    error!(zone_id = %zone.zone_id, action = %action, "No state for action");
                    continue;
                };
                for entry in entries {
                    apply(state, &zone.zone_id, &entry.value);
                }
            }
        }
    }

    /// Recompile every expression and push the changed ones.
    async fn update_rules(&mut self) {
        for (action, state) in self.states.iter_mut() {
            if !state.update_expression() {
                debug!(account_id = %self.account.id, action = %action, "Rule unchanged");
                continue;
            }

            for zone in self.account.zones.iter().filter(|z| z.supports(*action)) {
                if let Err(e) = self.controller.push_filter(&zone.zone_id, state).await {
                    error!(zone_id = %zone.zone_id, action = %action, error = %e, "Failed to update firewall rule");
                }
            }
        }
    }
}

/// Zone-local action for a geographic/ASN ban.
fn resolve_zone_action(bucket: Option<Action>, zone: &ZoneConfig) -> Option<Action> {
    match bucket {
        Some(action) if zone.supports(action) => Some(action),
        Some(action) => {
            let fallback = zone.fallback();
            debug!(zone_id = %zone.zone_id, from = %action, to = ?fallback, "Defaulting action for zone");
            fallback
        }
        None => zone.fallback(),
    }
}

/// Parse `1234` or `AS1234`.
fn parse_asn(value: &str) -> Option<u32> {
    let digits = value
        .strip_prefix("AS")
        .or_else(|| value.strip_prefix("as"))
        .unwrap_or(value);
    digits.parse().ok()
}
