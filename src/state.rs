//! Per-action ban state and the filter expression compiled from it.

use crate::api::{IpList, IpListItem};
use crate::decision::Action;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Local mirror of a remote IP list plus the items this process knows about.
#[derive(Debug, Clone)]
pub struct IpListState {
    pub list: IpList,
    /// Normalized IP/CIDR to the remote item holding it.
    pub items: HashMap<String, IpListItem>,
}

impl IpListState {
    /// State for a list that has been named but not yet created remotely.
    pub fn unprovisioned(name: String) -> Self {
        Self {
            list: IpList {
                name,
                ..IpList::default()
            },
            items: HashMap::new(),
        }
    }

    /// A list with a creation timestamp exists on the remote platform.
    pub fn is_provisioned(&self) -> bool {
        self.list.created_on.is_some()
    }

    /// Token other expressions use to reference this list.
    pub fn reference(&self) -> String {
        format!("${}", self.list.name)
    }

    pub fn contains(&self, ip: &str) -> bool {
        self.items.contains_key(ip)
    }

    /// Record items the remote platform confirmed as created.
    pub fn insert_items(&mut self, items: impl IntoIterator<Item = IpListItem>) {
        for item in items {
            self.items.insert(item.ip.clone(), item);
        }
        self.list.num_items = self.items.len();
    }

    /// Forget items the remote platform confirmed as deleted.
    pub fn remove_items<'a>(&mut self, ips: impl IntoIterator<Item = &'a str>) {
        for ip in ips {
            self.items.remove(ip);
        }
        self.list.num_items = self.items.len();
    }
}

/// Everything banned under one remote action for one account.
#[derive(Debug, Clone)]
pub struct ActionState {
    pub action: Action,
    pub account_id: String,
    pub ip_list: IpListState,
    pub countries: BTreeSet<String>,
    pub autonomous_systems: BTreeSet<u32>,
    /// Zone id to the remote filter enforcing this action in that zone.
    pub filter_ids: BTreeMap<String, String>,
    expression: String,
}

impl ActionState {
    pub fn new(account_id: &str, action: Action, list_prefix: &str) -> Self {
        Self {
            action,
            account_id: account_id.to_string(),
            ip_list: IpListState::unprovisioned(list_name(list_prefix, action)),
            countries: BTreeSet::new(),
            autonomous_systems: BTreeSet::new(),
            filter_ids: BTreeMap::new(),
            expression: String::new(),
        }
    }

    /// Last compiled (and last pushed) expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Compile the current membership into a filter expression.
    ///
    /// Clause order is fixed (country, AS, address list) and elements are
    /// sorted, so identical state always yields identical text.
    pub fn compile_expression(&self) -> String {
        let mut clauses = Vec::with_capacity(3);

        if !self.countries.is_empty() {
            let countries: Vec<String> = self
                .countries
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect();
            clauses.push(format!("(ip.geoip.country in {{{}}})", countries.join(" ")));
        }

        if !self.autonomous_systems.is_empty() {
            let numbers: Vec<String> = self
                .autonomous_systems
                .iter()
                .map(u32::to_string)
                .collect();
            clauses.push(format!("(ip.geoip.asnum in {{{}}})", numbers.join(" ")));
        }

        if !self.ip_list.items.is_empty() {
            clauses.push(format!("(ip.src in {})", self.ip_list.reference()));
        }

        clauses.join(" or ")
    }

    /// Recompile the expression. Returns true if it differs from the previous one.
    pub fn update_expression(&mut self) -> bool {
        let compiled = self.compile_expression();
        if compiled == self.expression {
            return false;
        }
        self.expression = compiled;
        true
    }
}

/// Canonical remote list name for an action.
pub fn list_name(prefix: &str, action: Action) -> String {
    format!("{}_{}", prefix, action)
}
