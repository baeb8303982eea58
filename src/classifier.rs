//! Normalization, deduplication and action grouping of decision batches.

use crate::decision::{Action, Decision};
use ipnet::Ipv6Net;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv6Addr;
use tracing::debug;

/// Prefix length every IPv6 ban is widened to at most.
const IPV6_BAN_PREFIX: u8 = 64;

/// Normalize a decision value for use as an IP list entry.
///
/// Values with at most one colon (IPv4 addresses, ranges, country codes,
/// AS numbers) are returned unchanged. IPv6 values become a network of
/// prefix length at most /64: a bare address or a longer prefix is widened
/// to its /64, a shorter prefix is kept. Returns `None` for malformed IPv6.
pub fn normalize_value(value: &str) -> Option<String> {
    if value.matches(':').count() <= 1 {
        return Some(value.to_string());
    }

    let net = match value.parse::<Ipv6Net>() {
        Ok(net) => net,
        Err(_) => {
            let addr = value.parse::<Ipv6Addr>().ok()?;
            Ipv6Net::new(addr, IPV6_BAN_PREFIX).ok()?
        }
    };

    let net = if net.prefix_len() < IPV6_BAN_PREFIX {
        net.trunc()
    } else {
        Ipv6Net::new(net.addr(), IPV6_BAN_PREFIX).ok()?.trunc()
    };

    Some(net.to_string())
}

/// A decision paired with its normalized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized<'a> {
    pub decision: &'a Decision,
    pub value: String,
}

/// Decisions of one batch grouped by target action.
#[derive(Debug, Default)]
pub struct Classified<'a> {
    by_action: BTreeMap<Action, Vec<Normalized<'a>>>,
    defaulted: Vec<Normalized<'a>>,
}

impl<'a> Classified<'a> {
    /// Decisions whose type maps to `action`, in batch order.
    pub fn action(&self, action: Action) -> &[Normalized<'a>] {
        self.by_action
            .get(&action)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Decisions whose type has no policy mapping; the caller resolves them.
    pub fn defaulted(&self) -> &[Normalized<'a>] {
        &self.defaulted
    }

    /// Every bucket, mapped actions first; `None` marks the defaulted bucket.
    pub fn buckets(&self) -> impl Iterator<Item = (Option<Action>, &[Normalized<'a>])> + '_ {
        self.by_action
            .iter()
            .map(|(action, decisions)| (Some(*action), decisions.as_slice()))
            .chain(std::iter::once((None, self.defaulted.as_slice())))
            .filter(|(_, decisions)| !decisions.is_empty())
    }

    pub fn len(&self) -> usize {
        self.by_action.values().map(Vec::len).sum::<usize>() + self.defaulted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalize, dedup and group a batch of decisions of one temporal kind.
///
/// The first occurrence of a normalized value wins; later duplicates are
/// dropped even when they declare a different type.
pub fn classify<'a, I>(decisions: I) -> Classified<'a>
where
    I: IntoIterator<Item = &'a Decision>,
{
    let mut seen = HashSet::new();
    let mut classified = Classified::default();

    for decision in decisions {
        let Some(value) = normalize_value(&decision.value) else {
            debug!(
                value = %decision.value,
                scope = %decision.scope,
                "Dropping decision with malformed value"
            );
            continue;
        };

        if !seen.insert(value.clone()) {
            debug!(value = %value, kind = %decision.kind, "Dropping duplicate decision");
            continue;
        }

        let entry = Normalized { decision, value };
        match Action::for_decision_type(&decision.kind) {
            Some(action) => classified.by_action.entry(action).or_default().push(entry),
            None => classified.defaulted.push(entry),
        }
    }

    classified
}
