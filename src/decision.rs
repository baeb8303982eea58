//! Decisions delivered by the threat feed and the remote actions they map to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Scope of a decision: what kind of value it bans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A single address.
    Ip,
    /// An address range in CIDR notation.
    Range,
    /// An ISO country code.
    Country,
    /// An autonomous system number.
    As,
}

impl Scope {
    /// Parse a scope name, ignoring case. Returns `None` for unknown scopes.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "IP" => Some(Scope::Ip),
            "RANGE" => Some(Scope::Range),
            "COUNTRY" => Some(Scope::Country),
            "AS" => Some(Scope::As),
            _ => None,
        }
    }

    /// Whether decisions of this scope land in the account-wide IP list.
    pub fn is_address(&self) -> bool {
        matches!(self, Scope::Ip | Scope::Range)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Ip => "IP",
            Scope::Range => "RANGE",
            Scope::Country => "COUNTRY",
            Scope::As => "AS",
        };
        f.write_str(name)
    }
}

/// A single enforcement instruction from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub scope: Scope,
    /// Declared decision type, e.g. `ban` or `captcha`.
    pub kind: String,
    pub value: String,
    /// Free-text label (the scenario that produced the decision).
    pub label: String,
}

impl Decision {
    pub fn new(scope: Scope, kind: &str, value: &str, label: &str) -> Self {
        Self {
            scope,
            kind: kind.to_string(),
            value: value.to_string(),
            label: label.to_string(),
        }
    }
}

/// One delivery from the feed, split by temporal kind.
///
/// Batches are shared between workers behind an [`Arc`], so individual
/// decisions are reference-counted rather than cloned.
#[derive(Debug, Clone, Default)]
pub struct DecisionBatch {
    pub new: Vec<Arc<Decision>>,
    pub expired: Vec<Arc<Decision>>,
}

impl DecisionBatch {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.expired.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.expired.len()
    }
}

/// Enforcement action on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Block,
    Challenge,
    JsChallenge,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Block => "block",
            Action::Challenge => "challenge",
            Action::JsChallenge => "js_challenge",
        }
    }

    /// Map a declared decision type to the remote action enforcing it.
    pub fn for_decision_type(kind: &str) -> Option<Self> {
        match kind {
            "ban" => Some(Action::Block),
            "captcha" => Some(Action::Challenge),
            "js_challenge" => Some(Action::JsChallenge),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Action::Block),
            "challenge" => Ok(Action::Challenge),
            "js_challenge" => Ok(Action::JsChallenge),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}
