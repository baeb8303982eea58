//! Configuration types for the ban synchronizer.

use crate::decision::Action;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Base URL of the decision feed (CrowdSec local API).
    pub crowdsec_lapi_url: String,

    /// Bouncer API key for the decision feed (supports ${ENV_VAR} syntax).
    pub crowdsec_lapi_key: String,

    /// How often to poll the decision feed (seconds).
    #[serde(default = "default_update_frequency")]
    pub crowdsec_update_frequency_seconds: u64,

    /// Remote platform settings and managed accounts.
    pub cloudflare: CloudflareConfig,
}

/// Remote platform configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudflareConfig {
    /// API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Period of the update cycle pushing pending decisions (seconds).
    #[serde(default = "default_update_frequency")]
    pub update_frequency_seconds: u64,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub request_timeout_ms: u64,

    /// Accounts to keep in sync; one worker runs per account.
    pub accounts: Vec<AccountConfig>,
}

impl CloudflareConfig {
    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Every configured zone id across all accounts.
    pub fn zone_ids(&self) -> impl Iterator<Item = &str> {
        self.accounts
            .iter()
            .flat_map(|a| a.zones.iter().map(|z| z.zone_id.as_str()))
    }
}

/// One account on the remote platform.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Account id.
    pub id: String,

    /// API token (supports ${ENV_VAR} syntax).
    pub token: String,

    /// Prefix of the IP lists created for this account.
    #[serde(default = "default_ip_list_prefix")]
    pub ip_list_prefix: String,

    /// Action for address bans whose action isn't supported by every zone.
    /// `none` drops them instead.
    #[serde(
        default,
        deserialize_with = "deserialize_default_action",
        serialize_with = "serialize_default_action"
    )]
    pub default_action: Option<Action>,

    /// Managed zones.
    pub zones: Vec<ZoneConfig>,
}

impl AccountConfig {
    /// Whether every zone of the account supports `action`.
    pub fn all_zones_support(&self, action: Action) -> bool {
        self.zones.iter().all(|z| z.supports(action))
    }

    /// Distinct actions used by any zone, in first-seen order.
    pub fn actions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        for action in self.zones.iter().flat_map(|z| z.actions.iter()) {
            if !actions.contains(action) {
                actions.push(*action);
            }
        }
        actions
    }
}

/// One managed zone.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneConfig {
    /// Zone id.
    pub zone_id: String,

    /// Supported actions; the first is the zone's fallback.
    pub actions: Vec<Action>,
}

impl ZoneConfig {
    pub fn supports(&self, action: Action) -> bool {
        self.actions.contains(&action)
    }

    /// The action this zone falls back to.
    pub fn fallback(&self) -> Option<Action> {
        self.actions.first().copied()
    }
}

fn default_update_frequency() -> u64 {
    10
}

fn default_api_url() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_timeout() -> u64 {
    30_000
}

fn default_ip_list_prefix() -> String {
    "crowdsec".to_string()
}

fn deserialize_default_action<'de, D>(deserializer: D) -> Result<Option<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(serde::de::Error::custom)
}

fn serialize_default_action<S>(action: &Option<Action>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match action {
        Some(action) => serializer.serialize_str(action.as_str()),
        None => serializer.serialize_str("none"),
    }
}

impl Config {
    /// Configuration with default settings and no accounts.
    pub fn skeleton() -> Self {
        Self {
            crowdsec_lapi_url: "http://127.0.0.1:8080/".to_string(),
            crowdsec_lapi_key: "${CROWDSEC_LAPI_KEY}".to_string(),
            crowdsec_update_frequency_seconds: default_update_frequency(),
            cloudflare: CloudflareConfig {
                api_url: default_api_url(),
                update_frequency_seconds: default_update_frequency(),
                request_timeout_ms: default_timeout(),
                accounts: Vec::new(),
            },
        }
    }

    /// Parse a YAML file as written, leaving `${VAR}` references in place
    /// and skipping validation.
    pub fn read(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.crowdsec_lapi_url.is_empty() {
            anyhow::bail!("crowdsec_lapi_url is empty");
        }
        if self.crowdsec_lapi_key.is_empty() {
            anyhow::bail!("crowdsec_lapi_key is empty");
        }
        if self.crowdsec_update_frequency_seconds == 0 {
            anyhow::bail!("crowdsec_update_frequency_seconds must be > 0");
        }
        if self.cloudflare.update_frequency_seconds == 0 {
            anyhow::bail!("cloudflare.update_frequency_seconds must be > 0");
        }
        if self.cloudflare.accounts.is_empty() {
            anyhow::bail!("no cloudflare accounts configured");
        }

        let mut zone_ids = HashSet::new();
        for account in &self.cloudflare.accounts {
            if account.id.is_empty() {
                anyhow::bail!("account id is empty");
            }
            if account.token.is_empty() {
                anyhow::bail!("account {} has an empty token", account.id);
            }
            if account.ip_list_prefix.is_empty() {
                anyhow::bail!("account {} has an empty ip_list_prefix", account.id);
            }
            if account.zones.is_empty() {
                anyhow::bail!("account {} has no zones", account.id);
            }

            for zone in &account.zones {
                if !zone_ids.insert(zone.zone_id.as_str()) {
                    anyhow::bail!("zone {} is configured more than once", zone.zone_id);
                }
                if zone.actions.is_empty() {
                    anyhow::bail!("zone {} has no actions", zone.zone_id);
                }
                let unique: HashSet<&Action> = zone.actions.iter().collect();
                if unique.len() != zone.actions.len() {
                    anyhow::bail!("zone {} lists an action twice", zone.zone_id);
                }
            }

            if let Some(default) = account.default_action {
                if !account.zones.iter().any(|z| z.supports(default)) {
                    anyhow::bail!(
                        "default action {} of account {} is not supported by any of its zones",
                        default,
                        account.id
                    );
                }
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# Cloudflare ban synchronizer configuration

# Decision feed
crowdsec_lapi_url: "http://127.0.0.1:8080/"
crowdsec_lapi_key: "${CROWDSEC_LAPI_KEY}"   # Use environment variable
crowdsec_update_frequency_seconds: 10

cloudflare:
  api_url: "https://api.cloudflare.com/client/v4"
  update_frequency_seconds: 10         # Push pending decisions every 10s
  request_timeout_ms: 30000
  accounts:
    - id: "<account id>"
      token: "${CLOUDFLARE_TOKEN}"
      ip_list_prefix: "crowdsec"       # Lists are named <prefix>_<action>
      default_action: "challenge"      # block, challenge, js_challenge or none
      zones:
        - zone_id: "<zone id>"
          actions: ["challenge"]       # First action is the zone fallback
"#
        .to_string()
    }
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        let var_value = std::env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    const MINIMAL: &str = r#"
crowdsec_lapi_url: "http://localhost:8080/"
crowdsec_lapi_key: "key"
cloudflare:
  accounts:
    - id: "acc"
      token: "tok"
      zones:
        - zone_id: "z1"
          actions: [block]
"#;

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.crowdsec_update_frequency_seconds, 10);
        assert_eq!(config.cloudflare.api_url, "https://api.cloudflare.com/client/v4");
        assert_eq!(config.cloudflare.update_frequency(), Duration::from_secs(10));
        assert_eq!(config.cloudflare.request_timeout(), Duration::from_secs(30));

        let account = &config.cloudflare.accounts[0];
        assert_eq!(account.ip_list_prefix, "crowdsec");
        assert_eq!(account.default_action, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_action_parsing() {
        let config = parse(&MINIMAL.replace("token: \"tok\"", "token: \"tok\"\n      default_action: block"));
        assert_eq!(config.cloudflare.accounts[0].default_action, Some(Action::Block));

        let config = parse(&MINIMAL.replace("token: \"tok\"", "token: \"tok\"\n      default_action: none"));
        assert_eq!(config.cloudflare.accounts[0].default_action, None);

        let result: Result<Config, _> = serde_yaml::from_str(
            &MINIMAL.replace("token: \"tok\"", "token: \"tok\"\n      default_action: tarpit"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_zone_action_rejected() {
        let result: Result<Config, _> =
            serde_yaml::from_str(&MINIMAL.replace("[block]", "[block, tarpit]"));
        assert!(result.is_err());
    }

    #[test]
    fn test_account_actions() {
        let account = AccountConfig {
            id: "acc".to_string(),
            token: "tok".to_string(),
            ip_list_prefix: "crowdsec".to_string(),
            default_action: None,
            zones: vec![
                ZoneConfig {
                    zone_id: "z1".to_string(),
                    actions: vec![Action::Challenge, Action::Block],
                },
                ZoneConfig {
                    zone_id: "z2".to_string(),
                    actions: vec![Action::Block],
                },
            ],
        };

        assert_eq!(account.actions(), vec![Action::Challenge, Action::Block]);
        assert!(account.all_zones_support(Action::Block));
        assert!(!account.all_zones_support(Action::Challenge));
        assert_eq!(account.zones[0].fallback(), Some(Action::Challenge));
    }

    #[test]
    fn test_validate_duplicate_zone() {
        let mut config = parse(MINIMAL);
        let account = config.cloudflare.accounts[0].clone();
        config.cloudflare.accounts.push(AccountConfig {
            id: "other".to_string(),
            ..account
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_action() {
        let config = parse(&MINIMAL.replace("[block]", "[block, block]"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_zone_actions() {
        let config = parse(&MINIMAL.replace("[block]", "[]"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_unsupported_default_action() {
        let mut config = parse(MINIMAL);
        config.cloudflare.accounts[0].default_action = Some(Action::Challenge);
        assert!(config.validate().is_err());

        config.cloudflare.accounts[0].default_action = Some(Action::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_frequency() {
        let mut config = parse(MINIMAL);
        config.cloudflare.update_frequency_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_no_accounts() {
        let mut config = parse(MINIMAL);
        config.cloudflare.accounts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zone_ids() {
        let config = parse(MINIMAL);
        let ids: Vec<&str> = config.cloudflare.zone_ids().collect();
        assert_eq!(ids, vec!["z1"]);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CF_TOKEN", "secret123");
        let input = "token: \"${TEST_CF_TOKEN}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "token: \"secret123\"");
        std::env::remove_var("TEST_CF_TOKEN");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let input = "token: \"${NONEXISTENT_VAR}\"";
        let result = expand_env_vars(input);
        assert_eq!(result, "token: \"\"");
    }

    #[test]
    fn test_yaml_round_trip_keeps_env_references() {
        let mut config = Config::skeleton();
        config.cloudflare.accounts.push(AccountConfig {
            id: "acc".to_string(),
            token: "tok".to_string(),
            ip_list_prefix: "crowdsec".to_string(),
            default_action: None,
            zones: vec![ZoneConfig {
                zone_id: "z1".to_string(),
                actions: vec![Action::JsChallenge],
            }],
        });

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("${CROWDSEC_LAPI_KEY}"));
        assert!(yaml.contains("default_action: none"));
        assert!(yaml.contains("js_challenge"));

        let parsed = parse(&yaml);
        assert_eq!(parsed.cloudflare.accounts[0].default_action, None);
        assert_eq!(parsed.cloudflare.accounts[0].zones[0].actions, vec![Action::JsChallenge]);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_skeleton_has_no_accounts() {
        let config = Config::skeleton();
        assert!(config.cloudflare.accounts.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_parses() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        assert_eq!(config.cloudflare.accounts.len(), 1);
        assert_eq!(
            config.cloudflare.accounts[0].default_action,
            Some(Action::Challenge)
        );
    }
}
