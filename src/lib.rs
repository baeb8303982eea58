//! Cloudflare ban synchronizer.
//!
//! Mirrors ban decisions from a CrowdSec decision feed into Cloudflare:
//! address bans land in per-action account IP lists, country and AS bans
//! are compiled into per-zone firewall rule expressions.
//!
//! # Features
//!
//! - **Multi-account** - One worker per account, zones locked individually
//! - **Action mapping** - `ban`, `captcha` and `js_challenge` decisions map to
//!   `block`, `challenge` and `js_challenge` rules, with per-zone fallbacks
//! - **IPv6 aggregation** - IPv6 bans are widened to their /64
//! - **Crash recovery** - Lists and rules left by a previous run are replaced
//! - **Rate limiting** - Remote calls are paced per credential and counted
//!   in a Prometheus registry
//! - **Config generation** - Accounts and zones discovered from API tokens
//!
//! # Example Configuration
//!
//! ```yaml
//! crowdsec_lapi_url: "http://127.0.0.1:8080/"
//! crowdsec_lapi_key: "${CROWDSEC_LAPI_KEY}"
//!
//! cloudflare:
//!   accounts:
//!     - id: "<account id>"
//!       token: "${CLOUDFLARE_TOKEN}"
//!       default_action: "block"
//!       zones:
//!         - zone_id: "<zone id>"
//!           actions: ["block"]
//! ```

pub mod api;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod decision;
pub mod feed;
pub mod generate;
pub mod metrics;
pub mod state;
pub mod supervisor;
pub mod worker;
pub mod zone_lock;

pub use api::cloudflare::CloudflareClient;
pub use config::Config;
pub use feed::LapiStream;
