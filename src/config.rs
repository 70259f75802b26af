//! Configuration file structures for the multi-matrix channel.
//!
//! This module defines the configuration file format. The file is YAML and can be
//! overridden with environment variables through [`Config::load`].
//!
//! # Configuration File Format
//!
//! ```yaml
//! channels:
//!   matrix:
//!     # Base settings, used as-is by the default account and as fallbacks
//!     # for every named account
//!     homeserver: "https://matrix.example.org"
//!     encryption: true
//!     dm:
//!       policy: allowlist
//!       allow_from: ["@alice:example.org"]
//!
//!     # Optional named accounts, listed in this order
//!     accounts:
//!       work:
//!         user_id: "@work-bot:example.org"
//!         access_token: "syt_..."
//!       home:
//!         homeserver: "https://home.example.net"
//!         user_id: "@home-bot:example.net"
//!         password: "secret"
//!         dm:
//!           policy: open
//! ```
//!
//! # Environment Variable Overrides
//!
//! Any value can be overridden with the `MULTI_MATRIX_` prefix, using `__` to
//! separate nested keys:
//!
//! ```bash
//! export MULTI_MATRIX_CHANNELS__MATRIX__HOMESERVER="https://matrix.example.org"
//! export MULTI_MATRIX_CHANNELS__MATRIX__ACCOUNTS__WORK__ACCESS_TOKEN="syt_..."
//! ```

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Prefix of the environment variables overriding the configuration file.
pub const CONFIG_ENV_PREFIX: &str = "MULTI_MATRIX_";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Channel configurations
    #[serde(default)]
    pub channels: Channels,
}

/// Channel section of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    /// Matrix channel configuration
    #[serde(default)]
    pub matrix: MatrixConfig,
}

/// Matrix channel configuration.
///
/// The base settings are flattened at the top level of the `matrix` section.
/// Named accounts live in `accounts` and only need to set what differs from the
/// base.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Base account settings
    #[serde(flatten)]
    pub base: MatrixAccountConfig,

    /// Account-specific settings, keyed by account id, in declaration order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub accounts: IndexMap<String, MatrixAccountConfig>,
}

/// Settings of one Matrix account.
///
/// Every field is optional so the same structure can describe both the base
/// block and a partial per-account override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixAccountConfig {
    /// Human readable account name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Whether the account is enabled. Absent means enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Homeserver base URL, e.g. `https://matrix.org`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homeserver: Option<String>,

    /// Fully qualified Matrix user id, e.g. `@bot:matrix.org`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Access token. Takes precedence over password login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Password used for login when no access token is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Device display name sent on password login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Enable end-to-end encryption support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<bool>,

    /// Timeline limit of the initial sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_sync_limit: Option<u32>,

    /// Policy applied to group rooms that have no explicit entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_policy: Option<GroupPolicy>,

    /// Direct message policy.
    #[serde(default, skip_serializing_if = "DmConfig::is_empty")]
    pub dm: DmConfig,

    /// Per-room group settings, keyed by room id or alias.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub groups: IndexMap<String, RoomConfig>,

    /// Legacy name of `groups`, kept for older configurations.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub rooms: IndexMap<String, RoomConfig>,

    /// Tool actions the agent may perform on this account.
    #[serde(default, skip_serializing_if = "ActionsConfig::is_empty")]
    pub actions: ActionsConfig,
}

/// Who may open a direct conversation with the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Pairing,
    Allowlist,
    Open,
    Disabled,
}

/// How group rooms without an explicit entry are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Open,
    Allowlist,
    Disabled,
}

/// Direct message settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<DmPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_from: Option<Vec<String>>,
}

/// Settings of a single group room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_mention: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reply: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Action toggles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pins: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_info: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_info: Option<bool>,
}

impl Config {
    /// Loads the configuration from a YAML file, then applies environment
    /// overrides prefixed with [`CONFIG_ENV_PREFIX`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not match the
    /// expected structure.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use multi_matrix::config::Config;
    /// let config = Config::load("config.yaml")?;
    /// println!("{} named accounts", config.channels.matrix.accounts.len());
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let mut config: Config = Figment::new()
            .merge(Yaml::file_exact(path))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
            .extract()?;

        // figment hands maps back sorted by key
        let order = declared_account_order(path)?;
        config.channels.matrix.restore_account_order(&order);
        Ok(config)
    }

    /// Returns the Matrix channel section.
    pub fn matrix(&self) -> &MatrixConfig {
        &self.channels.matrix
    }
}

impl MatrixConfig {
    /// Reorders `accounts` to follow `order`. Accounts missing from `order`
    /// keep their relative order after the listed ones.
    pub fn restore_account_order(&mut self, order: &[String]) {
        let rank = |key: &String| {
            order
                .iter()
                .position(|declared| declared == key)
                .unwrap_or(usize::MAX)
        };
        self.accounts.sort_by(|a, _, b, _| rank(a).cmp(&rank(b)));
    }
}

/// Reads the keys of `channels.matrix.accounts` in the order the YAML file
/// declares them.
fn declared_account_order(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let document: serde_yaml::Value = serde_yaml::from_str(&content)?;

    let Some(accounts) = document
        .get("channels")
        .and_then(|channels| channels.get("matrix"))
        .and_then(|matrix| matrix.get("accounts"))
        .and_then(serde_yaml::Value::as_mapping)
    else {
        return Ok(Vec::new());
    };

    Ok(accounts
        .keys()
        .filter_map(|key| match key {
            serde_yaml::Value::String(key) => Some(key.clone()),
            serde_yaml::Value::Number(key) => Some(key.to_string()),
            serde_yaml::Value::Bool(key) => Some(key.to_string()),
            _ => None,
        })
        .collect())
}

impl MatrixAccountConfig {
    /// Overlays `overrides` on top of `self`.
    ///
    /// Scalars take the override when it is set. Nested blocks are merged key
    /// by key, the override winning on conflicts.
    pub fn merged_with(&self, overrides: &MatrixAccountConfig) -> MatrixAccountConfig {
        MatrixAccountConfig {
            name: overrides.name.clone().or_else(|| self.name.clone()),
            enabled: overrides.enabled.or(self.enabled),
            homeserver: overrides
                .homeserver
                .clone()
                .or_else(|| self.homeserver.clone()),
            user_id: overrides.user_id.clone().or_else(|| self.user_id.clone()),
            access_token: overrides
                .access_token
                .clone()
                .or_else(|| self.access_token.clone()),
            password: overrides.password.clone().or_else(|| self.password.clone()),
            device_name: overrides
                .device_name
                .clone()
                .or_else(|| self.device_name.clone()),
            encryption: overrides.encryption.or(self.encryption),
            initial_sync_limit: overrides.initial_sync_limit.or(self.initial_sync_limit),
            group_policy: overrides.group_policy.or(self.group_policy),
            dm: self.dm.merged_with(&overrides.dm),
            groups: merge_rooms(&self.groups, &overrides.groups),
            rooms: merge_rooms(&self.rooms, &overrides.rooms),
            actions: self.actions.merged_with(&overrides.actions),
        }
    }
}

impl DmConfig {
    fn is_empty(&self) -> bool {
        *self == DmConfig::default()
    }

    /// Field-wise merge, `overrides` winning.
    pub fn merged_with(&self, overrides: &DmConfig) -> DmConfig {
        DmConfig {
            enabled: overrides.enabled.or(self.enabled),
            policy: overrides.policy.or(self.policy),
            allow_from: overrides
                .allow_from
                .clone()
                .or_else(|| self.allow_from.clone()),
        }
    }
}

impl ActionsConfig {
    fn is_empty(&self) -> bool {
        *self == ActionsConfig::default()
    }

    /// Field-wise merge, `overrides` winning.
    pub fn merged_with(&self, overrides: &ActionsConfig) -> ActionsConfig {
        ActionsConfig {
            reactions: overrides.reactions.or(self.reactions),
            messages: overrides.messages.or(self.messages),
            pins: overrides.pins.or(self.pins),
            member_info: overrides.member_info.or(self.member_info),
            channel_info: overrides.channel_info.or(self.channel_info),
        }
    }
}

/// Key-wise merge of room maps: base entries first, then the overriding
/// entries, which replace base entries with the same key.
fn merge_rooms(
    base: &IndexMap<String, RoomConfig>,
    overrides: &IndexMap<String, RoomConfig>,
) -> IndexMap<String, RoomConfig> {
    let mut merged = base.clone();
    for (room, settings) in overrides {
        merged.insert(room.clone(), settings.clone());
    }
    merged
}
