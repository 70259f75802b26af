//! Matrix account resolution.
//!
//! This module turns the configuration into per-account views. An account is
//! either one of the named entries of `channels.matrix.accounts` or, when there
//! are none, the implicit `default` account described by the base settings.
//!
//! Resolution is best-effort introspection: it never fails, missing pieces
//! simply show up as `configured: false`. Callers use it to decide whether a
//! connection should be attempted at all.
//!
//! # Examples
//!
//! ```no_run
//! use multi_matrix::{accounts::AccountResolver, config::Config, credentials::CredentialStore, utils::EnvVars};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load("config.yaml")?;
//! let resolver = AccountResolver::new(CredentialStore::new("./state"), EnvVars::from_process());
//!
//! for account in resolver.list_enabled_accounts(&config).await {
//!     println!("{}: configured={}", account.account_id, account.configured);
//! }
//! # Ok(())
//! # }
//! ```

use log::debug;

use crate::{
    auth::resolve_matrix_config,
    config::{Config, MatrixAccountConfig},
    credentials::CredentialStore,
    utils::EnvVars,
};

/// Id of the implicit account of single-account configurations.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Reserved key of the accounts mapping, never listed as an account.
pub const WILDCARD_ACCOUNT_KEY: &str = "*";

/// Point-in-time view of an account's effective settings.
///
/// Never cached: it reflects the configuration, environment and stored
/// credentials as they were when it was computed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAccount {
    /// Normalized account id
    pub account_id: String,
    /// Whether the account is enabled
    pub enabled: bool,
    /// Display name, if one is configured
    pub name: Option<String>,
    /// Whether enough is known to attempt a connection
    pub configured: bool,
    /// Effective homeserver
    pub homeserver: Option<String>,
    /// Effective user id
    pub user_id: Option<String>,
    /// Merged account settings
    pub config: MatrixAccountConfig,
}

/// Normalizes an account id.
///
/// The id is trimmed and lower-cased and characters outside `[a-z0-9_-]` are
/// replaced with `-`. Absent or blank ids map to [`DEFAULT_ACCOUNT_ID`].
///
/// # Examples
///
/// ```
/// # use multi_matrix::accounts::normalize_account_id;
/// assert_eq!(normalize_account_id(None), "default");
/// assert_eq!(normalize_account_id(Some("  ")), "default");
/// assert_eq!(normalize_account_id(Some("Work Bot")), "work-bot");
/// ```
pub fn normalize_account_id(account_id: Option<&str>) -> String {
    let trimmed = account_id.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return DEFAULT_ACCOUNT_ID.to_string();
    }

    trimmed
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Lists the account ids of a configuration.
///
/// Returns the named accounts in declaration order, without the wildcard key.
/// Without named accounts, returns only [`DEFAULT_ACCOUNT_ID`], whether legacy
/// top-level credentials are present or not.
pub fn list_account_ids(config: &Config) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for key in config.matrix().accounts.keys() {
        if key == WILDCARD_ACCOUNT_KEY {
            continue;
        }
        let id = normalize_account_id(Some(key));
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        ids.push(DEFAULT_ACCOUNT_ID.to_string());
    }
    ids
}

/// Returns [`DEFAULT_ACCOUNT_ID`] if it is listed, else the first listed id.
pub fn resolve_default_account_id(config: &Config) -> String {
    let ids = list_account_ids(config);
    if ids.iter().any(|id| id == DEFAULT_ACCOUNT_ID) {
        return DEFAULT_ACCOUNT_ID.to_string();
    }
    ids.into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string())
}

/// Returns the settings of an account: the base block overlaid with the
/// account's own block, or the base block alone when the account has none.
pub fn merged_account_config(config: &Config, account_id: &str) -> MatrixAccountConfig {
    let matrix = config.matrix();
    let account = matrix
        .accounts
        .iter()
        .filter(|(key, _)| key.as_str() != WILDCARD_ACCOUNT_KEY)
        .find(|(key, _)| normalize_account_id(Some(key)) == account_id)
        .map(|(_, settings)| settings);

    match account {
        Some(settings) => matrix.base.merged_with(settings),
        None => matrix.base.clone(),
    }
}

/// Resolves accounts against the environment and the stored credentials.
#[derive(Debug, Clone)]
pub struct AccountResolver {
    /// Stored credentials, consulted for the `configured` flag
    store: CredentialStore,
    /// Environment fallbacks for credentials
    env: EnvVars,
}

impl AccountResolver {
    /// Creates a resolver.
    pub fn new(store: CredentialStore, env: EnvVars) -> Self {
        AccountResolver { store, env }
    }

    /// Resolves one account. A missing id resolves the default account.
    ///
    /// The account is `configured` when a homeserver is known and at least one
    /// way to authenticate exists: an access token, a user id and password
    /// pair, or a stored credential record for the same homeserver and user.
    pub async fn resolve_account(
        &self,
        config: &Config,
        account_id: Option<&str>,
    ) -> ResolvedAccount {
        let account_id = normalize_account_id(account_id);
        let merged = merged_account_config(config, &account_id);
        let resolved = resolve_matrix_config(config, &self.env, &account_id);

        let has_token = resolved.access_token.is_some();
        let has_password_auth = resolved.user_id.is_some() && resolved.password.is_some();
        let has_stored = match &resolved.homeserver {
            Some(homeserver) => self
                .store
                .load(Some(&account_id))
                .await
                .is_some_and(|stored| {
                    stored.matches(homeserver, resolved.user_id.as_deref().unwrap_or_default())
                }),
            None => false,
        };
        let configured =
            resolved.homeserver.is_some() && (has_token || has_password_auth || has_stored);

        debug!(
            "[{}] resolved account, configured={} (token={}, password={}, stored={})",
            account_id, configured, has_token, has_password_auth, has_stored
        );

        ResolvedAccount {
            enabled: merged.enabled != Some(false),
            name: merged
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned),
            configured,
            homeserver: resolved.homeserver,
            user_id: resolved.user_id,
            config: merged,
            account_id,
        }
    }

    /// Resolves every listed account and keeps the enabled ones, in listing
    /// order.
    pub async fn list_enabled_accounts(&self, config: &Config) -> Vec<ResolvedAccount> {
        let mut accounts = Vec::new();
        for account_id in list_account_ids(config) {
            let account = self.resolve_account(config, Some(&account_id)).await;
            if account.enabled {
                accounts.push(account);
            }
        }
        accounts
    }
}
