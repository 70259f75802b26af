//! Authentication material for Matrix connections.
//!
//! Settings are looked up in the merged account configuration first and in the
//! environment second. [`AuthResolver`] then turns them into a [`MatrixAuth`],
//! reusing an access token when one is known and logging in with a password
//! otherwise. Fresh credentials are persisted through the [`CredentialStore`]
//! so the next start does not create another device.

use anyhow::{Context, bail};
use log::{debug, info, warn};

use crate::{
    accounts::{DEFAULT_ACCOUNT_ID, merged_account_config, normalize_account_id},
    config::Config,
    credentials::{CredentialStore, NewCredentials, StoredCredentials},
    homeserver::{Homeserver, PasswordLogin},
    utils::EnvVars,
};

/// Prefix of the per-account environment fallbacks.
const ENV_PREFIX: &str = "MATRIX";

/// Effective connection settings of an account, before authentication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedMatrixConfig {
    pub homeserver: Option<String>,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub password: Option<String>,
    pub device_name: Option<String>,
    /// End-to-end encryption requested
    pub encryption: bool,
    /// Timeline limit of the initial sync
    pub initial_sync_limit: Option<u32>,
}

/// Everything needed to build and start a Matrix client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAuth {
    pub homeserver: String,
    pub user_id: String,
    pub access_token: String,
    pub device_id: Option<String>,
    pub encryption: bool,
    pub initial_sync_limit: Option<u32>,
}

/// Name of the environment variable holding `field` for an account.
///
/// The default account reads `MATRIX_<FIELD>`, named accounts read
/// `MATRIX_<ID>_<FIELD>` with the id upper-cased and every non-alphanumeric
/// character replaced by `_`.
///
/// # Examples
///
/// ```
/// # use multi_matrix::auth::env_var_name;
/// assert_eq!(env_var_name("default", "HOMESERVER"), "MATRIX_HOMESERVER");
/// assert_eq!(env_var_name("work-bot", "ACCESS_TOKEN"), "MATRIX_WORK_BOT_ACCESS_TOKEN");
/// ```
pub fn env_var_name(account_id: &str, field: &str) -> String {
    if account_id == DEFAULT_ACCOUNT_ID {
        return format!("{}_{}", ENV_PREFIX, field);
    }

    let account: String = account_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_{}", ENV_PREFIX, account, field)
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Resolves the connection settings of an account.
///
/// Every value comes from the merged account configuration when it is set
/// there, otherwise from the account's environment variable.
pub fn resolve_matrix_config(
    config: &Config,
    env: &EnvVars,
    account_id: &str,
) -> ResolvedMatrixConfig {
    let merged = merged_account_config(config, account_id);
    let pick = |configured: &Option<String>, field: &str| {
        clean(configured.as_deref()).or_else(|| clean(env.get(&env_var_name(account_id, field))))
    };

    ResolvedMatrixConfig {
        homeserver: pick(&merged.homeserver, "HOMESERVER"),
        user_id: pick(&merged.user_id, "USER_ID"),
        access_token: pick(&merged.access_token, "ACCESS_TOKEN"),
        password: pick(&merged.password, "PASSWORD"),
        device_name: pick(&merged.device_name, "DEVICE_NAME"),
        encryption: merged.encryption.unwrap_or(false),
        initial_sync_limit: merged.initial_sync_limit,
    }
}

/// Derives [`MatrixAuth`] from configuration, environment and stored
/// credentials.
///
/// # Examples
///
/// ```no_run
/// use multi_matrix::{
///     auth::AuthResolver, config::Config, credentials::CredentialStore,
///     homeserver::HttpHomeserver, utils::EnvVars,
/// };
///
/// # async fn example() -> anyhow::Result<()> {
/// let resolver = AuthResolver::new(
///     CredentialStore::new("./state"),
///     EnvVars::from_process(),
///     HttpHomeserver::new(),
/// );
/// let auth = resolver
///     .resolve_matrix_auth(&Config::load("config.yaml")?, Some("work"))
///     .await?;
/// println!("connecting as {}", auth.user_id);
/// # Ok(())
/// # }
/// ```
pub struct AuthResolver<H: Homeserver> {
    store: CredentialStore,
    env: EnvVars,
    homeserver: H,
}

impl<H: Homeserver> AuthResolver<H> {
    /// Creates a resolver.
    pub fn new(store: CredentialStore, env: EnvVars, homeserver: H) -> Self {
        AuthResolver {
            store,
            env,
            homeserver,
        }
    }

    /// Returns the credential store.
    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Returns the environment snapshot.
    pub fn env(&self) -> &EnvVars {
        &self.env
    }

    /// Resolves the authentication material of an account.
    ///
    /// In order of preference:
    /// 1. the configured access token, completed with a user id and device id
    ///    from a stored record or from `whoami`;
    /// 2. a stored record for the same homeserver and user;
    /// 3. a password login, whose result is stored.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration to resolve the account from
    /// * `account_id` - Account to resolve, `None` for the default account
    ///
    /// # Errors
    ///
    /// Returns an error if no homeserver is known, if no way to authenticate
    /// exists, or if a homeserver request fails.
    pub async fn resolve_matrix_auth(
        &self,
        config: &Config,
        account_id: Option<&str>,
    ) -> anyhow::Result<MatrixAuth> {
        let account_id = normalize_account_id(account_id);
        let resolved = resolve_matrix_config(config, &self.env, &account_id);

        let Some(homeserver) = resolved.homeserver.clone() else {
            bail!(
                "[{}] no homeserver configured, set it in the config or {}",
                account_id,
                env_var_name(&account_id, "HOMESERVER")
            );
        };

        let (user_id, access_token, device_id) = if let Some(access_token) =
            resolved.access_token.clone()
        {
            self.with_access_token(&account_id, &homeserver, &resolved, access_token)
                .await?
        } else if let Some(stored) = self.load_matching(&account_id, &homeserver, &resolved).await
        {
            self.with_stored(&account_id, &homeserver, &resolved, stored)
                .await?
        } else {
            self.with_password(&account_id, &homeserver, &resolved)
                .await?
        };

        Ok(MatrixAuth {
            homeserver,
            user_id,
            access_token,
            device_id,
            encryption: resolved.encryption,
            initial_sync_limit: resolved.initial_sync_limit,
        })
    }

    async fn load_matching(
        &self,
        account_id: &str,
        homeserver: &str,
        resolved: &ResolvedMatrixConfig,
    ) -> Option<StoredCredentials> {
        let user_id = resolved.user_id.as_deref().unwrap_or_default();
        self.store
            .load(Some(account_id))
            .await
            .filter(|stored| stored.matches(homeserver, user_id))
    }

    async fn with_access_token(
        &self,
        account_id: &str,
        homeserver: &str,
        resolved: &ResolvedMatrixConfig,
        access_token: String,
    ) -> anyhow::Result<(String, String, Option<String>)> {
        let stored = self.store.load(Some(account_id)).await.filter(|stored| {
            stored.access_token == access_token
                && stored.homeserver.trim_end_matches('/') == homeserver.trim_end_matches('/')
        });
        let user_id = resolved
            .user_id
            .clone()
            .or_else(|| stored.as_ref().and_then(|s| clean(Some(s.user_id.as_str()))));
        let device_id = stored.and_then(|s| s.device_id);

        if let (Some(user_id), Some(device_id)) = (&user_id, &device_id) {
            debug!("[{}] using configured access token", account_id);
            return Ok((user_id.clone(), access_token, Some(device_id.clone())));
        }

        let whoami = self
            .homeserver
            .whoami(homeserver, &access_token)
            .await
            .with_context(|| format!("[{}] failed to identify access token", account_id))?;
        if let Some(configured) = &user_id
            && configured != &whoami.user_id
        {
            warn!(
                "[{}] configured user {} differs from token owner {}, using the token owner",
                account_id, configured, whoami.user_id
            );
        }

        self.persist(
            account_id,
            NewCredentials {
                homeserver: homeserver.to_string(),
                user_id: whoami.user_id.clone(),
                access_token: access_token.clone(),
                device_id: whoami.device_id.clone(),
            },
        )
        .await;

        Ok((whoami.user_id, access_token, whoami.device_id))
    }

    async fn with_stored(
        &self,
        account_id: &str,
        homeserver: &str,
        resolved: &ResolvedMatrixConfig,
        stored: StoredCredentials,
    ) -> anyhow::Result<(String, String, Option<String>)> {
        debug!("[{}] using stored credentials", account_id);
        if let Err(e) = self.store.touch(Some(account_id)).await {
            warn!("[{}] failed to update stored credentials: {:?}", account_id, e);
        }

        if let Some(user_id) = clean(Some(stored.user_id.as_str())) {
            return Ok((user_id, stored.access_token, stored.device_id));
        }

        // Token-only record: identify it once and complete the record
        let whoami = self
            .homeserver
            .whoami(homeserver, &stored.access_token)
            .await
            .with_context(|| format!("[{}] failed to identify stored token", account_id))?;
        if let Some(configured) = &resolved.user_id
            && configured != &whoami.user_id
        {
            warn!(
                "[{}] configured user {} differs from stored token owner {}",
                account_id, configured, whoami.user_id
            );
        }
        let device_id = stored.device_id.or(whoami.device_id);
        self.persist(
            account_id,
            NewCredentials {
                homeserver: homeserver.to_string(),
                user_id: whoami.user_id.clone(),
                access_token: stored.access_token.clone(),
                device_id: device_id.clone(),
            },
        )
        .await;

        Ok((whoami.user_id, stored.access_token, device_id))
    }

    async fn with_password(
        &self,
        account_id: &str,
        homeserver: &str,
        resolved: &ResolvedMatrixConfig,
    ) -> anyhow::Result<(String, String, Option<String>)> {
        let (Some(user_id), Some(password)) = (&resolved.user_id, &resolved.password) else {
            bail!(
                "[{}] no usable credentials: configure an access token, or a user id and password",
                account_id
            );
        };

        let response = self
            .homeserver
            .login_password(&PasswordLogin {
                homeserver: homeserver.to_string(),
                user_id: user_id.clone(),
                password: password.clone(),
                device_name: resolved.device_name.clone(),
            })
            .await
            .with_context(|| format!("[{}] password login failed", account_id))?;
        info!(
            "[{}] logged in as {} with device {}",
            account_id, response.user_id, response.device_id
        );

        self.persist(
            account_id,
            NewCredentials {
                homeserver: homeserver.to_string(),
                user_id: response.user_id.clone(),
                access_token: response.access_token.clone(),
                device_id: Some(response.device_id.clone()),
            },
        )
        .await;

        Ok((
            response.user_id,
            response.access_token,
            Some(response.device_id),
        ))
    }

    async fn persist(&self, account_id: &str, credentials: NewCredentials) {
        if let Err(e) = self.store.save(credentials, Some(account_id)).await {
            warn!("[{}] failed to store credentials: {:?}", account_id, e);
        }
    }
}
