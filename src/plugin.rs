//! Multi-account Matrix channel plugin.
//!
//! [`MatrixChannel`] is what the host registers: it assembles the account
//! resolver, the authentication resolver and the client registry around the
//! state directory supplied by the host runtime, and tears every connection
//! down when unregistered.
//!
//! # Examples
//!
//! ```no_run
//! use multi_matrix::{
//!     config::Config,
//!     homeserver::HttpHomeserver,
//!     matrix::SdkClientFactory,
//!     plugin::{MatrixChannel, StaticRuntime},
//!     utils::EnvVars,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runtime = StaticRuntime::new(Some("./state".into()));
//! let channel = MatrixChannel::register(
//!     &runtime,
//!     EnvVars::from_process(),
//!     SdkClientFactory::new("./state"),
//!     HttpHomeserver::new(),
//! );
//!
//! let config = Config::load("config.yaml")?;
//! for (account_id, status) in channel.start_enabled_accounts(&config, None).await {
//!     println!("{}: {:?}", account_id, status);
//! }
//!
//! channel.unregister().await;
//! # Ok(())
//! # }
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::future::join_all;
use log::{error, info, warn};

use crate::{
    accounts::AccountResolver,
    auth::AuthResolver,
    config::Config,
    credentials::CredentialStore,
    homeserver::Homeserver,
    matrix::ClientFactory,
    registry::{ClientRegistry, ResolveOptions},
    utils::EnvVars,
};

/// Identifier of the plugin.
pub const PLUGIN_ID: &str = "multi-matrix";
/// Display name of the plugin.
pub const PLUGIN_NAME: &str = "Multi-Matrix";
/// Description of the plugin.
pub const PLUGIN_DESCRIPTION: &str = "Matrix channel plugin with multi-account support";
/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "MULTI_MATRIX_STATE_DIR";
/// State directory used when none is configured.
pub const DEFAULT_STATE_DIR: &str = ".multi-matrix";

/// Host runtime services the plugin depends on.
pub trait PluginRuntime: Send + Sync {
    /// Returns the directory holding credentials and client stores.
    fn resolve_state_dir(&self, env: &EnvVars) -> PathBuf;
}

/// Runtime with an optional fixed state directory.
///
/// Without one, the directory comes from [`STATE_DIR_ENV`], then falls back to
/// [`DEFAULT_STATE_DIR`].
#[derive(Debug, Clone, Default)]
pub struct StaticRuntime {
    state_dir: Option<PathBuf>,
}

impl StaticRuntime {
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        StaticRuntime { state_dir }
    }
}

impl PluginRuntime for StaticRuntime {
    fn resolve_state_dir(&self, env: &EnvVars) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| env.get(STATE_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }
}

/// Outcome of starting one account.
#[derive(Debug)]
pub enum AccountStatus {
    /// The client is created and started
    Started,
    /// Not enough configuration to attempt a connection
    NotConfigured,
    /// Creation, authentication or start failed
    Failed(anyhow::Error),
}

/// The registered channel.
pub struct MatrixChannel<F: ClientFactory, H: Homeserver> {
    accounts: AccountResolver,
    auth: AuthResolver<H>,
    registry: Arc<ClientRegistry<F>>,
}

impl<F: ClientFactory, H: Homeserver> MatrixChannel<F, H> {
    /// Registers the channel against `runtime`.
    ///
    /// # Arguments
    ///
    /// * `runtime` - Host runtime supplying the state directory
    /// * `env` - Environment snapshot used for credential fallbacks
    /// * `factory` - Builder of the per-account connections
    /// * `homeserver` - Client of the authentication endpoints
    pub fn register(runtime: &dyn PluginRuntime, env: EnvVars, factory: F, homeserver: H) -> Self {
        let state_dir = runtime.resolve_state_dir(&env);
        info!(
            "registering {} channel, state in {}",
            PLUGIN_ID,
            state_dir.display()
        );

        let store = CredentialStore::new(state_dir);
        MatrixChannel {
            accounts: AccountResolver::new(store.clone(), env.clone()),
            auth: AuthResolver::new(store, env, homeserver),
            registry: Arc::new(ClientRegistry::new(factory)),
        }
    }

    /// Returns the account resolver.
    pub fn accounts(&self) -> &AccountResolver {
        &self.accounts
    }

    /// Returns the authentication resolver.
    pub fn auth(&self) -> &AuthResolver<H> {
        &self.auth
    }

    /// Returns the client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry<F>> {
        &self.registry
    }

    /// Resolves the client of the options' account from `config`.
    pub async fn resolve_client(
        &self,
        config: &Config,
        options: &ResolveOptions,
    ) -> anyhow::Result<Arc<F::Connection>> {
        self.registry
            .resolve_client_for_config(&self.auth, config, options)
            .await
    }

    /// Starts every enabled account concurrently.
    ///
    /// Accounts that are not configured are skipped. One failing account does
    /// not prevent the others from starting.
    ///
    /// # Returns
    ///
    /// The status of every enabled account, in listing order.
    pub async fn start_enabled_accounts(
        &self,
        config: &Config,
        timeout: Option<Duration>,
    ) -> Vec<(String, AccountStatus)> {
        let accounts = self.accounts.list_enabled_accounts(config).await;

        let starts = accounts.into_iter().map(|account| async move {
            if !account.configured {
                warn!(
                    "[{}] account is not configured, skipping",
                    account.account_id
                );
                return (account.account_id, AccountStatus::NotConfigured);
            }

            let options = ResolveOptions {
                account_id: Some(account.account_id.clone()),
                timeout,
                start_client: true,
            };
            let status = match self.resolve_client(config, &options).await {
                Ok(_) => AccountStatus::Started,
                Err(e) => {
                    error!("[{}] failed to start: {:?}", account.account_id, e);
                    AccountStatus::Failed(e)
                }
            };
            (account.account_id, status)
        });

        join_all(starts).await
    }

    /// Stops every client.
    pub async fn unregister(self) {
        self.registry.stop_client(None).await;
        info!("{} channel unregistered", PLUGIN_ID);
    }
}
