//! Lifecycle registry of the per-account Matrix connections.
//!
//! The [`ClientRegistry`] keeps at most one connection per account and moves
//! each account through `absent → creating → created → starting → ready`.
//! The transient states are guarded by two independent per-account
//! single-flight slots, one for creation and one for start, so concurrent
//! callers for the same account share a single construction and a single
//! start.
//!
//! A connection is identified by a cache key derived from its authentication
//! material. When the key of an account changes (new token, other user,
//! encryption toggled), the old connection is stopped exactly once and a new
//! one is built.
//!
//! # Examples
//!
//! ```no_run
//! use multi_matrix::{
//!     auth::MatrixAuth,
//!     matrix::SdkClientFactory,
//!     registry::{ClientRegistry, ResolveOptions},
//! };
//!
//! # async fn example(auth: MatrixAuth) -> anyhow::Result<()> {
//! let registry = ClientRegistry::new(SdkClientFactory::new("./state"));
//! let connection = registry
//!     .resolve_client(&auth, &ResolveOptions::for_account("work"))
//!     .await?;
//!
//! registry.stop_client(None).await;
//! # Ok(())
//! # }
//! ```

mod single_flight;

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use parking_lot::Mutex;

pub use crate::registry::single_flight::{FlightGuard, SingleFlight};
use crate::{
    accounts::normalize_account_id,
    auth::{AuthResolver, MatrixAuth},
    config::Config,
    homeserver::Homeserver,
    matrix::{ClientFactory, MatrixConnection},
};

/// Options of [`ClientRegistry::resolve_client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Account to resolve, `None` for the default account
    pub account_id: Option<String>,
    /// Limit applied separately to construction and to start
    pub timeout: Option<Duration>,
    /// Start the connection once created
    pub start_client: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            account_id: None,
            timeout: None,
            start_client: true,
        }
    }
}

impl ResolveOptions {
    /// Options resolving and starting `account_id`.
    pub fn for_account(account_id: impl Into<String>) -> Self {
        ResolveOptions {
            account_id: Some(account_id.into()),
            ..Default::default()
        }
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Creates the connection without starting it.
    pub fn without_start(mut self) -> Self {
        self.start_client = false;
        self
    }
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub key: String,
    pub started: bool,
    pub crypto_ready: bool,
}

/// Registered connection of an account.
struct RegistryEntry<C> {
    connection: Arc<C>,
    key: String,
    account_id: String,
    /// Set once `start` succeeded, never reset
    started: AtomicBool,
    /// Set once crypto preparation succeeded, never reset
    crypto_ready: AtomicBool,
}

impl<C> RegistryEntry<C> {
    fn state(&self) -> ClientState {
        ClientState {
            key: self.key.clone(),
            started: self.started.load(Ordering::Acquire),
            crypto_ready: self.crypto_ready.load(Ordering::Acquire),
        }
    }
}

/// Cache key of a connection: changes whenever the connection must be rebuilt.
///
/// # Examples
///
/// ```
/// # use multi_matrix::{auth::MatrixAuth, registry::client_cache_key};
/// let auth = MatrixAuth {
///     homeserver: "https://h".to_string(),
///     user_id: "@u:h".to_string(),
///     access_token: "t".to_string(),
///     device_id: None,
///     encryption: true,
///     initial_sync_limit: None,
/// };
/// assert_eq!(client_cache_key(&auth, "work"), "https://h|@u:h|t|e2ee|work");
/// ```
pub fn client_cache_key(auth: &MatrixAuth, account_id: &str) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        auth.homeserver,
        auth.user_id,
        auth.access_token,
        if auth.encryption { "e2ee" } else { "plain" },
        account_id
    )
}

/// Runs `future`, failing with a timeout error after `timeout` if one is set.
async fn with_timeout<T>(
    timeout: Option<Duration>,
    account_id: &str,
    operation: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(limit) = timeout else {
        return future.await;
    };

    tokio::time::timeout(limit, future).await.map_err(|_| {
        anyhow!(
            "[{}] {} timed out after {}ms",
            account_id,
            operation,
            limit.as_millis()
        )
    })?
}

/// Owner of the per-account connections.
pub struct ClientRegistry<F: ClientFactory> {
    factory: F,
    entries: Mutex<HashMap<String, Arc<RegistryEntry<F::Connection>>>>,
    creating: SingleFlight,
    starting: SingleFlight,
}

impl<F: ClientFactory> ClientRegistry<F> {
    /// Creates an empty registry building connections with `factory`.
    pub fn new(factory: F) -> Self {
        ClientRegistry {
            factory,
            entries: Mutex::new(HashMap::new()),
            creating: SingleFlight::default(),
            starting: SingleFlight::default(),
        }
    }

    /// Returns the factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Returns the connection of an account, creating and starting it as
    /// needed.
    ///
    /// Concurrent calls for the same account share one construction and one
    /// start. A registered connection with another cache key is stopped and
    /// replaced.
    ///
    /// # Arguments
    ///
    /// * `auth` - Authentication material of the account
    /// * `options` - Account, timeout and whether to start the connection
    ///
    /// # Errors
    ///
    /// Returns an error if construction or start fails or times out. The
    /// account's slots are released in every case, so a later call retries.
    pub async fn resolve_client(
        &self,
        auth: &MatrixAuth,
        options: &ResolveOptions,
    ) -> Result<Arc<F::Connection>> {
        let account_id = normalize_account_id(options.account_id.as_deref());
        let key = client_cache_key(auth, &account_id);

        let entry = self
            .get_or_create(&account_id, &key, auth, options.timeout)
            .await?;
        if options.start_client {
            self.ensure_started(&entry, auth.encryption, options.timeout)
                .await?;
        }

        Ok(Arc::clone(&entry.connection))
    }

    /// Derives the authentication material of the options' account, then
    /// behaves as [`ClientRegistry::resolve_client`].
    ///
    /// # Errors
    ///
    /// Returns an error if no usable credentials exist for the account, or as
    /// [`ClientRegistry::resolve_client`] does.
    pub async fn resolve_client_for_config<H: Homeserver>(
        &self,
        auth_resolver: &AuthResolver<H>,
        config: &Config,
        options: &ResolveOptions,
    ) -> Result<Arc<F::Connection>> {
        let auth = auth_resolver
            .resolve_matrix_auth(config, options.account_id.as_deref())
            .await?;
        self.resolve_client(&auth, options).await
    }

    async fn get_or_create(
        &self,
        account_id: &str,
        key: &str,
        auth: &MatrixAuth,
        timeout: Option<Duration>,
    ) -> Result<Arc<RegistryEntry<F::Connection>>> {
        let _creating = self.creating.acquire(account_id).await;

        let existing = self.entries.lock().get(account_id).cloned();
        if let Some(existing) = existing {
            if existing.key == key {
                return Ok(existing);
            }

            info!("[{}] credentials changed, replacing client", account_id);
            self.entries.lock().remove(account_id);
            self.stop_entry(&existing).await;
        }

        debug!("[{}] creating client", account_id);
        let connection = with_timeout(
            timeout,
            account_id,
            "client creation",
            self.factory.create(auth, account_id),
        )
        .await?;

        let entry = Arc::new(RegistryEntry {
            connection: Arc::new(connection),
            key: key.to_owned(),
            account_id: account_id.to_owned(),
            started: AtomicBool::new(false),
            crypto_ready: AtomicBool::new(false),
        });
        self.entries
            .lock()
            .insert(account_id.to_owned(), Arc::clone(&entry));
        info!("[{}] client created", account_id);

        Ok(entry)
    }

    async fn ensure_started(
        &self,
        entry: &Arc<RegistryEntry<F::Connection>>,
        encryption: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if entry.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let _starting = self.starting.acquire(&entry.account_id).await;
        if entry.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.is_registered(entry) {
            bail!(
                "[{}] client was stopped before it could start",
                entry.account_id
            );
        }

        if encryption && !entry.crypto_ready.load(Ordering::Acquire) {
            self.prepare_crypto(entry, timeout).await;
        }

        with_timeout(
            timeout,
            &entry.account_id,
            "client start",
            entry.connection.start(),
        )
        .await?;
        // Removed meanwhile: the remover is waiting on the start slot to stop it
        if !self.is_registered(entry) {
            bail!("[{}] client was stopped while starting", entry.account_id);
        }
        entry.started.store(true, Ordering::Release);
        info!("[{}] client started", entry.account_id);

        Ok(())
    }

    /// Prepares crypto for the joined rooms, within `timeout`. Failures and
    /// timeouts are logged only.
    async fn prepare_crypto(
        &self,
        entry: &RegistryEntry<F::Connection>,
        timeout: Option<Duration>,
    ) {
        let prepared = with_timeout(timeout, &entry.account_id, "crypto preparation", async {
            let room_ids = entry.connection.joined_rooms().await?;
            entry.connection.prepare_crypto(&room_ids).await
        })
        .await;

        match prepared {
            Ok(()) => {
                entry.crypto_ready.store(true, Ordering::Release);
                debug!("[{}] crypto prepared", entry.account_id);
            }
            Err(e) => warn!(
                "[{}] failed to prepare crypto, starting anyway: {:?}",
                entry.account_id, e
            ),
        }
    }

    fn is_registered(&self, entry: &Arc<RegistryEntry<F::Connection>>) -> bool {
        self.entries
            .lock()
            .get(&entry.account_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Stops a connection already removed from `entries`, after any start in
    /// flight for its account.
    async fn stop_entry(&self, entry: &RegistryEntry<F::Connection>) {
        let _starting = self.starting.acquire(&entry.account_id).await;
        match entry.connection.stop().await {
            Ok(()) => info!("[{}] client stopped", entry.account_id),
            Err(e) => warn!("[{}] failed to stop client: {:?}", entry.account_id, e),
        }
    }

    /// Stops and removes the connection of an account, or of every account
    /// when `account_id` is `None`. Never fails: stop errors are logged.
    pub async fn stop_client(&self, account_id: Option<&str>) {
        let removed: Vec<_> = match account_id {
            Some(account_id) => {
                let account_id = normalize_account_id(Some(account_id));
                self.entries.lock().remove(&account_id).into_iter().collect()
            }
            None => self.entries.lock().drain().map(|(_, entry)| entry).collect(),
        };

        for entry in removed {
            self.stop_entry(&entry).await;
        }
    }

    /// Returns the registered connection of an account, if any.
    pub fn get_client_for_account(&self, account_id: &str) -> Option<Arc<F::Connection>> {
        let account_id = normalize_account_id(Some(account_id));
        self.entries
            .lock()
            .get(&account_id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Lists the accounts with a registered connection, sorted.
    pub fn list_active_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.entries.lock().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Returns a snapshot of an account's entry.
    pub fn client_state(&self, account_id: &str) -> Option<ClientState> {
        let account_id = normalize_account_id(Some(account_id));
        self.entries.lock().get(&account_id).map(|entry| entry.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MatrixAccountConfig,
        credentials::CredentialStore,
        homeserver::{MockHomeserver, WhoAmI},
        matrix::MockMatrixConnection,
        testing::{FakeConnection, FakeFactory, auth},
        utils::EnvVars,
    };
    use tempfile::TempDir;

    fn fake_registry(
        create_delay: Duration,
        start_delay: Duration,
    ) -> ClientRegistry<FakeFactory<FakeConnection>> {
        ClientRegistry::new(FakeFactory::fake(start_delay).with_delay(create_delay))
    }

    #[test]
    fn test_cache_key_changes_with_auth() {
        let base = auth("t1");
        let key = client_cache_key(&base, "default");
        assert_eq!(
            key,
            "https://matrix.example.org|@bot:example.org|t1|plain|default"
        );

        let mut encrypted = base.clone();
        encrypted.encryption = true;
        assert_ne!(client_cache_key(&encrypted, "default"), key);
        assert_ne!(client_cache_key(&auth("t2"), "default"), key);
        assert_ne!(client_cache_key(&base, "work"), key);
    }

    #[test]
    fn test_cache_key_ignores_device_and_sync_limit() {
        let base = auth("t1");
        let mut other = base.clone();
        other.device_id = None;
        other.initial_sync_limit = Some(10);

        assert_eq!(
            client_cache_key(&base, "default"),
            client_cache_key(&other, "default")
        );
    }

    #[tokio::test]
    async fn test_resolve_creates_and_starts() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);

        let connection = registry
            .resolve_client(&auth("t1"), &ResolveOptions::default())
            .await
            .unwrap();

        assert_eq!(registry.factory().created(), 1);
        assert_eq!(connection.starts(), 1);
        assert_eq!(connection.account_id, "default");
        assert_eq!(registry.list_active_accounts(), vec!["default"]);
        let state = registry.client_state("default").unwrap();
        assert!(state.started);
        assert!(!state.crypto_ready);
    }

    #[tokio::test]
    async fn test_resolve_same_key_reuses_client() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);
        let options = ResolveOptions::for_account("work");

        let first = registry.resolve_client(&auth("t1"), &options).await.unwrap();
        let second = registry.resolve_client(&auth("t1"), &options).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.factory().created(), 1);
        assert_eq!(first.starts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_creates_and_starts_once() {
        let registry = fake_registry(Duration::from_millis(20), Duration::from_millis(20));
        let options = ResolveOptions::default();
        let auth = auth("t1");

        let (a, b) = tokio::join!(
            registry.resolve_client(&auth, &options),
            registry.resolve_client(&auth, &options)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.factory().created(), 1);
        assert_eq!(a.starts(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_across_threads() {
        let registry = Arc::new(fake_registry(
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .resolve_client(&auth("t1"), &ResolveOptions::for_account("work"))
                        .await
                })
            })
            .collect();
        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap().unwrap());
        }

        assert_eq!(registry.factory().created(), 1);
        assert_eq!(connections[0].starts(), 1);
        assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
    }

    #[tokio::test]
    async fn test_accounts_are_independent() {
        let registry = fake_registry(Duration::from_millis(10), Duration::ZERO);

        let (auth_work, auth_home) = (auth("t1"), auth("t1"));
        let (opts_work, opts_home) = (
            ResolveOptions::for_account("work"),
            ResolveOptions::for_account("home"),
        );
        let (work, home) = tokio::join!(
            registry.resolve_client(&auth_work, &opts_work),
            registry.resolve_client(&auth_home, &opts_home)
        );

        assert!(!Arc::ptr_eq(&work.unwrap(), &home.unwrap()));
        assert_eq!(registry.factory().created(), 2);
        assert_eq!(registry.list_active_accounts(), vec!["home", "work"]);
    }

    #[tokio::test]
    async fn test_key_change_replaces_client() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);
        let options = ResolveOptions::default();

        let old = registry.resolve_client(&auth("t1"), &options).await.unwrap();
        let new = registry.resolve_client(&auth("t2"), &options).await.unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.stops(), 1);
        assert_eq!(new.stops(), 0);
        assert_eq!(new.access_token, "t2");
        assert_eq!(registry.factory().created(), 2);
        assert_eq!(registry.list_active_accounts(), vec!["default"]);
        assert!(registry.client_state("default").unwrap().key.contains("|t2|"));
    }

    #[tokio::test]
    async fn test_concurrent_key_change_stops_old_once() {
        let registry = fake_registry(Duration::from_millis(10), Duration::ZERO);
        let options = ResolveOptions::default();
        let old = registry.resolve_client(&auth("t1"), &options).await.unwrap();

        let new_auth = auth("t2");
        let (a, b, c) = tokio::join!(
            registry.resolve_client(&new_auth, &options),
            registry.resolve_client(&new_auth, &options),
            registry.resolve_client(&new_auth, &options)
        );

        assert_eq!(old.stops(), 1);
        assert_eq!(registry.factory().created(), 2);
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
    }

    #[tokio::test]
    async fn test_without_start_then_start() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);

        let unstarted = registry
            .resolve_client(&auth("t1"), &ResolveOptions::default().without_start())
            .await
            .unwrap();
        assert_eq!(unstarted.starts(), 0);
        assert!(!registry.client_state("default").unwrap().started);

        let started = registry
            .resolve_client(&auth("t1"), &ResolveOptions::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&unstarted, &started));
        assert_eq!(started.starts(), 1);
        assert!(registry.client_state("default").unwrap().started);
    }

    #[tokio::test]
    async fn test_start_failure_propagates_and_retry_succeeds() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| FakeConnection {
            failing_starts: 1.into(),
            ..Default::default()
        }));
        let options = ResolveOptions::default();

        let result = registry.resolve_client(&auth("t1"), &options).await;
        assert!(result.is_err());
        assert!(!registry.client_state("default").unwrap().started);

        let connection = registry.resolve_client(&auth("t1"), &options).await.unwrap();

        assert_eq!(registry.factory().created(), 1);
        assert_eq!(connection.starts(), 2);
        assert!(registry.client_state("default").unwrap().started);
    }

    #[tokio::test]
    async fn test_creation_failure_releases_slot() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);
        registry.factory().fail_next.store(true, Ordering::SeqCst);
        let options = ResolveOptions::default();

        let result = registry.resolve_client(&auth("t1"), &options).await;
        assert!(result.is_err());
        assert!(registry.get_client_for_account("default").is_none());

        let connection = registry.resolve_client(&auth("t1"), &options).await;

        assert!(connection.is_ok());
        assert_eq!(registry.factory().created(), 2);
    }

    #[tokio::test]
    async fn test_creation_timeout_releases_slot() {
        let registry = fake_registry(Duration::from_millis(200), Duration::ZERO);
        let options = ResolveOptions::default().with_timeout(Duration::from_millis(20));

        let result = registry.resolve_client(&auth("t1"), &options).await;

        let error = result.err().unwrap();
        assert!(error.to_string().contains("timed out"));
        assert!(registry.get_client_for_account("default").is_none());
        assert!(!registry.creating.is_pending("default"));
    }

    #[tokio::test]
    async fn test_start_timeout_leaves_entry_unstarted() {
        let registry = fake_registry(Duration::ZERO, Duration::from_millis(200));
        let options = ResolveOptions::default().with_timeout(Duration::from_millis(20));

        let result = registry.resolve_client(&auth("t1"), &options).await;

        assert!(result.is_err());
        let state = registry.client_state("default").unwrap();
        assert!(!state.started);
        assert!(!registry.starting.is_pending("default"));
    }

    #[tokio::test]
    async fn test_cancelled_resolve_releases_slots() {
        let registry = fake_registry(Duration::from_millis(200), Duration::ZERO);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            registry.resolve_client(&auth("t1"), &ResolveOptions::default()),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(registry.creating.is_empty());
        assert!(registry.starting.is_empty());
    }

    #[tokio::test]
    async fn test_crypto_prepared_before_start() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| {
            let mut sequence = mockall::Sequence::new();
            let mut connection = MockMatrixConnection::new();
            connection
                .expect_joined_rooms()
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|| Ok(vec!["!room:example.org".to_string()]));
            connection
                .expect_prepare_crypto()
                .withf(|room_ids| room_ids.len() == 1 && room_ids[0] == "!room:example.org")
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|_| Ok(()));
            connection
                .expect_start()
                .times(1)
                .in_sequence(&mut sequence)
                .returning(|| Ok(()));
            connection
        }));
        let mut encrypted = auth("t1");
        encrypted.encryption = true;

        registry
            .resolve_client(&encrypted, &ResolveOptions::default())
            .await
            .unwrap();

        let state = registry.client_state("default").unwrap();
        assert!(state.started);
        assert!(state.crypto_ready);
    }

    #[tokio::test]
    async fn test_crypto_failure_is_swallowed() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| {
            let mut connection = MockMatrixConnection::new();
            connection
                .expect_joined_rooms()
                .times(1)
                .returning(|| Err(anyhow!("joined rooms unavailable")));
            connection.expect_prepare_crypto().times(0);
            connection.expect_start().times(1).returning(|| Ok(()));
            connection
        }));
        let mut encrypted = auth("t1");
        encrypted.encryption = true;

        let result = registry
            .resolve_client(&encrypted, &ResolveOptions::default())
            .await;

        assert!(result.is_ok());
        let state = registry.client_state("default").unwrap();
        assert!(state.started);
        assert!(!state.crypto_ready);
    }

    #[tokio::test]
    async fn test_no_crypto_without_encryption() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| {
            let mut connection = MockMatrixConnection::new();
            connection.expect_joined_rooms().times(0);
            connection.expect_start().times(1).returning(|| Ok(()));
            connection
        }));

        registry
            .resolve_client(&auth("t1"), &ResolveOptions::default())
            .await
            .unwrap();

        assert!(!registry.client_state("default").unwrap().crypto_ready);
    }

    #[tokio::test]
    async fn test_crypto_ready_without_joined_rooms() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| {
            let mut connection = MockMatrixConnection::new();
            connection
                .expect_joined_rooms()
                .times(1)
                .returning(|| Ok(Vec::new()));
            connection
                .expect_prepare_crypto()
                .withf(|room_ids| room_ids.is_empty())
                .times(1)
                .returning(|_| Ok(()));
            connection.expect_start().times(1).returning(|| Ok(()));
            connection
        }));
        let mut encrypted = auth("t1");
        encrypted.encryption = true;

        registry
            .resolve_client(&encrypted, &ResolveOptions::default())
            .await
            .unwrap();

        assert!(registry.client_state("default").unwrap().crypto_ready);
    }

    #[tokio::test]
    async fn test_hanging_crypto_preparation_is_bounded() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| FakeConnection {
            crypto_delay: Duration::from_secs(3600),
            ..Default::default()
        }));
        let mut encrypted = auth("t1");
        encrypted.encryption = true;
        let options = ResolveOptions::default().with_timeout(Duration::from_millis(20));

        let connection = registry.resolve_client(&encrypted, &options).await.unwrap();

        assert_eq!(connection.starts(), 1);
        assert!(connection.is_running());
        let state = registry.client_state("default").unwrap();
        assert!(state.started);
        assert!(!state.crypto_ready);
        assert!(!registry.starting.is_pending("default"));
    }

    #[tokio::test]
    async fn test_stop_during_start_stops_client_after_start() {
        let registry = Arc::new(fake_registry(Duration::ZERO, Duration::from_millis(50)));
        let resolving = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .resolve_client(&auth("t1"), &ResolveOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let connection = registry.get_client_for_account("default").unwrap();

        registry.stop_client(None).await;
        let result = resolving.await.unwrap();

        assert!(result.is_err());
        assert_eq!(connection.starts(), 1);
        assert_eq!(connection.stops(), 1);
        assert!(!connection.is_running());
        assert!(registry.get_client_for_account("default").is_none());
    }

    #[tokio::test]
    async fn test_key_change_during_start_leaves_one_running_client() {
        let registry = Arc::new(fake_registry(Duration::ZERO, Duration::from_millis(50)));
        let resolving = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                registry
                    .resolve_client(&auth("t1"), &ResolveOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let old = registry.get_client_for_account("default").unwrap();

        let new = registry
            .resolve_client(&auth("t2"), &ResolveOptions::default())
            .await
            .unwrap();
        let old_result = resolving.await.unwrap();

        assert!(old_result.is_err());
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.stops(), 1);
        assert!(!old.is_running());
        assert!(new.is_running());
        let state = registry.client_state("default").unwrap();
        assert!(state.started);
        assert!(state.key.contains("|t2|"));
    }

    #[tokio::test]
    async fn test_stop_single_client() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);
        let work = registry
            .resolve_client(&auth("t1"), &ResolveOptions::for_account("work"))
            .await
            .unwrap();
        registry
            .resolve_client(&auth("t1"), &ResolveOptions::for_account("home"))
            .await
            .unwrap();

        registry.stop_client(Some("Work")).await;

        assert_eq!(work.stops(), 1);
        assert!(registry.get_client_for_account("work").is_none());
        assert_eq!(registry.list_active_accounts(), vec!["home"]);
    }

    #[tokio::test]
    async fn test_stop_all_clients() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);
        let mut connections = Vec::new();
        for account in ["a", "b", "c"] {
            connections.push(
                registry
                    .resolve_client(&auth("t1"), &ResolveOptions::for_account(account))
                    .await
                    .unwrap(),
            );
        }

        registry.stop_client(None).await;

        assert!(registry.list_active_accounts().is_empty());
        assert!(connections.iter().all(|c| c.stops() == 1));
        for account in ["a", "b", "c"] {
            assert!(registry.get_client_for_account(account).is_none());
            assert!(registry.client_state(account).is_none());
        }
    }

    #[tokio::test]
    async fn test_stop_absent_client_is_noop() {
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);

        registry.stop_client(Some("missing")).await;
        registry.stop_client(None).await;

        assert!(registry.list_active_accounts().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_still_removes_client() {
        let registry = ClientRegistry::new(FakeFactory::new(|_, _| {
            let mut connection = MockMatrixConnection::new();
            connection.expect_start().returning(|| Ok(()));
            connection
                .expect_stop()
                .times(1)
                .returning(|| Err(anyhow!("already gone")));
            connection
        }));
        registry
            .resolve_client(&auth("t1"), &ResolveOptions::default())
            .await
            .unwrap();

        registry.stop_client(None).await;

        assert!(registry.get_client_for_account("default").is_none());
    }

    #[tokio::test]
    async fn test_resolve_client_for_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut homeserver = MockHomeserver::new();
        homeserver.expect_whoami().times(1).returning(|_, _| {
            Ok(WhoAmI {
                user_id: "@bot:example.org".to_string(),
                device_id: Some("DEVICE".to_string()),
            })
        });
        let resolver = AuthResolver::new(
            CredentialStore::new(temp_dir.path()),
            EnvVars::default(),
            homeserver,
        );
        let mut config = Config::default();
        config.channels.matrix.accounts.insert(
            "work".to_string(),
            MatrixAccountConfig {
                homeserver: Some("https://matrix.example.org".to_string()),
                access_token: Some("t1".to_string()),
                ..Default::default()
            },
        );
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);

        let connection = registry
            .resolve_client_for_config(&resolver, &config, &ResolveOptions::for_account("work"))
            .await
            .unwrap();

        assert_eq!(connection.access_token, "t1");
        assert_eq!(connection.account_id, "work");
        assert_eq!(
            registry.client_state("work").unwrap().key,
            "https://matrix.example.org|@bot:example.org|t1|plain|work"
        );
    }

    #[tokio::test]
    async fn test_resolve_client_for_config_without_credentials() {
        let temp_dir = TempDir::new().unwrap();
        let resolver = AuthResolver::new(
            CredentialStore::new(temp_dir.path()),
            EnvVars::default(),
            MockHomeserver::new(),
        );
        let registry = fake_registry(Duration::ZERO, Duration::ZERO);

        let result = registry
            .resolve_client_for_config(&resolver, &Config::default(), &ResolveOptions::default())
            .await;

        assert!(result.is_err());
        assert_eq!(registry.factory().created(), 0);
    }
}
