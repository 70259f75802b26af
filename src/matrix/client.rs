//! Matrix SDK backed connections.
//!
//! This module provides [`SdkClientFactory`], which builds one
//! `matrix_sdk::Client` per account with its own sqlite store, and
//! [`SdkConnection`], which drives the client's sync loop.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use async_trait::async_trait;
use log::{debug, info};
use matrix_sdk::{
    Client, SessionMeta, SessionTokens, authentication::matrix::MatrixSession,
    ruma::OwnedUserId,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    auth::MatrixAuth,
    matrix::{
        ClientFactory, MatrixConnection,
        encryption::{encryption_settings, prepare_crypto},
        sync::MatrixSync,
    },
    utils::{get_path, sanitize_path_segment},
};

/// Builds [`SdkConnection`]s with a store under the state directory.
///
/// The store of an account lives in
/// `<state>/matrix/accounts/<account>/<user>`, so switching the user of an
/// account never reuses another user's crypto store.
#[derive(Debug, Clone)]
pub struct SdkClientFactory {
    /// State directory
    state_dir: PathBuf,
}

impl SdkClientFactory {
    /// Creates a factory rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        SdkClientFactory {
            state_dir: state_dir.into(),
        }
    }

    /// Path of the sqlite store of an account's user.
    pub fn store_path(&self, account_id: &str, user_id: &str) -> PathBuf {
        get_path(
            &self.state_dir,
            &[
                "matrix",
                "accounts",
                &sanitize_path_segment(account_id),
                &sanitize_path_segment(user_id),
            ],
        )
    }

    async fn build_client(&self, auth: &MatrixAuth, store_path: &Path) -> anyhow::Result<Client> {
        let mut builder = Client::builder()
            .homeserver_url(&auth.homeserver)
            .sqlite_store(store_path, None);
        if auth.encryption {
            builder = builder.with_encryption_settings(encryption_settings());
        }

        Ok(builder.build().await?)
    }
}

#[async_trait]
impl ClientFactory for SdkClientFactory {
    type Connection = SdkConnection;

    /// Builds the client and restores the session described by `auth`.
    async fn create(&self, auth: &MatrixAuth, account_id: &str) -> anyhow::Result<SdkConnection> {
        let user_id: OwnedUserId = auth
            .user_id
            .clone()
            .try_into()
            .with_context(|| format!("[{}] invalid user id {}", account_id, auth.user_id))?;
        let Some(device_id) = auth.device_id.as_deref() else {
            bail!(
                "[{}] no device id known for {}, log in again to obtain one",
                account_id,
                auth.user_id
            );
        };

        let store_path = self.store_path(account_id, &auth.user_id);
        debug!(
            "[{}] building matrix client with store {}",
            account_id,
            store_path.display()
        );
        let client = self.build_client(auth, &store_path).await?;

        let session = MatrixSession {
            meta: SessionMeta {
                user_id,
                device_id: device_id.into(),
            },
            tokens: SessionTokens {
                access_token: auth.access_token.clone(),
                refresh_token: None,
            },
        };
        client.restore_session(session).await?;

        info!(
            "[{}] matrix client created for {} on {}",
            account_id, auth.user_id, auth.homeserver
        );
        Ok(SdkConnection::new(
            client,
            account_id,
            auth.initial_sync_limit,
        ))
    }
}

/// A `matrix_sdk` client and its sync task.
pub struct SdkConnection {
    /// Underlying Matrix SDK client
    client: Client,
    /// Account the client belongs to
    account_id: String,
    /// Timeline limit of the syncs
    initial_sync_limit: Option<u32>,
    /// Background sync loop, once started
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl SdkConnection {
    fn new(client: Client, account_id: &str, initial_sync_limit: Option<u32>) -> Self {
        SdkConnection {
            client,
            account_id: account_id.to_owned(),
            initial_sync_limit,
            sync_task: Mutex::new(None),
        }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether the sync loop is running.
    pub fn is_syncing(&self) -> bool {
        self.sync_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[async_trait]
impl MatrixConnection for SdkConnection {
    async fn start(&self) -> anyhow::Result<()> {
        if self.is_syncing() {
            debug!("[{}] already syncing", self.account_id);
            return Ok(());
        }

        let task = MatrixSync::new(&self.client, &self.account_id, self.initial_sync_limit)
            .start()
            .await?;
        let previous = self.sync_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.abort();
            info!("[{}] sync stopped", self.account_id);
        }
        Ok(())
    }

    /// Reads the rooms from the sqlite store, so a store that never synced
    /// yields none and member tracking happens lazily during sync.
    async fn joined_rooms(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .client
            .joined_rooms()
            .iter()
            .map(|room| room.room_id().to_string())
            .collect())
    }

    async fn prepare_crypto(&self, room_ids: &[String]) -> anyhow::Result<()> {
        prepare_crypto(&self.client, &self.account_id, room_ids).await
    }
}
