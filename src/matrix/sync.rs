//! Matrix client synchronization.
//!
//! This module provides the [`MatrixSync`] struct which performs the initial
//! sync of an account and then keeps it synchronized from a background task.
//!
//! # Overview
//!
//! The [`MatrixSync::start`] method:
//! 1. Performs an initial lazy-loading sync, optionally limiting the timeline
//! 2. Spawns the continuous sync loop, resuming from the initial sync token
//! 3. Returns the handle of the spawned loop so it can be aborted

use anyhow::Result;
use log::{error, info};
use matrix_sdk::{
    Client,
    config::SyncSettings,
    ruma::{UInt, api::client::filter::FilterDefinition},
};
use tokio::task::JoinHandle;

/// Runs the synchronization of one account.
pub struct MatrixSync {
    /// The matrix client
    client: Client,
    /// Account the client belongs to, used in logs
    account_id: String,
    /// Timeline limit applied to the syncs
    initial_sync_limit: Option<u32>,
}

impl MatrixSync {
    /// Creates a new MatrixSync instance.
    ///
    /// This does not start the synchronization process; call
    /// [`MatrixSync::start`] to begin syncing.
    pub fn new(client: &Client, account_id: &str, initial_sync_limit: Option<u32>) -> Self {
        MatrixSync {
            client: client.to_owned(),
            account_id: account_id.to_owned(),
            initial_sync_limit,
        }
    }

    /// Builds the sync settings: lazy-loaded members and the timeline limit.
    fn sync_settings(&self) -> SyncSettings {
        // Enable room members lazy-loading
        // See <https://spec.matrix.org/v1.6/client-server-api/#lazy-loading-room-members>.
        let mut filter = FilterDefinition::with_lazy_loading();
        if let Some(limit) = self.initial_sync_limit {
            filter.room.timeline.limit = Some(UInt::from(limit));
        }
        SyncSettings::default().filter(filter.into())
    }

    /// Performs the initial sync and spawns the sync loop.
    ///
    /// # Returns
    ///
    /// The handle of the background sync task. Aborting it stops the sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial sync fails. Errors of the background
    /// loop are logged.
    pub async fn start(self) -> Result<JoinHandle<()>> {
        info!("[{}] start syncing", self.account_id);

        let sync_settings = self.sync_settings();
        let response = self.client.sync_once(sync_settings.clone()).await?;
        info!("[{}] initial sync done", self.account_id);

        // Since we called `sync_once` before we entered our sync loop we must pass
        // that sync token to `sync`
        let sync_settings = sync_settings.token(response.next_batch);

        let handle = tokio::spawn(async move {
            match self.client.sync(sync_settings).await {
                Ok(()) => info!("[{}] matrix sync ended successfully", self.account_id),
                Err(e) => error!("[{}] matrix sync ended with error: {:?}", self.account_id, e),
            }
        });

        Ok(handle)
    }
}
