//! Matrix protocol integration.
//!
//! This module defines the seam between the client registry and the Matrix
//! client library:
//! - [`ClientFactory`] builds one connection per account from its
//!   authentication material
//! - [`MatrixConnection`] is the lifecycle surface the registry drives
//!
//! # Architecture
//!
//! The production implementation, [`SdkClientFactory`], is built on
//! `matrix_sdk` and coordinates:
//! - **Client**: per-account sqlite store and session restoration via the
//!   client submodule
//! - **Encryption**: cross-signing and room member tracking via the
//!   encryption submodule
//! - **Sync**: initial sync and the background sync loop via the sync
//!   submodule
//!
//! # Examples
//!
//! ```no_run
//! use multi_matrix::{
//!     auth::MatrixAuth,
//!     matrix::{ClientFactory, MatrixConnection, SdkClientFactory},
//! };
//!
//! # async fn example(auth: MatrixAuth) -> anyhow::Result<()> {
//! let factory = SdkClientFactory::new("./state");
//! let connection = factory.create(&auth, "work").await?;
//! connection.start().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod encryption;
mod sync;

use async_trait::async_trait;
use mockall::automock;

pub use crate::matrix::client::{SdkClientFactory, SdkConnection};
use crate::auth::MatrixAuth;

/// A connection to a homeserver for one account.
///
/// All methods may suspend. The registry guarantees that `start` is never
/// called concurrently for the same connection.
#[automock]
#[async_trait]
pub trait MatrixConnection: Send + Sync + 'static {
    /// Starts syncing with the homeserver.
    async fn start(&self) -> anyhow::Result<()>;
    /// Stops syncing and releases the connection.
    async fn stop(&self) -> anyhow::Result<()>;
    /// Lists the ids of the joined rooms known locally.
    ///
    /// Before the first sync of a fresh store this is empty. Members of rooms
    /// joined later are tracked by the client as the sync delivers them.
    async fn joined_rooms(&self) -> anyhow::Result<Vec<String>>;
    /// Prepares end-to-end encryption for the given rooms.
    async fn prepare_crypto(&self, room_ids: &[String]) -> anyhow::Result<()>;
}

/// Builds [`MatrixConnection`]s.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Connection type produced by this factory
    type Connection: MatrixConnection;

    /// Builds an unstarted connection for `account_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed or the session
    /// cannot be restored.
    async fn create(
        &self,
        auth: &MatrixAuth,
        account_id: &str,
    ) -> anyhow::Result<Self::Connection>;
}
