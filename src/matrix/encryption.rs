//! End-to-end encryption preparation.
//!
//! Before an encrypting client starts, its cross-signing keys are bootstrapped
//! when missing and the member lists of its joined rooms are synced so room
//! keys can be shared with every member's devices.

use anyhow::Result;
use log::{debug, warn};
use matrix_sdk::{
    Client,
    encryption::{BackupDownloadStrategy, EncryptionSettings},
    ruma::RoomId,
};

/// Encryption settings of clients built with encryption enabled.
pub fn encryption_settings() -> EncryptionSettings {
    // Enable key backup and cross signing by default
    EncryptionSettings {
        auto_enable_cross_signing: true,
        backup_download_strategy: BackupDownloadStrategy::default(),
        auto_enable_backups: true,
    }
}

/// Bootstraps cross-signing for the Matrix client if not already configured.
///
/// See <https://docs.rs/matrix-sdk/latest/matrix_sdk/encryption/struct.Encryption.html#method.bootstrap_cross_signing_if_needed>
///
/// Clients authenticated with an access token have no password to answer an
/// interactive authentication request with, so that case is logged and
/// skipped.
///
/// # Errors
///
/// Returns an error if the bootstrap fails for another reason.
async fn bootstrap_cross_signing(client: &Client, account_id: &str) -> Result<()> {
    debug!("[{}] setting up cross signing", account_id);

    match client
        .encryption()
        .bootstrap_cross_signing_if_needed(None)
        .await
    {
        Ok(()) => debug!("[{}] cross signing ready", account_id),
        Err(e) if e.as_uiaa_response().is_some() => warn!(
            "[{}] cross signing requires interactive authentication, skipping",
            account_id
        ),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Prepares encryption for the given joined rooms.
///
/// # Arguments
///
/// * `client` - The Matrix client
/// * `account_id` - Account the client belongs to, used in logs
/// * `room_ids` - Rooms whose member lists are synced
///
/// # Errors
///
/// Returns an error if cross-signing cannot be bootstrapped, a room id is
/// invalid or a member sync fails.
pub async fn prepare_crypto(client: &Client, account_id: &str, room_ids: &[String]) -> Result<()> {
    debug!(
        "[{}] preparing crypto for {} joined rooms",
        account_id,
        room_ids.len()
    );

    bootstrap_cross_signing(client, account_id).await?;

    for room_id in room_ids {
        let room_id = RoomId::parse(room_id)?;
        match client.get_room(&room_id) {
            Some(room) => room.sync_members().await?,
            None => debug!("[{}] room {} is not known yet", account_id, room_id),
        }
    }

    debug!("[{}] crypto ready", account_id);
    Ok(())
}
