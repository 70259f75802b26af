//! Stored Matrix credentials.
//!
//! This module provides the [`CredentialStore`] which persists the access token
//! obtained by a password login so the next start can skip the login. Each
//! account has its own JSON file under the state directory:
//!
//! - default account: `<state>/credentials/matrix/credentials.json`
//! - named account: `<state>/credentials/matrix/<account>/credentials.json`
//!
//! The default account keeps the shared path for compatibility with single
//! account setups. Writes are plain read-then-write without locking, the last
//! writer wins.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    accounts::{DEFAULT_ACCOUNT_ID, normalize_account_id},
    utils::{get_path, sanitize_path_segment},
};

const CREDENTIALS_FILENAME: &str = "credentials.json";

/// Credentials persisted on disk for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredentials {
    /// Homeserver the token was issued by
    pub homeserver: String,
    /// User id owning the token. Empty for token-only records.
    #[serde(default)]
    pub user_id: String,
    /// Access token
    pub access_token: String,
    /// Device id bound to the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// First time the record was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last time the record was written or used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Credentials to save, without the timestamps managed by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCredentials {
    pub homeserver: String,
    pub user_id: String,
    pub access_token: String,
    pub device_id: Option<String>,
}

impl StoredCredentials {
    /// Checks whether this record belongs to the given homeserver and user.
    ///
    /// When either side has no user id (token-based auth), only the
    /// homeserver is compared. Trailing slashes of the homeserver URLs are
    /// ignored.
    pub fn matches(&self, homeserver: &str, user_id: &str) -> bool {
        let same_homeserver =
            self.homeserver.trim_end_matches('/') == homeserver.trim_end_matches('/');
        same_homeserver
            && (self.user_id.is_empty() || user_id.is_empty() || self.user_id == user_id)
    }
}

/// Reads and writes per-account credential files.
///
/// Every read failure (missing file, unreadable file, invalid JSON, missing
/// field) is reported as "no credentials".
///
/// # Examples
///
/// ```no_run
/// use multi_matrix::credentials::{CredentialStore, NewCredentials};
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = CredentialStore::new("./state");
/// store
///     .save(
///         NewCredentials {
///             homeserver: "https://matrix.org".to_string(),
///             user_id: "@bot:matrix.org".to_string(),
///             access_token: "syt_token".to_string(),
///             device_id: Some("DEVICE".to_string()),
///         },
///         Some("work"),
///     )
///     .await?;
/// assert!(store.load(Some("work")).await.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CredentialStore {
    /// State directory, root of the `credentials/matrix` tree.
    state_dir: PathBuf,
}

impl CredentialStore {
    /// Creates a store rooted at `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        CredentialStore {
            state_dir: state_dir.into(),
        }
    }

    /// Returns the state directory.
    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// Directory holding the credential file of an account.
    pub fn credentials_dir(&self, account_id: Option<&str>) -> PathBuf {
        let base = get_path(&self.state_dir, &["credentials", "matrix"]);
        let account_id = normalize_account_id(account_id);
        if account_id == DEFAULT_ACCOUNT_ID {
            return base;
        }
        base.join(sanitize_path_segment(&account_id))
    }

    /// Path of the credential file of an account.
    pub fn credentials_path(&self, account_id: Option<&str>) -> PathBuf {
        self.credentials_dir(account_id).join(CREDENTIALS_FILENAME)
    }

    /// Loads the stored credentials of an account.
    pub async fn load(&self, account_id: Option<&str>) -> Option<StoredCredentials> {
        let path = self.credentials_path(account_id);

        let Ok(serialized) = fs::read_to_string(&path).await else {
            trace!("no stored credentials at {}", path.display());
            return None;
        };

        match serde_json::from_str(&serialized) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!("ignoring invalid credentials file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Saves credentials for an account.
    ///
    /// `created_at` is kept from the existing record when there is one and
    /// `last_used_at` is set to now.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be
    /// written.
    pub async fn save(
        &self,
        credentials: NewCredentials,
        account_id: Option<&str>,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(self.credentials_dir(account_id)).await?;

        let now = Utc::now();
        let created_at = self
            .load(account_id)
            .await
            .and_then(|existing| existing.created_at)
            .unwrap_or(now);

        let record = StoredCredentials {
            homeserver: credentials.homeserver,
            user_id: credentials.user_id,
            access_token: credentials.access_token,
            device_id: credentials.device_id,
            created_at: Some(created_at),
            last_used_at: Some(now),
        };

        self.write(&record, account_id).await?;
        debug!("saved credentials for {}", record.user_id);
        Ok(())
    }

    /// Updates `last_used_at` of an existing record. No-op without a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn touch(&self, account_id: Option<&str>) -> anyhow::Result<()> {
        let Some(mut existing) = self.load(account_id).await else {
            return Ok(());
        };

        existing.last_used_at = Some(Utc::now());
        self.write(&existing, account_id).await
    }

    /// Deletes the credential file of an account. Failures are ignored.
    pub async fn clear(&self, account_id: Option<&str>) {
        let path = self.credentials_path(account_id);
        match fs::remove_file(&path).await {
            Ok(()) => debug!("cleared credentials at {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to clear credentials at {}: {}", path.display(), e),
        }
    }

    async fn write(
        &self,
        record: &StoredCredentials,
        account_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let serialized = serde_json::to_string_pretty(record)?;
        fs::write(self.credentials_path(account_id), serialized).await?;
        Ok(())
    }
}
