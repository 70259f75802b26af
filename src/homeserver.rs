//! HTTP client for the Matrix client-server authentication endpoints.
//!
//! This module provides the [`HttpHomeserver`] struct which performs the two
//! calls needed before a client can be built: resolving the owner of an access
//! token (`whoami`) and logging in with a password.

use async_trait::async_trait;
use log::{debug, info};
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Identity behind an access token.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WhoAmI {
    /// Owner of the token
    pub user_id: String,
    /// Device bound to the token, absent for appservice tokens
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Password login request.
#[derive(Debug, Clone, PartialEq)]
pub struct PasswordLogin {
    pub homeserver: String,
    pub user_id: String,
    pub password: String,
    /// Display name of the device created by the login
    pub device_name: Option<String>,
}

/// Successful login response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    pub device_id: String,
}

/// Trait for the authentication calls made to a homeserver.
///
/// This trait abstracts the HTTP operations for easier testing with mocks.
#[automock]
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Resolves the user and device owning `access_token`.
    async fn whoami(&self, homeserver: &str, access_token: &str) -> anyhow::Result<WhoAmI>;
    /// Logs in with a user id and password.
    async fn login_password(&self, request: &PasswordLogin) -> anyhow::Result<LoginResponse>;
}

/// [`Homeserver`] implementation talking to the real client-server API.
///
/// # Examples
///
/// ```no_run
/// use multi_matrix::homeserver::{Homeserver, HttpHomeserver};
///
/// # async fn example() -> anyhow::Result<()> {
/// let homeserver = HttpHomeserver::new();
/// let whoami = homeserver.whoami("https://matrix.org", "syt_token").await?;
/// println!("token belongs to {}", whoami.user_id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct HttpHomeserver {
    /// HTTP client
    client: Client,
}

impl HttpHomeserver {
    /// Create a new [HttpHomeserver].
    pub fn new() -> Self {
        HttpHomeserver {
            client: Client::new(),
        }
    }
}

/// Builds a client-server API URL, tolerating a trailing slash on the base.
fn endpoint(homeserver: &str, path: &str) -> String {
    format!(
        "{}/_matrix/client/v3/{}",
        homeserver.trim_end_matches('/'),
        path
    )
}

#[async_trait]
impl Homeserver for HttpHomeserver {
    /// Request `GET /_matrix/client/v3/account/whoami` with the token as bearer.
    async fn whoami(&self, homeserver: &str, access_token: &str) -> anyhow::Result<WhoAmI> {
        debug!("requesting whoami on {}", homeserver);

        let whoami = self
            .client
            .get(endpoint(homeserver, "account/whoami"))
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json::<WhoAmI>()
            .await?;

        debug!("token belongs to {}", whoami.user_id);
        Ok(whoami)
    }

    /// Request `POST /_matrix/client/v3/login` with an `m.login.password` body.
    async fn login_password(&self, request: &PasswordLogin) -> anyhow::Result<LoginResponse> {
        info!(
            "logging in as {} on {}",
            request.user_id, request.homeserver
        );

        let mut body = json!({
            "type": "m.login.password",
            "identifier": {
                "type": "m.id.user",
                "user": request.user_id,
            },
            "password": request.password,
        });
        if let Some(device_name) = &request.device_name {
            body["initial_device_display_name"] = json!(device_name);
        }

        let response = self
            .client
            .post(endpoint(&request.homeserver, "login"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<LoginResponse>()
            .await?;

        info!("logged in as {} ({})", response.user_id, response.device_id);
        Ok(response)
    }
}
