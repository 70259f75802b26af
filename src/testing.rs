//! In-memory connections and factories for tests.

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    auth::MatrixAuth,
    matrix::{ClientFactory, MatrixConnection},
};

/// Connection counting its lifecycle calls.
#[derive(Debug, Default)]
pub struct FakeConnection {
    pub account_id: String,
    pub access_token: String,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub start_delay: Duration,
    pub crypto_delay: Duration,
    /// Number of upcoming `start` calls that fail
    pub failing_starts: AtomicUsize,
    /// Set by a successful `start`, cleared by `stop`
    pub running: AtomicBool,
}

impl FakeConnection {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatrixConnection for FakeConnection {
    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            bail!("sync failed");
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn joined_rooms(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn prepare_crypto(&self, _room_ids: &[String]) -> anyhow::Result<()> {
        tokio::time::sleep(self.crypto_delay).await;
        Ok(())
    }
}

type Build<C> = Box<dyn Fn(&MatrixAuth, &str) -> C + Send + Sync>;

/// Factory building connections through a closure.
pub struct FakeFactory<C> {
    build: Build<C>,
    pub created: AtomicUsize,
    pub create_delay: Duration,
    /// Fail the next `create` call
    pub fail_next: AtomicBool,
    /// Accounts passed to `create`, in call order
    pub accounts: Mutex<Vec<String>>,
}

impl<C> FakeFactory<C> {
    pub fn new(build: impl Fn(&MatrixAuth, &str) -> C + Send + Sync + 'static) -> Self {
        FakeFactory {
            build: Box::new(build),
            created: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
            accounts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, create_delay: Duration) -> Self {
        self.create_delay = create_delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl FakeFactory<FakeConnection> {
    /// Factory of [`FakeConnection`]s starting after `start_delay`.
    pub fn fake(start_delay: Duration) -> Self {
        FakeFactory::new(move |auth, account_id| FakeConnection {
            account_id: account_id.to_owned(),
            access_token: auth.access_token.clone(),
            start_delay,
            ..Default::default()
        })
    }
}

#[async_trait]
impl<C: MatrixConnection> ClientFactory for FakeFactory<C> {
    type Connection = C;

    async fn create(&self, auth: &MatrixAuth, account_id: &str) -> anyhow::Result<C> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.accounts.lock().push(account_id.to_owned());
        tokio::time::sleep(self.create_delay).await;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("homeserver unreachable");
        }
        Ok((self.build)(auth, account_id))
    }
}

/// Authentication material for tests.
pub fn auth(access_token: &str) -> MatrixAuth {
    MatrixAuth {
        homeserver: "https://matrix.example.org".to_string(),
        user_id: "@bot:example.org".to_string(),
        access_token: access_token.to_string(),
        device_id: Some("DEVICE".to_string()),
        encryption: false,
        initial_sync_limit: None,
    }
}
