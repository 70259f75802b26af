//! multi-matrix - run several Matrix accounts from one process.
//!
//! # Configuration
//!
//! Create a `config.yaml` file with your accounts:
//!
//! ```yaml
//! channels:
//!   matrix:
//!     homeserver: "https://matrix.org"
//!     encryption: true
//!     accounts:
//!       work:
//!         user_id: "@work-bot:matrix.org"
//!         password: "your-password"
//!       home:
//!         homeserver: "https://matrix.example.org"
//!         access_token: "syt_..."
//! ```
//!
//! Settings at the `channels.matrix` level apply to every account unless the
//! account overrides them.
//!
//! # Environment Variable Overrides
//!
//! Override any configuration value using environment variables with the
//! `MULTI_MATRIX_` prefix, or provide credentials per account:
//!
//! ```bash
//! export MULTI_MATRIX_CHANNELS__MATRIX__HOMESERVER="https://matrix.org"
//! export MATRIX_WORK_PASSWORD="your-password"
//! export MATRIX_ACCESS_TOKEN="syt_..."   # default account
//! ```
//!
//! # Usage
//!
//! ```bash
//! multi-matrix --config config.yaml --data ./state accounts
//! multi-matrix --config config.yaml --data ./state run
//! multi-matrix --config config.yaml --data ./state logout --account work
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`)

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};

use multi_matrix::{
    config::Config,
    homeserver::HttpHomeserver,
    matrix::SdkClientFactory,
    plugin::{AccountStatus, MatrixChannel, StaticRuntime},
    utils::EnvVars,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: String,

    /// Path to the state directory.
    ///
    /// This directory will contain:
    /// - `credentials/matrix/` - stored access tokens, one file per account
    /// - `matrix/accounts/` - client stores (sync state, encryption keys)
    ///
    /// Its content allows impersonating the accounts: restrict its permissions.
    #[arg(short, long)]
    data: PathBuf,

    /// Timeout in seconds applied to client creation and start.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the configured accounts.
    Accounts,
    /// Start every enabled account and run until interrupted.
    Run,
    /// Forget the stored credentials of an account.
    Logout {
        /// Account to log out, the default account when omitted
        #[arg(short, long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config file: {}", e);
            return;
        }
    };

    let channel = MatrixChannel::register(
        &StaticRuntime::new(Some(args.data.clone())),
        EnvVars::from_process(),
        SdkClientFactory::new(&args.data),
        HttpHomeserver::new(),
    );

    match args.command {
        Command::Accounts => {
            for account in channel.accounts().list_enabled_accounts(&config).await {
                println!(
                    "{}\t{}\tconfigured={}\t{}",
                    account.account_id,
                    account.name.as_deref().unwrap_or("-"),
                    account.configured,
                    account.homeserver.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Run => {
            info!("starting multi-matrix {}", env!("CARGO_PKG_VERSION"));

            let timeout = Some(Duration::from_secs(args.timeout));
            let statuses = channel.start_enabled_accounts(&config, timeout).await;
            let started = statuses
                .iter()
                .filter(|(_, status)| matches!(status, AccountStatus::Started))
                .count();
            info!("{}/{} accounts started", started, statuses.len());

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutting down");
            channel.unregister().await;
        }
        Command::Logout { account } => {
            channel.auth().store().clear(account.as_deref()).await;
            info!(
                "cleared stored credentials of {}",
                account.as_deref().unwrap_or("default")
            );
        }
    }
}
