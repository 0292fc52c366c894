//! certdrive - ACME certificate issuance for configured domains
//!
//! Binds the ACME account and runs one drive cycle per managed domain.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use certdrive::{
    AccountBook, CredentialStore, DriveController, FileCredentialStore, InstantAcmeClient,
    ManagedDomain, WebrootProvisioner,
};

use crate::config::CliConfig;

/// certdrive - keeps ACME certificates for managed domains current
#[derive(Parser, Debug)]
#[command(name = "certdrive")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTDRIVE_CONFIG",
        default_value = "certdrive.toml",
        global = true
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a drive cycle for every configured domain
    Drive {
        /// Only drive the domain with this primary name
        #[arg(long = "domain")]
        domain: Option<String>,
    },
    /// Show stored credentials and their expiry
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Drive { domain } => run_drive(&cli.config, domain.as_deref()).await,
        Commands::Status => show_status(&cli.config),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Seed `domain` with the credentials it last committed, if still valid
fn load_current(store: &dyn CredentialStore, domain: &mut ManagedDomain) {
    let names = domain.names();
    let Some(primary) = names.first() else {
        return;
    };
    match store.load_credentials(primary) {
        Ok(Some(stored)) => match stored.into_credentials(&names, Utc::now()) {
            Ok(credentials) => {
                debug!(domain = %primary, not_after = %credentials.not_after(), "Loaded current credentials");
                domain.credentials = Some(Arc::new(credentials));
            }
            Err(e) => warn!(domain = %primary, error = %e, "Stored credentials are unusable"),
        },
        Ok(None) => {}
        Err(e) => warn!(domain = %primary, error = %e, "Failed to read stored credentials"),
    }
}

async fn run_drive(config_path: &Path, only: Option<&str>) -> Result<()> {
    let config = CliConfig::from_file(config_path)?;
    info!(
        config = %config_path.display(),
        directory = %config.directory_url(),
        "Loaded configuration"
    );

    let store = Arc::new(
        FileCredentialStore::new(&config.storage).context("Failed to open credential store")?,
    );
    let client = Arc::new(InstantAcmeClient::new(config.directory_url()));
    let provisioner = Arc::new(WebrootProvisioner::new(config.webroot.clone()));

    let book = AccountBook::new(client.clone(), store.clone(), config.drive.clone());
    let account = Arc::new(
        book.obtain(&config.account_request())
            .await
            .context("Failed to obtain ACME account")?,
    );

    let mut domains: Vec<ManagedDomain> = config
        .managed_domains()
        .into_iter()
        .filter(|d| only.map_or(true, |name| d.name.eq_ignore_ascii_case(name)))
        .collect();
    if domains.is_empty() {
        bail!("no configured domain matches '{}'", only.unwrap_or_default());
    }
    for domain in &mut domains {
        load_current(store.as_ref(), domain);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling drive cycles");
                cancel.cancel();
            }
        }
    });

    let mut cycles = JoinSet::new();
    for mut domain in domains {
        let controller = DriveController::new(
            client.clone(),
            provisioner.clone(),
            store.clone(),
            config.drive.clone(),
        )
        .with_cancellation(cancel.clone());
        let account = Arc::clone(&account);
        cycles.spawn(async move {
            let result = controller.drive(&mut domain, &account).await;
            (domain, result)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = cycles.join_next().await {
        let (domain, result) = joined.context("Drive task panicked")?;
        match result {
            Ok(credentials) => println!(
                "{}: issued, valid until {}",
                domain.name,
                credentials.not_after()
            ),
            Err(e) => {
                failed += 1;
                let phase = domain
                    .renewal
                    .last_error
                    .as_ref()
                    .map(|last| last.phase.as_str())
                    .unwrap_or("unknown");
                let kept = if domain.credentials.is_some() {
                    ", previous certificate kept"
                } else {
                    ""
                };
                println!(
                    "{}: failed during {} [{}{}]: {}",
                    domain.name,
                    phase,
                    if e.is_retryable() { "retryable" } else { "fatal" },
                    kept,
                    e
                );
            }
        }
    }

    if failed > 0 {
        bail!("{failed} drive cycle(s) failed");
    }
    Ok(())
}

fn show_status(config_path: &Path) -> Result<()> {
    let config = CliConfig::from_file(config_path)?;
    let store =
        FileCredentialStore::new(&config.storage).context("Failed to open credential store")?;

    let domains = store.list_domains().context("Failed to list stored domains")?;
    if domains.is_empty() {
        println!("no stored credentials in {}", config.storage.display());
        return Ok(());
    }

    let now = Utc::now();
    for name in domains {
        match store
            .load_credentials(&name)
            .with_context(|| format!("Failed to read credentials for {name}"))?
        {
            Some(stored) => {
                let days = (stored.meta.not_after - now).num_days();
                println!(
                    "{name}: valid until {} ({days} days), names {}",
                    stored.meta.not_after,
                    stored.meta.names.join(", ")
                );
            }
            None => println!("{name}: no credentials"),
        }
    }
    Ok(())
}
