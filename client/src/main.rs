//! FarmSync CLI - boot the local store and run maintenance commands against it.

use clap::{Parser, Subcommand};
use farmsync_client::{
    Booted, Config, Coordinator, HttpRemoteApi, ManualConnectivity, SyncClient, SyncOutcome,
};
use farmsync_engine::DataExport;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "farmsync", version, about = "Offline-first farm data sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue counts and connectivity
    Status,
    /// Run one sync pass
    Sync,
    /// Write all local data to a JSON file
    Export { path: PathBuf },
    /// Load a JSON export
    Import {
        path: PathBuf,
        /// Drop existing records first
        #[arg(long)]
        clear: bool,
    },
    /// Take a backup now
    Backup,
    /// List backups, newest first
    Backups,
    /// Restore a backup by key
    Restore { key: String },
    /// Retry every failed queue entry under the retry ceiling
    RetryFailed,
    /// Drop queue entries parked at the retry ceiling
    ClearFailed,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farmsync_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let remote = Arc::new(HttpRemoteApi::from_config(&config)?);
    let connectivity = Arc::new(ManualConnectivity::online());

    let booted = Coordinator::new(config, remote, connectivity).boot().await;
    if booted.report.is_degraded() {
        tracing::warn!(report = ?booted.report, "Booted in degraded mode");
    }

    let result = run(cli.command, &booted).await;
    booted.shutdown();
    result
}

async fn run(command: Command, booted: &Booted) -> Result<(), Box<dyn std::error::Error>> {
    let Some(client) = booted.client.as_ref() else {
        print_json(&booted.report)?;
        return Err("local storage is unavailable".into());
    };

    match command {
        Command::Status => print_json(&client.sync_status().await)?,
        Command::Sync => sync(client).await?,
        Command::Export { path } => {
            let data = client.export_data().await?;
            tokio::fs::write(&path, data.to_json_pretty()?).await?;
            tracing::info!(path = %path.display(), "Export written");
        }
        Command::Import { path, clear } => {
            let raw = tokio::fs::read_to_string(&path).await?;
            let data = DataExport::from_json(&raw)?;
            print_json(&client.import_data(&data, clear).await?)?;
        }
        Command::Backup => print_json(&client.create_backup().await?)?,
        Command::Backups => print_json(&client.list_backups().await?)?,
        Command::Restore { key } => print_json(&client.restore_from_backup(&key).await?)?,
        Command::RetryFailed => {
            let requeued = client.retry_failed(None).await?;
            println!("{requeued} entries requeued");
        }
        Command::ClearFailed => {
            let cleared = client.clear_failed().await?;
            println!("{cleared} entries cleared");
        }
    }

    Ok(())
}

async fn sync(client: &SyncClient) -> Result<(), Box<dyn std::error::Error>> {
    match client.trigger_sync().await? {
        SyncOutcome::Completed(summary) => print_json(&summary)?,
        SyncOutcome::AlreadyInProgress => println!("A sync pass is already running"),
        SyncOutcome::Offline => println!("Offline; nothing sent"),
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
