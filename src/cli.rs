//! # CLI
//!
//! Subcommands:
//! - `run` - load config, migrate the database, start workers and the API
//! - `migrate` - apply (or dry-run) pending schema migrations and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::migrations::Migrator;
use crate::server::{start_server, ServerState};
use crate::service::api::{self, ApiState};
use crate::service::Service;
use crate::store::Store;

#[derive(Parser)]
#[command(
    name = "bundle-control-plane",
    version,
    about = "Builds policy bundles from Git/HTTP/database sources and publishes them to object storage"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the control plane service
    Run {
        /// Configuration files, deep-merged in order
        #[arg(short, long = "config", required = true)]
        config: Vec<PathBuf>,
        /// Fail when merged files disagree on a scalar value
        #[arg(long)]
        merge_conflict_fail: bool,
        /// Build every bundle once, then exit
        #[arg(long)]
        single_shot: bool,
    },
    /// Apply database schema migrations
    Migrate {
        /// Configuration files, deep-merged in order
        #[arg(short, long = "config", required = true)]
        config: Vec<PathBuf>,
        /// Fail when merged files disagree on a scalar value
        #[arg(long)]
        merge_conflict_fail: bool,
        /// Report outstanding migrations without applying them
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn run(command: Command) -> Result<()> {
    match command {
        Command::Run {
            config,
            merge_conflict_fail,
            single_shot,
        } => run_service(&config, merge_conflict_fail, single_shot).await,
        Command::Migrate {
            config,
            merge_conflict_fail,
            dry_run,
        } => run_migrate(&config, merge_conflict_fail, dry_run).await,
    }
}

async fn connect(config: &Config) -> Result<(Arc<Store>, Migrator)> {
    let dialect = config.database.dialect()?;
    let store = Arc::new(
        Store::connect(&config.database.url, dialect)
            .await
            .with_context(|| format!("connect to {}", config.database.url))?,
    );
    let migrator = Migrator::new(store.pool().clone(), dialect);
    Ok((store, migrator))
}

async fn run_service(paths: &[PathBuf], merge_conflict_fail: bool, single_shot: bool) -> Result<()> {
    let config = Config::from_files(paths, merge_conflict_fail)?;
    let (store, migrator) = connect(&config).await?;
    migrator.run().await.context("database migration")?;

    crate::observability::metrics::register_metrics()?;

    let service = Service::new(store.clone(), &config.service, single_shot)?;
    service
        .load_config(&config)
        .await
        .context("load configuration into store")?;

    let server_state = ServerState::new();
    server_state
        .is_ready
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let api = api::router(ApiState {
        store,
        service: service.clone(),
    });
    let listen = config.service.listen.clone();
    let server_ready = server_state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_server(&listen, api, server_ready).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("cannot listen for shutdown signals");
            return;
        }
        info!("received shutdown signal, stopping workers");
        let _ = shutdown_tx.send(true);
    });

    service.run(shutdown_rx).await
}

async fn run_migrate(paths: &[PathBuf], merge_conflict_fail: bool, dry_run: bool) -> Result<()> {
    let config = Config::from_files(paths, merge_conflict_fail)?;
    let (_store, migrator) = connect(&config).await?;
    if dry_run {
        let pending = migrator.dry_run().await?;
        if pending.is_empty() {
            info!("database is up to date");
        } else {
            info!("outstanding migrations: {:?}", pending);
        }
        return Ok(());
    }
    migrator.run().await.context("database migration")?;
    info!("migrations applied");
    Ok(())
}
