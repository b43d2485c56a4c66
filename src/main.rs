//! # Bundle Control Plane
//!
//! A control plane that continuously builds policy bundles and publishes
//! them to object storage:
//!
//! 1. **Sources** - policy and data pulled from Git repositories, HTTP
//!    datasources and content pushed through the management API
//! 2. **Bundles** - composed per bundle spec: transitive requirements,
//!    include/exclude filters, namespace mounts, conflict detection
//! 3. **Publishing** - OPA bundle archives uploaded with sha256/revision
//!    metadata
//! 4. **Management API** - multi-tenant CRUD over bundles, sources, stacks
//!    and secrets, authorized row-by-row in SQL

use anyhow::Result;
use clap::Parser;
use tracing::info;

use bundle_control_plane::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bundle_control_plane=info".into()),
        )
        .init();

    info!(
        "Starting bundle-control-plane {} (build {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_HASH"),
    );

    let cli = Cli::parse();
    cli::run(cli.command).await
}
