//! graph-sync - incremental target sync for Bazel-like workspaces

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "graph_sync=debug,convenient_sync=debug,convenient_graph=debug,convenient_storage=debug"
    } else {
        "graph_sync=info,convenient_sync=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Sync(args) => {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            let _ = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling sync pass");
                    trigger.cancel();
                }
            });
            let report = commands::sync::run(&cli.store, &args, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Affected(args) => {
            for path in commands::affected::run(&cli.store, &args)? {
                println!("{path}");
            }
        }
        Commands::Diff(args) => {
            let diff = commands::diff::run(&cli.store, &args)?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
    }

    Ok(())
}
