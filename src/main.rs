use std::{sync::Arc, time::Duration};

use agency::Agency;
use anyhow::Context;
use clap::Parser;
use config::{AgencyArgs, Cli, Command, ServeArgs};
use lottery::{Lottery, WinningNumber};
use server::Server;
use storage::FileStore;
use tracing_subscriber::EnvFilter;

mod agency;
mod client;
mod config;
mod lottery;
mod protocol;
mod server;
mod storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // connect tracing to stdout, RUST_LOG takes precedence over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Agency(args) => agency(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let agencies = match args.agencies {
        Some(agencies) => agencies,
        None => server::count_agency_files(&args.data_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to count the agency files in {}",
                    args.data_dir.display()
                )
            })?,
    };
    tracing::info!("expecting {} agencies", agencies);

    let store = Arc::new(FileStore::new(&args.store));
    let lottery = Arc::new(Lottery::new(
        agencies,
        store,
        WinningNumber(args.winning_number),
    ));

    let server = Server::bind(
        args.listen,
        args.backlog,
        lottery,
        Duration::from_secs(args.shutdown_timeout),
    )
    .await
    .with_context(|| format!("failed to listen on {}", args.listen))?;
    tracing::info!("server is listening on: {}", server.local_addr()?);

    server.run(shutdown_signal()).await
}

async fn agency(args: AgencyArgs) -> anyhow::Result<()> {
    let agency = Agency::new(
        args.id.clone(),
        args.server.clone(),
        args.bets_file(),
        args.batch_max_amount,
    );

    tokio::select! {
        result = agency.run() => {
            result.with_context(|| format!("agency {} failed", args.id))?;
        }
        _ = shutdown_signal() => tracing::info!("agency {} received a shutdown signal", args.id),
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(reason) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", reason);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(reason) => {
                tracing::error!("failed to listen for SIGTERM: {}", reason);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
