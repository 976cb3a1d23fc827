//! signalhouse: a multi-tenant wide-event observability backend.

use clap::Parser;
use observability_deps::tracing::{error, info};
use signalhouse::server;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Server error: {0}")]
    Server(#[from] server::Error),
}

#[derive(Debug, Parser)]
#[clap(
    name = "signalhouse",
    about = "Multi-tenant wide-event observability backend",
    long_about = "Ingests application telemetry, persists every event to a \
    Hive-partitioned columnar store and serves exploratory queries with \
    progressive result streaming.

Configuration can be set with command line flags or the corresponding \
environment variables. If a file named '.env' exists in the current working \
directory, it is sourced before loading the configuration."
)]
struct Cli {
    /// Log filter, e.g. `info` or `signalhouse=debug,warn`.
    #[clap(
        long = "log-filter",
        env = "SIGNALHOUSE_LOG_FILTER",
        default_value = "info"
    )]
    log_filter: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the ingest, query and streaming surfaces in one process.
    Run(server::RunArgs),

    /// Run one compaction pass and exit.
    Compact(server::CompactArgs),
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_filter);

    let outcome = match cli.command {
        Command::Run(args) => server::run(args).await.map_err(Error::from),
        Command::Compact(args) => server::compact(args).await.map_err(Error::from),
    };

    if let Err(e) = outcome {
        error!(%e, "fatal error");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    info!("shutdown complete");
}
