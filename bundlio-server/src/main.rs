mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::{run_reconcile_once, run_server};

#[derive(Parser)]
#[command(name = "bundlio")]
#[command(about = "Aggregates content pieces into storage deals and tracks them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and the queue workers
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Run a single deal reconciliation against the oracle, then exit
    Reconcile {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bundlio=info,bundlio_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Bundlio server with config: {}", config);

            let cfg = load_config(&config);
            tracing::info!(
                "Bind: {}, Backend: {}, Namespace: {}",
                cfg.bind_addr,
                cfg.storage.backend.as_str(),
                cfg.storage.namespace_or_default()
            );

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Reconcile { config } => {
            let cfg = load_config(&config);
            run_reconcile_once(cfg)
                .await
                .map_err(|e| anyhow::anyhow!("reconciliation failed: {}", e))?;
        }
    }

    Ok(())
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}
