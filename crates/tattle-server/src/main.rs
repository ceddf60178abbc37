//! `tattle-server` binary: run the ingest endpoint or a forwarding proxy.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tattle_core::config::load_config;
use tattle_server::ingest::{
    self, ServeOptions, DEFAULT_INGEST_PATH, DEFAULT_INGEST_PORT, DEFAULT_MAX_BODY_BYTES,
};
use tattle_server::proxy::{self, DEFAULT_PROXY_PORT};

#[derive(Parser)]
#[command(name = "tattle-server", about = "Local-first telemetry ingest")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest endpoint for the current project.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_INGEST_PORT)]
        port: u16,
        #[arg(long, default_value = DEFAULT_INGEST_PATH)]
        path: String,
        /// Request body cap in bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
        max_body_bytes: usize,
        /// Session identifier advertised in the instance registry.
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Run a standalone forwarding proxy.
    Proxy {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,
        #[arg(long, default_value = DEFAULT_INGEST_PATH)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tattle_server=info,tattle_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let loaded = load_config(&cwd)?;
    tracing::info!(
        root_dir = %loaded.root_dir.display(),
        config = ?loaded.config_path,
        "configuration loaded"
    );

    match cli.command {
        Command::Serve {
            host,
            port,
            path,
            max_body_bytes,
            session_id,
        } => {
            ingest::serve(
                loaded,
                ServeOptions {
                    host,
                    port,
                    path,
                    max_body_bytes,
                    session_id,
                },
            )
            .await
        }
        Command::Proxy { host, port, path } => proxy::serve(loaded, host, port, path).await,
    }
}
