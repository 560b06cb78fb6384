//! modelgridd — the ModelGrid daemon.
//!
//! Loads `modelgrid.toml`, assembles the container and session coordinators
//! plus the optional scheduled-job and monitoring backends, and serves the
//! deployment API.
//!
//! # Usage
//!
//! ```text
//! modelgridd serve --config /etc/modelgrid/modelgrid.toml
//! modelgridd check-config --config modelgrid.toml
//! ```

mod assemble;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use modelgrid_core::CoordinatorConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,modelgridd=debug,modelgrid=debug";

#[derive(Parser)]
#[command(name = "modelgridd", about = "ModelGrid deployment coordinator")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the deployment API.
    Serve {
        /// Configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.bind`.
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::from_file(path),
        None => {
            warn!("no --config given, using defaults");
            Ok(CoordinatorConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config, bind } => {
            let config = load_config(config.as_deref())?;
            serve(config, bind).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn serve(config: CoordinatorConfig, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    info!(prefix = %config.prefix, "ModelGrid daemon starting");

    let addr = match bind {
        Some(addr) => addr,
        None => {
            let bind = &config.server.bind;
            bind.parse()
                .with_context(|| format!("server.bind {bind:?} is not a socket address"))?
        }
    };

    let state = assemble::build_system_state(&config);
    let router = modelgrid_api::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    // Open requests are drained, so their workflows reach a terminal phase.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("ModelGrid daemon stopped");
    Ok(())
}
