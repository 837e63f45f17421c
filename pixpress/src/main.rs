use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pixpress::api::{ApiServer, ApiServerConfig, AppState};
use pixpress::codec::CodecRegistry;
use pixpress::config::EngineConfig;
use pixpress::engine::{Engine, pool::run_unit_stdio};
use pixpress::logging::{init_logging, init_unit_logging};

/// How long in-flight jobs get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "pixpress", version, about = "Local image compression backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve {
        /// Port to listen on; overrides API_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind; overrides API_BIND_ADDRESS.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Serve codec requests over stdin/stdout. Started by the process pool.
    #[command(hide = true)]
    Unit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve {
        port: None,
        bind: None,
    }) {
        Command::Serve { port, bind } => serve(port, bind).await,
        Command::Unit => unit().await,
    }
}

async fn serve(port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let log_dir = std::env::var("PIXPRESS_LOG_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from);
    let (logging_config, _log_guard) =
        init_logging(log_dir.as_deref()).context("Failed to initialize logging")?;

    let background = CancellationToken::new();
    logging_config.start_retention_cleanup(background.clone());

    let engine_config = EngineConfig::from_env_or_default();
    let registry = Arc::new(CodecRegistry::with_builtin());
    let engine =
        Arc::new(Engine::start(engine_config, registry).context("Failed to start engine")?);

    let mut server_config = ApiServerConfig::from_env_or_default();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(bind) = bind {
        server_config.bind_address = bind;
    }

    let state = AppState::new(engine.clone()).with_logging(logging_config);
    let server = ApiServer::new(server_config, state);
    let server_token = server.cancel_token();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down");
        server_token.cancel();
    });

    let served = server.run().await;

    engine.shutdown(SHUTDOWN_GRACE).await;
    background.cancel();

    served.context("API server failed")
}

async fn unit() -> anyhow::Result<()> {
    init_unit_logging();
    let registry = CodecRegistry::with_builtin();
    tokio::task::spawn_blocking(move || run_unit_stdio(&registry))
        .await
        .context("Unit task panicked")?
        .context("Unit protocol failed")
}
