use clap::{Parser, Subcommand};
use llm_relay::{build_router, AppState, RelayConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-relay",
    about = "Anthropic-compatible API proxy for heterogeneous LLM backends",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy server
    Serve {
        /// Path to the TOML config file (falls back to CONFIG_PATH, then ./config.toml)
        #[arg(env = "CONFIG_PATH")]
        config: Option<PathBuf>,

        /// Log file path
        #[arg(long, default_value = "llm-relay.log")]
        log_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Serve { config, log_file } => serve(config, log_file).await,
    }
}

async fn serve(config_path: Option<PathBuf>, log_file: PathBuf) -> anyhow::Result<()> {
    let config = RelayConfig::find_and_load(config_path.as_deref())?;
    let logger = SharedLogger::new(&log_file)?;

    info!("llm-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("  Providers: {}", config.providers.len());
    for provider in &config.providers {
        info!(
            "    {} ({}) -> {} [{} models]",
            provider.name,
            provider.kind.as_str(),
            provider.base_url,
            provider.models.len()
        );
    }
    info!("  Mappings:  {}", config.mappings.len());
    info!("  Log file:  {}", log_file.display());

    logger.info(
        "startup",
        format!(
            "starting llm-relay providers={} mappings={} port={}",
            config.providers.len(),
            config.mappings.len(),
            config.server.port
        ),
    );

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.server.read_timeout))
        .pool_max_idle_per_host(100)
        .build()?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let state = Arc::new(AppState {
        config,
        client,
        logger,
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining in-flight requests");
}
