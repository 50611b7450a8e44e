use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaygate::config::Config;
use relaygate::llm::ProviderRegistry;
use relaygate::server::{self, AppState};

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(about = "Streaming gateway for chat-completion providers", version)]
struct Args {
    /// Path to the gateway config file
    #[arg(short, long, env = "RELAYGATE_CONFIG", default_value = "relaygate.yaml")]
    config: PathBuf,

    /// Path to the provider catalog (overrides `providers_path` in the config)
    #[arg(long, env = "PROVIDERS_CFG")]
    providers: Option<PathBuf>,

    /// Listen address (overrides the configured host and port)
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    #[arg(long, value_enum, env = "RELAYGATE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = Config::load(&args.config)
        .await
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let providers_path = args.providers.unwrap_or_else(|| config.providers_path.clone());
    let registry = ProviderRegistry::load(&providers_path).await.with_context(|| {
        format!(
            "failed to load provider catalog from {}",
            providers_path.display()
        )
    })?;
    info!(
        providers = registry.len(),
        catalog = %providers_path.display(),
        "Loaded provider catalog"
    );

    let state = AppState::new(&config, registry);
    let middleware = state.middleware.clone();
    let app = server::build_app(state, &config.server);

    let addr = args.addr.unwrap_or_else(|| config.server.addr());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "Starting relaygate");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal(middleware))
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
