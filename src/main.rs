use anyhow::Result;
use clap::Parser;
use slow_down::config::Config;
use slow_down::options::SlowDownOptions;
use slow_down::server::Server;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "slow-down", version, about = "Demo server behind the slow-down middleware")]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Redis URL for shared counters (overrides REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// JSON file with the SlowDown section (overrides SLOWDOWN_CONFIG)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.redis_url.is_some() {
        config.redis_url = args.redis_url;
    }
    if args.config.is_some() {
        config.slow_down_config = args.config;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("slow_down={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    let options: SlowDownOptions = config
        .slow_down_options()
        .map_err(|e| anyhow::anyhow!("Failed to load slow-down options: {}", e))?;

    let store = if config.redis_url().is_some() { "redis" } else { "memory" };
    tracing::info!("Starting slow-down service");
    tracing::info!(
        bind_addr = %config.bind_addr,
        store,
        enabled = options.slow_down_enabled,
        delay_after = options.delay_after,
        delay_ms = options.delay,
        "Configuration loaded"
    );

    let slow_down_config = options
        .into_config()
        .map_err(|e| anyhow::anyhow!("Invalid slow-down options: {}", e))?
        .with_on_limit_reached(|request| {
            tracing::warn!(uri = %request.uri, "Client exceeded the slow-down threshold");
        });

    let server = Server::new(config, slow_down_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
