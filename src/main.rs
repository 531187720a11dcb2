use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use unigate::accounts::ProviderGroup;
use unigate::config::config_search_paths;
use unigate::{build_router, upstream_client, AppState, GatewayConfig, SharedLogger};

#[derive(Parser)]
#[command(
    name = "unigate",
    about = "Serve OpenAI, Claude and Gemini clients from a rotating pool of OAuth accounts",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Directory holding account credential files (overrides config)
    #[arg(long)]
    auth_dir: Option<PathBuf>,

    /// Log file path (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Start an OAuth flow for a provider (claude or gemini) and print its URL
    #[arg(long, value_name = "PROVIDER")]
    add: Option<String>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unigate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(dir) = cli.auth_dir {
        config.auth_dir = dir;
    }
    if let Some(path) = cli.log_file {
        config.log_file = path;
    }

    let logger = SharedLogger::new(&config.log_file)?;

    let client = upstream_client(&config)?;

    let state = Arc::new(AppState::build(config.clone(), client, logger.clone()));
    let loaded = state.store.load().await?;

    info!("unigate v{}", env!("CARGO_PKG_VERSION"));
    info!("  Listen:    {}:{}", config.host, config.port);
    info!("  Auth dir:  {}", config.auth_dir.display());
    info!(
        "  Accounts:  {} claude, {} gemini",
        state.store.pools().get(ProviderGroup::Claude).len(),
        state.store.pools().get(ProviderGroup::Gemini).len()
    );
    info!(
        "  API keys:  {}",
        if config.api_keys.is_empty() {
            "none (open access)".to_string()
        } else {
            format!("{} configured", config.api_keys.len())
        }
    );
    info!("  Log file:  {}", config.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting unigate on {}:{} with {} accounts",
            config.host, config.port, loaded
        ),
    );

    if let Some(provider) = cli.add.as_deref() {
        let group: ProviderGroup = provider.parse()?;
        let started = state.oauth.start(group)?;
        info!("");
        info!("  Open this URL to add a {} account:", group);
        info!("    {}", started.auth_url);
        info!("");
    }

    let app = build_router(Arc::clone(&state));
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
