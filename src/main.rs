use clap::Parser;
use reasoning_proxy::{build_router, AppState, ProxyConfig, ReasoningFormat, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "reasoning-proxy",
    about = "OpenAI-compatible proxy that rewrites upstream reasoning fields",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Upstream base URL, without `/chat/completions` (overrides config)
    #[arg(long, env = "UPSTREAM_BASE_URL")]
    upstream_url: Option<String>,

    /// How to present upstream reasoning: `reasoning_content` or `think_tags`
    #[arg(long, env = "REASONING_FORMAT")]
    reasoning_format: Option<ReasoningFormat>,

    /// Reject `stream: true` requests with 400
    #[arg(long)]
    disable_streaming: bool,

    /// Log file path
    #[arg(long, default_value = "reasoning-proxy.log")]
    log_file: PathBuf,

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
                .unwrap_or_else(|_| "reasoning_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        println!("  1. reasoning-proxy.toml (current directory)");
        if cfg!(target_os = "macos") {
            println!("  2. ~/Library/Application Support/reasoning-proxy/config.toml");
        } else {
            println!("  2. $XDG_CONFIG_HOME/reasoning-proxy/config.toml");
            println!("     ~/.config/reasoning-proxy/config.toml");
        }
        println!("  3. ~/.reasoning-proxy.toml");
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.upstream_url {
        config.upstream.base_url = Some(url);
    }
    if let Some(format) = cli.reasoning_format {
        config.reasoning_format = Some(format);
    }
    if cli.disable_streaming {
        config.stream.enabled = false;
    }

    // Validate config eagerly
    let upstream_url = config.chat_completions_url()?;
    let reasoning_format = config.reasoning_format()?;

    let logger = SharedLogger::new(&cli.log_file)?;

    info!("reasoning-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:   {} ({})", config.upstream.name, upstream_url);
    info!("  Reasoning:  {}", reasoning_format);
    info!(
        "  Streaming:  {}",
        if config.stream.enabled { "enabled" } else { "disabled" }
    );
    match config.idle_timeout() {
        Some(limit) => info!("  Idle limit: {}s", limit.as_secs()),
        None => info!("  Idle limit: none"),
    }
    info!("  Port:       {}", config.port);
    info!("  Log file:   {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting reasoning-proxy upstream={} reasoning_format={} port={}",
            upstream_url, reasoning_format, config.port
        ),
    );

    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()?;

    let state = Arc::new(AppState {
        config: config.clone(),
        client,
        logger,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
