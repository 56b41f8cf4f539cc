mod config;
mod setup;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use setup::{ensure_database_directory, initialize_app};
use telemetry::{init_telemetry, log_config_validation, log_startup_info};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "synapse-mcp")]
#[command(about = "Multi-agent task dispatch server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Start the dispatch server
    #[arg(long)]
    start: bool,

    /// Port to listen on
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Store URL override
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address override (default: 127.0.0.1)
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Log level override
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Admin token for the admin/review surface
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(config_file) => {
            info!(file = %config_file, "Loading configuration from file");
            Config::from_file(config_file)?
        }
        None => Config::from_env()?,
    };

    if let Some(ref database_url) = cli.database_url {
        config.database.url = Some(database_url.clone());
    }
    if let Some(ref listen_addr) = cli.listen_addr {
        config.server.listen_addr = listen_addr.clone();
    }
    config.server.port = cli.port;
    if let Some(ref log_level) = cli.log_level {
        config.logging.level = log_level.clone();
    }
    if let Some(ref admin_token) = cli.admin_token {
        config.server.admin_token = Some(admin_token.clone());
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if !cli.start {
        println!("synapse-mcp - multi-agent task dispatch server");
        println!();
        println!("Usage:");
        println!("  synapse-mcp --start --port=3000 --database-url=sqlite:///path/to/store.sqlite");
        println!();
        println!("This will:");
        println!("  - start the JSON-RPC dispatch endpoint at /mcp/v1/rpc");
        println!("  - stream queue events over SSE at /mcp/v1");
        println!("  - run the background scheduler (requeue, unblock, assign, reclaim)");
        println!();
        println!("For more options, use: synapse-mcp --help");
        return Ok(());
    }

    let config = load_config(&cli).context("Failed to load configuration")?;

    init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
    log_config_validation(&config);

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    log_startup_info(&config);

    ensure_database_directory(&config.database_url())
        .context("Failed to create database directory")?;

    let (server, scheduler) = initialize_app(&config)
        .await
        .context("Failed to initialize application")?;

    println!("synapse-mcp is ready");
    println!("  listening on: http://{}", config.server_address());
    println!("  store:        {}", config.database_url());
    println!();
    println!("Press Ctrl+C to shutdown");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl+c");
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(());
    });

    let server_addr = config.server_address();
    let result = tokio::select! {
        result = server.serve(&server_addr) => match result {
            Ok(_) => {
                info!("Dispatch server shut down cleanly");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Dispatch server error");
                std::process::exit(3);
            }
        },
        _ = shutdown_rx => {
            info!("Shutdown signal received, stopping server");
            Ok(())
        }
    };

    scheduler.abort();
    result
}
