use clap::Parser;
use crawl_core::{setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;
    info!("Starting crawl-core v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    info!("shutting down...");
    if let Err(err) = cli_runner.crawler.persist_session_pool_state().await {
        error!("failed to persist session pool state on shutdown: {err}");
    }
    cli_runner.crawler.session_pool.teardown().await;

    if let Err(e) = result {
        error!("application error: {e}");
        std::process::exit(91);
    }

    info!("crawl-core stopped");
    Ok(())
}

async fn load_config(args: &crawl_core::Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&content)?
    } else {
        Config::from_env()
    };

    if let Some(dir) = &args.local_storage_dir {
        config.local_storage_dir = Some(dir.clone());
    }

    validate_config(&config)?;

    info!("configuration loaded successfully");
    info!("default request queue id: {}", config.default_request_queue_id);
    info!("session pool max size: {}", config.session_pool.max_pool_size);

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.session_pool.max_pool_size == 0 {
        return Err("session pool max size must be greater than 0".into());
    }
    if config.autoscaled_pool.min_concurrency == 0 {
        return Err("autoscaled pool min concurrency must be greater than 0".into());
    }
    if config.autoscaled_pool.max_concurrency < config.autoscaled_pool.min_concurrency {
        return Err("autoscaled pool max concurrency must be >= min concurrency".into());
    }
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
