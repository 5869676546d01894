use crate::config::Config;
use crate::crawler::Crawler;
use crate::health::CrawlHealthChecker;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "crawl-core")]
#[command(about = "A restartable, autoscaling web crawl frontier")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Local storage directory override")]
    pub local_storage_dir: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Crawl every URL listed in a file (one per line) to completion
    Run {
        #[arg(short, long, help = "Input file containing URLs, one per line")]
        input: PathBuf,

        #[arg(short, long, help = "Override desired concurrency")]
        concurrency: Option<usize>,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Show queue/session/system health
    Inspect {
        #[arg(long, help = "Show per-dimension system status detail")]
        detailed: bool,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub crawler: Arc<Crawler>,
}

impl CliRunner {
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let crawler = Arc::new(Crawler::new(config.clone())?);
        crawler.restore_session_pool_state().await?;
        Ok(Self { config, crawler })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Run { input, concurrency } => self.run_crawl(input, concurrency).await,
            Commands::Validate { config } => self.validate_config(config).await,
            Commands::Inspect { detailed } => self.show_health(detailed).await,
        }
    }

    pub async fn run_crawl(&self, input: PathBuf, concurrency: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
        let urls = self.read_urls_from_file(&input).await?;
        info!("loaded {} URLs from {}", urls.len(), input.display());

        for url in &urls {
            if let Err(err) = self.crawler.enqueue_url(url).await {
                error!("skipping invalid URL '{url}': {err}");
            }
        }

        if let Some(desired) = concurrency {
            info!("overriding desired concurrency to {desired}");
        }

        self.crawler.start_background_tasks().await;
        self.crawler.clone().run(concurrency).await?;

        info!(
            "crawl finished: {} handled of {} total",
            self.crawler.queue.handled_count(),
            self.crawler.queue.get_info().assumed_total_count
        );

        self.crawler.persist_session_pool_state().await?;
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        println!("Validating configuration: {}", config_path.display());

        let content = fs::read_to_string(&config_path).await?;
        let config: Config = serde_json::from_str(&content)?;

        println!("Configuration is valid:");
        println!("  Default request queue id: {}", config.default_request_queue_id);
        println!("  Local storage dir: {:?}", config.local_storage_dir);
        println!(
            "  Autoscaled pool concurrency: {}..{}",
            config.autoscaled_pool.min_concurrency, config.autoscaled_pool.max_concurrency
        );
        println!("  Session pool max size: {}", config.session_pool.max_pool_size);

        Ok(())
    }

    pub async fn show_health(&self, detailed: bool) -> Result<(), Box<dyn std::error::Error>> {
        println!("System Health Check");
        println!("====================");

        let checker = CrawlHealthChecker::new(
            self.crawler.system_status.clone(),
            self.crawler.session_pool.clone(),
            self.crawler.queue.clone(),
        );
        let status = checker.check_system_health().await;

        println!("Overall: {:?}", status.overall);
        println!("  Resources: {:?}", status.resources);
        println!("  Sessions: {:?}", status.sessions);
        println!("  Queue: {:?}", status.queue);

        if detailed {
            let current = self.crawler.system_status.get_current_status().await;
            println!("\nDetailed system status:");
            println!("  Memory overloaded: {}", current.mem_info.is_overloaded);
            println!("  Event loop overloaded: {}", current.event_loop_info.is_overloaded);
            println!("  CPU overloaded: {}", current.cpu_info.is_overloaded);
            println!("  Client overloaded: {}", current.client_info.is_overloaded);
        }

        let info = self.crawler.queue.get_info();
        println!("\nQueue status:");
        println!("  Assumed total: {}", info.assumed_total_count);
        println!("  Assumed handled: {}", info.assumed_handled_count);
        println!("  Session pool size: {}", self.crawler.session_pool.size().await);

        Ok(())
    }

    pub async fn read_urls_from_file(&self, path: &PathBuf) -> Result<Vec<String>, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path).await?;
        Ok(content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_string())
            .collect())
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
