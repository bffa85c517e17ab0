pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cli::config::CrawlerConfig;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull jobs from the queue until interrupted
    Worker {
        /// Number of jobs executed in parallel
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Execute a stored task in this process
    Run {
        #[arg(required = true)]
        task_id: i64,

        #[arg(long)]
        owner: i64,
    },

    /// Scrape once without a database and print the products as JSON
    Scrape {
        #[arg(short, long)]
        platform: String,

        /// keyword_search, url_scrape or shop_monitor
        #[arg(short, long, default_value = "keyword_search")]
        task_type: String,

        /// Keyword, URL or shop id, depending on the task type
        #[arg(required = true)]
        param: String,
    },

    /// Create a task and enqueue it for the workers
    Submit {
        #[arg(long)]
        owner: i64,

        #[arg(short, long)]
        platform: String,

        #[arg(short, long, default_value = "keyword_search")]
        task_type: String,

        /// Keyword, URL or shop id, depending on the task type
        #[arg(required = true)]
        param: String,

        /// Expire the task after this many seconds
        #[arg(long)]
        expires_in: Option<u64>,

        /// Only insert the task
        #[arg(long)]
        no_enqueue: bool,
    },

    /// Check status of a task
    Status {
        #[arg(required = true)]
        task_id: i64,

        #[arg(long)]
        owner: i64,
    },

    /// Show a product's price history
    History {
        #[arg(required = true)]
        product_id: i64,

        #[arg(long)]
        owner: i64,

        #[arg(short, long, default_value_t = 20)]
        limit: i64,

        /// Record a snapshot of the current values first
        #[arg(long)]
        record: bool,
    },

    /// Probe the configured proxies
    Proxies,

    /// List supported platforms
    Platforms,

    /// Show the configuration file location
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = CrawlerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Worker { concurrency } => {
            info!("Starting worker pool");
            commands::worker(config, concurrency).await
        }
        Commands::Run { task_id, owner } => {
            info!("Running task {} for owner {}", task_id, owner);
            commands::run(config, task_id, owner).await
        }
        Commands::Scrape { platform, task_type, param } => {
            info!("Scraping {} ({}) on {}", param, task_type, platform);
            commands::scrape(config, &platform, &task_type, &param).await
        }
        Commands::Submit {
            owner,
            platform,
            task_type,
            param,
            expires_in,
            no_enqueue,
        } => commands::submit(config, owner, &platform, &task_type, &param, expires_in, no_enqueue).await,
        Commands::Status { task_id, owner } => commands::status(config, task_id, owner).await,
        Commands::History {
            product_id,
            owner,
            limit,
            record,
        } => commands::history(config, product_id, owner, limit, record).await,
        Commands::Proxies => {
            info!("Testing {} proxies", config.proxy.proxy_list.len());
            commands::proxies(config).await
        }
        Commands::Platforms => commands::platforms(config).await,
        Commands::Config { show } => commands::show_config(&config, cli.config.as_deref(), show).await,
    }
}
