pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::crawler::task::Priority;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (the per-user data directory when no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,

    /// Configuration file; defaults to the per-user config directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich bookmarks listed in a JSON file
    Crawl {
        /// JSON array of `{ "id", "url", "title"? }` objects
        #[arg(short, long, required = true)]
        input: PathBuf,

        /// Only crawl these bookmark ids (comma separated)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Task priority (low, normal, high, urgent)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Fetch pages even when robots.txt disallows everything
        #[arg(long)]
        ignore_robots: bool,

        /// Maximum number of concurrent fetches
        #[arg(long)]
        concurrency: Option<usize>,

        /// Where to write results, overriding the configured path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fetch a single URL and print the result
    Check {
        #[arg(required = true)]
        url: String,

        /// Fetch even when robots.txt disallows everything
        #[arg(long)]
        ignore_robots: bool,
    },

    /// Show the robots verdict for a host
    Robots {
        /// Host, optionally with a port
        #[arg(required = true)]
        domain: String,
    },

    /// Show the active configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config;

    match cli.command {
        Commands::Crawl {
            input,
            ids,
            priority,
            ignore_robots,
            concurrency,
            output,
        } => {
            info!("Crawling bookmarks from {}", input.display());
            let options = commands::CrawlOptions {
                input,
                ids: (!ids.is_empty()).then_some(ids),
                priority,
                respect_robots: !ignore_robots,
                concurrency,
                output,
            };
            commands::crawl(config_path, options).await
        }
        Commands::Check { url, ignore_robots } => {
            info!("Checking {}", url);
            commands::check(config_path, url, !ignore_robots).await
        }
        Commands::Robots { domain } => {
            info!("Looking up robots policy for {}", domain);
            commands::robots(config_path, domain).await
        }
        Commands::Config { init } => {
            if init {
                commands::init_config(config_path)
            } else {
                commands::show_config(config_path)
            }
        }
    }
}
