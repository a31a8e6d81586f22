use anyhow::Result;
use tracing::{error, info};

use link_enricher::cli;
use link_enricher::utils::{default_log_file, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = args.log_file.clone().map(|path| path.unwrap_or_else(default_log_file));
    init_logging(args.verbose, log_file)?;

    info!("Starting link-enricher v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
