use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use std::path::PathBuf;
use std::fs;

/// Initialize the logging system
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = if verbose {
        EnvFilter::from_default_env()
            .add_directive("link_enricher=debug".parse()?)
            .add_directive("warn".parse()?)
    } else {
        EnvFilter::from_default_env()
            .add_directive("link_enricher=info".parse()?)
            .add_directive("warn".parse()?)
    };

    // Logs go to stderr so command output on stdout stays machine readable
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    if let Some(log_file) = log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = fs::File::create(log_file)?;
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Create a default log file path
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) =
        directories::ProjectDirs::from("com", "link-enricher", "link-enricher")
    {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("enricher.log");
    path
}
