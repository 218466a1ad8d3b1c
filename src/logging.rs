//! Process-wide tracing setup.
//!
//! The binary installs the subscriber exactly once; library components only emit
//! through `tracing` macros and never configure output themselves.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "local-rag-pipeline.log";

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub dir: String,
    pub level: String,
    pub max_mb: u64,
    pub console: bool,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let console = std::env::var("DEVELOPMENT").is_ok()
            || std::env::var("DEV").is_ok()
            || std::env::var("CONSOLE_LOGS").is_ok();

        Self {
            dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string()),
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_mb: std::env::var("LOG_MAX_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            console,
        }
    }

    pub fn log_file(&self) -> String {
        format!("{}/{}", self.dir, LOG_FILE_NAME)
    }
}

pub fn setup_logging(settings: &LogSettings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.console {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        tracing::info!("Development mode: logging to console");
    } else {
        std::fs::create_dir_all(&settings.dir)
            .with_context(|| format!("Failed to create log directory {}", settings.dir))?;
        let file_appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(settings.log_file())
            .with_context(|| format!("Failed to open log file {}", settings.log_file()))?;

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .json()
            .init();
    }

    tracing::info!(
        log_dir = %settings.dir,
        log_level = %settings.level,
        max_mb = settings.max_mb,
        console = settings.console,
        "Logging initialized"
    );

    Ok(())
}

/// Truncate the log file whenever it grows past `max_mb`, checked every 5 minutes.
pub fn spawn_log_cleanup_task(settings: &LogSettings) -> Option<tokio::task::JoinHandle<()>> {
    if settings.console {
        return None;
    }

    let max_mb = settings.max_mb;
    let log_file = settings.log_file();

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));

        loop {
            interval.tick().await;
            if let Err(e) = truncate_if_oversized(&log_file, max_mb) {
                eprintln!("Failed to truncate log file: {e}");
            }
        }
    }))
}

fn truncate_if_oversized(log_file: &str, max_mb: u64) -> std::io::Result<bool> {
    let max_bytes = max_mb * 1024 * 1024;
    match std::fs::metadata(log_file) {
        Ok(metadata) if metadata.len() > max_bytes => {
            std::fs::write(
                log_file,
                format!("[LOG TRUNCATED - Size exceeded {max_mb}MB]\n"),
            )?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
