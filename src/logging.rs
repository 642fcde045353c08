//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Build the event filter: RUST_LOG wins over the configured level.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
  match EnvFilter::try_from_default_env() {
    Ok(filter) => Ok(filter),
    Err(_) => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e)),
  }
}

/// Install the global subscriber.
///
/// With a log directory configured, events go to a daily rolling file and
/// the returned guard must be kept alive until exit so buffered lines are
/// flushed. Otherwise events go to stderr.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = env_filter(config)?;

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::daily(directory, "fieldsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;

      Ok(None)
    }
  }
}
