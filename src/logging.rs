//! Tracing setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Environment variable holding a filter directive; wins over the config.
pub const LOG_ENV: &str = "STOCKROOM_LOG";

/// Build the filter from `STOCKROOM_LOG`, falling back to the configured level.
pub fn filter(config: &LogConfig) -> Result<EnvFilter> {
  match std::env::var(LOG_ENV) {
    Ok(directive) => EnvFilter::try_new(&directive)
      .map_err(|e| eyre!("Invalid {} directive '{}': {}", LOG_ENV, directive, e)),
    Err(_) => EnvFilter::try_new(&config.level)
      .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e)),
  }
}

/// Install the global subscriber.
///
/// With `log.dir` set, events go to a daily-rolling file and the returned
/// guard must be held until exit so buffered lines are flushed. Otherwise
/// they go to stderr.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = filter(config)?;

  match &config.dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "stockroom.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter);
      tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);
      tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(None)
    }
  }
}
