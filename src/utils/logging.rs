//! # Logging
//!
//! Installs the process-wide `tracing` subscriber.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to this
//! crate and everything else is left at `warn`.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Build the filter used by [`init_logging`].
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.log_level.as_str().to_ascii_lowercase();
        EnvFilter::new(format!("warn,map_router={level}"))
    })
}

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the global subscriber.
///
/// Idempotent: the first successful call wins and later calls return
/// `Ok(())` without touching the installed subscriber. Concurrent callers
/// wait for the first one to finish.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INSTALLED.get_or_try_init(|| install(config)).map(|_| ())
}

fn install(config: &LoggingConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
