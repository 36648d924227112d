//! Logging setup for hosts embedding the service

use crate::{config::LoggingConfig, CoreError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build the filter for `config`.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies to this
/// crate and the extra directives are appended.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = format!("spindle_core={}", config.level.as_str());
    if let Some(extra) = config.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        directives.push(',');
        directives.push_str(extra);
    }

    EnvFilter::try_new(&directives).map_err(|err| {
        CoreError::invalid_field(
            "CONFIG_INVALID_LOG_FILTER",
            "logging.filter",
            format!("Invalid log filter `{}`: {}", directives, err),
            "Use tracing directives such as `spindle_core::sampling=trace`",
        )
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_names(config.thread_names),
        )
        .with(filter)
        .try_init()
        .map_err(|err| CoreError::Internal {
            code: "LOGGING_INIT_FAILED",
            message: err.to_string(),
            context: "Installing the global tracing subscriber".to_string(),
            source: None,
        })
}
