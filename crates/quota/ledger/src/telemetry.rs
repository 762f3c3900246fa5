//! Tracing bootstrap.

use crate::config::LoggingConfig;
use crate::error::{LedgerError, LedgerResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the level filter. `RUST_LOG` takes precedence over the configured level.
pub fn env_filter(config: &LoggingConfig) -> LedgerResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LedgerError::Config(format!("invalid log level {:?}: {e}", config.level))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LoggingConfig) -> LedgerResult<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);

    let installed = match (config.json, config.timestamps) {
        (true, true) => registry.with(fmt::layer().json()).try_init(),
        (true, false) => registry.with(fmt::layer().json().without_time()).try_init(),
        (false, true) => registry.with(fmt::layer()).try_init(),
        (false, false) => registry.with(fmt::layer().without_time()).try_init(),
    };
    installed.map_err(|e| LedgerError::Config(format!("tracing already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "quota_ledger=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(env_filter(&config), Err(LedgerError::Config(_))));
    }

    #[test]
    fn accepts_directive_list() {
        let config = LoggingConfig {
            level: "info,quota_ledger=debug".to_string(),
            ..LoggingConfig::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
