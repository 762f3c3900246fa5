//! Configuration for the quota ledger

use serde::{Deserialize, Serialize};

/// Main ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Request admission limits
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG` when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            timestamps: true,
        }
    }
}

/// Limits applied to requests before any storage access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Refuse provisions and quota changes on resources that were never defined
    #[serde(default)]
    pub require_registered_resources: bool,

    #[serde(default = "default_max_provisions")]
    pub max_provisions_per_commission: usize,

    #[serde(default = "default_max_name_len")]
    pub max_commission_name_len: usize,

    /// Upper bound on keys, serials or holders in one batch call
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            require_registered_resources: false,
            max_provisions_per_commission: default_max_provisions(),
            max_commission_name_len: default_max_name_len(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_provisions() -> usize {
    256
}

fn default_max_name_len() -> usize {
    256
}

fn default_max_batch_size() -> usize {
    1024
}

impl LedgerConfig {
    /// Load configuration from defaults, an optional file and `QUOTA_LEDGER_*` variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&LedgerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // QUOTA_LEDGER_ADMISSION__MAX_BATCH_SIZE=64
        builder = builder.add_source(
            config::Environment::with_prefix("QUOTA_LEDGER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Configuration for tests and local development
    pub fn in_memory() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(!config.admission.require_registered_resources);
        assert_eq!(config.admission.max_provisions_per_commission, 256);
        assert_eq!(config.admission.max_commission_name_len, 256);
        assert_eq!(config.admission.max_batch_size, 1024);
    }

    #[test]
    fn test_postgres_section_parses_with_defaults() {
        let config: LedgerConfig = toml::from_str(
            r#"
            [storage]
            type = "postgres"
            url = "postgres://quota@localhost/quota"

            [admission]
            require_registered_resources = true
            "#,
        )
        .unwrap();

        match config.storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                assert_eq!(url, "postgres://quota@localhost/quota");
                assert_eq!(max_connections, 10);
                assert_eq!(connect_timeout_secs, 5);
            }
            other => panic!("unexpected storage config {other:?}"),
        }
        assert!(config.admission.require_registered_resources);
        assert_eq!(config.admission.max_batch_size, 1024);
        assert!(config.logging.timestamps);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = LedgerConfig::load(None).unwrap();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.admission, AdmissionConfig::default());
    }
}
