use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub queue: QueueSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Optional store URL. Defaults to a per-user sqlite file.
    pub url: Option<String>,
    /// Maximum number of pooled connections
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listen address for the RPC server
    pub listen_addr: String,
    /// Port number to listen on
    pub port: u16,
    /// Token required by the admin/review surface; unset disables the gate
    pub admin_token: Option<String>,
}

/// Queue and scheduler knobs, all in seconds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueSettings {
    pub tick_interval_secs: u64,
    pub pending_ack_timeout_secs: u64,
    pub stale_task_threshold_secs: u64,
    pub orphan_agent_threshold_secs: u64,
    pub default_poll_timeout_secs: u64,
    pub stale_agent_threshold_secs: u64,
    pub event_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl Config {
    /// Load configuration: embedded defaults, then an optional CONFIG_FILE,
    /// then `SYNAPSE__`-prefixed environment variables, then the standard
    /// environment variables.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("SYNAPSE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("SYNAPSE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;
        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;

        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    /// Standard deployment variables override everything else.
    fn apply_standard_env_vars(config: &mut Config) {
        if let Ok(database_url) = env::var("DATABASE_URL") {
            config.database.url = Some(database_url);
        }
        if let Ok(listen_addr) = env::var("LISTEN_ADDR") {
            config.server.listen_addr = listen_addr;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
        if let Ok(admin_token) = env::var("ADMIN_TOKEN") {
            config.server.admin_token = Some(admin_token);
        }
    }

    /// The store URL, falling back to a per-user default path.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => Self::default_database_url(),
        }
    }

    pub fn default_database_url() -> String {
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            return format!("sqlite://{xdg_data}/synapse-mcp/synapse.sqlite");
        }
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        format!("sqlite://{home}/synapse.sqlite")
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    /// Queue thresholds as the queue crate wants them.
    pub fn queue_config(&self) -> dispatch_queue::QueueConfig {
        dispatch_queue::QueueConfig {
            default_poll_timeout: Duration::from_secs(self.queue.default_poll_timeout_secs),
            pending_ack_timeout: Duration::from_secs(self.queue.pending_ack_timeout_secs),
            stale_task_threshold: Duration::from_secs(self.queue.stale_task_threshold_secs),
            orphan_agent_threshold: Duration::from_secs(self.queue.orphan_agent_threshold_secs),
            event_capacity: self.queue.event_capacity,
        }
    }

    pub fn scheduler_config(&self) -> dispatch_queue::SchedulerConfig {
        dispatch_queue::SchedulerConfig {
            tick_interval: Duration::from_secs(self.queue.tick_interval_secs),
            stale_agent_threshold: Duration::from_secs(self.queue.stale_agent_threshold_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        let database_url = self.database_url();
        if !database_url.starts_with("sqlite://") && !database_url.starts_with(":memory:") {
            return Err(anyhow::anyhow!(
                "Only SQLite stores are supported. URL must start with 'sqlite://'. Got: {database_url}"
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!(
                "Database max_connections must be greater than 0"
            ));
        }
        if self.queue.tick_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "Scheduler tick interval must be greater than 0"
            ));
        }
        if self.queue.event_capacity == 0 {
            return Err(anyhow::anyhow!("Event capacity must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                connection_timeout: 30,
            },
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                port: 3000,
                admin_token: None,
            },
            queue: QueueSettings {
                tick_interval_secs: 5,
                pending_ack_timeout_secs: 60,
                stale_task_threshold_secs: 1800,
                orphan_agent_threshold_secs: 300,
                default_poll_timeout_secs: 290,
                stale_agent_threshold_secs: 86_400,
                event_capacity: 256,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.queue.tick_interval_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_url_fallback() {
        let config = Config::default();
        assert!(config.database_url().starts_with("sqlite://"));

        let mut custom = Config::default();
        custom.database.url = Some("sqlite://custom.db".to_string());
        assert_eq!(custom.database_url(), "sqlite://custom.db");
    }

    #[test]
    fn test_server_address() {
        let config = Config::default();
        assert_eq!(config.server_address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_queue_config_conversion() {
        let config = Config::default();
        let queue = config.queue_config();
        assert_eq!(queue.pending_ack_timeout, Duration::from_secs(60));
        assert_eq!(queue.stale_task_threshold, Duration::from_secs(1800));
        assert_eq!(queue.orphan_agent_threshold, Duration::from_secs(300));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.url = Some("postgres://nope".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.tick_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
