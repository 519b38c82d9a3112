use crate::error::ProvisionerError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Layered configuration: defaults, then `config.toml`, then `PROVISIONER_*` env vars.
///
/// Nested keys use `__`, e.g. `PROVISIONER_POSTGRES__PASSWORD`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub basic: BasicConfig,
    pub postgres: PostgresConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    pub loglevel: String,
    /// SQLite URL of the object store holding requests and credential records.
    pub database_url: String,
    pub listen_addr: String,
    /// Shared secret of the admin API. Empty (the default) rejects every request.
    pub api_key: String,
}

impl Default for BasicConfig {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            database_url: "sqlite:provisioner.sqlite".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            api_key: String::new(),
        }
    }
}

/// Operator-level superuser credentials for the target PostgreSQL server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
    pub acquire_timeout_ms: u64,
    /// Host written into credential records; falls back to `host`.
    pub advertised_host: Option<String>,
    /// Port written into credential records; falls back to `port`.
    pub advertised_port: Option<u16>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            pool_size: 8,
            acquire_timeout_ms: 5_000,
            advertised_host: None,
            advertised_port: None,
        }
    }
}

impl PostgresConfig {
    pub fn public_host(&self) -> &str {
        self.advertised_host.as_deref().unwrap_or(&self.host)
    }

    pub fn public_port(&self) -> u16 {
        self.advertised_port.unwrap_or(self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub call_timeout_ms: u64,
    pub workers: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub resync_interval_secs: u64,
    pub password_length: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            workers: 4,
            backoff_min_ms: 500,
            backoff_max_ms: 5 * 60 * 1000,
            resync_interval_secs: 300,
            password_length: 32,
        }
    }
}

impl ReconcilerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_min_ms))
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self, ProvisionerError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("config.toml"))
                .merge(Env::prefixed("PROVISIONER_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ProvisionerError> {
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_partial_overrides() {
        let cfg = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
                r#"
                [postgres]
                host = "db.internal"
                advertised_host = "db.example.com"

                [reconciler]
                workers = 16
                "#,
            )),
        )
        .unwrap();

        assert_eq!(cfg.postgres.host, "db.internal");
        assert_eq!(cfg.postgres.port, 5432);
        assert_eq!(cfg.postgres.public_host(), "db.example.com");
        assert_eq!(cfg.postgres.public_port(), 5432);
        assert_eq!(cfg.reconciler.workers, 16);
        assert_eq!(cfg.reconciler.password_length, 32);
        assert_eq!(cfg.basic.loglevel, "info");
    }

    #[test]
    fn admin_api_is_locked_until_a_key_is_configured() {
        assert!(Config::default().basic.api_key.is_empty());

        let cfg = Config::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::string("[basic]\napi_key = \"s3cret\"\n")),
        )
        .unwrap();
        assert_eq!(cfg.basic.api_key, "s3cret");
    }

    #[test]
    fn backoff_max_never_below_min() {
        let rc = ReconcilerConfig {
            backoff_min_ms: 2_000,
            backoff_max_ms: 100,
            ..ReconcilerConfig::default()
        };
        assert_eq!(rc.backoff_max(), Duration::from_secs(2));
    }
}
