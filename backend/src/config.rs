use std::time::Duration;

use config::{ConfigError, Environment};
use serde::Deserialize;

use crate::polls::{PollSettings, DEFAULT_PAYOUT_EXPIRY_BUFFER_SECS};
use crate::settlement::ReconcilerSettings;

/// Where polls and votes are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub ledger_backend: LedgerBackend,
    pub db_max_connections: u32,
    pub db_min_connections: u32,

    // LND REST proxy
    pub lnd_rest_url: String,
    pub lnd_tls_cert_path: Option<String>,
    pub lnd_macaroon_path: Option<String>,

    pub poll_expiry_interval_secs: u64,
    pub vote_expiry_interval_secs: u64,
    pub stream_retry_secs: u64,
    pub payout_expiry_buffer_secs: i64,
    pub rpc_timeout_secs: u64,
    pub pass_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    fn load(env: Environment) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/polls")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("ledger_backend", "postgres")?
            .set_default("db_max_connections", 20)?
            .set_default("db_min_connections", 2)?
            .set_default("lnd_rest_url", "https://localhost:8080")?
            .set_default("poll_expiry_interval_secs", 60)?
            .set_default("vote_expiry_interval_secs", 300)?
            .set_default("stream_retry_secs", 10)?
            .set_default("payout_expiry_buffer_secs", DEFAULT_PAYOUT_EXPIRY_BUFFER_SECS)?
            .set_default("rpc_timeout_secs", 30)?
            .set_default("pass_timeout_secs", 300)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::Message(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                self.db_min_connections, self.db_max_connections
            )));
        }
        let intervals = [
            ("POLL_EXPIRY_INTERVAL_SECS", self.poll_expiry_interval_secs),
            ("VOTE_EXPIRY_INTERVAL_SECS", self.vote_expiry_interval_secs),
            ("RPC_TIMEOUT_SECS", self.rpc_timeout_secs),
            ("PASS_TIMEOUT_SECS", self.pass_timeout_secs),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Message(format!("{} must be positive", key)));
            }
        }
        if self.payout_expiry_buffer_secs < 0 {
            return Err(ConfigError::Message(
                "PAYOUT_EXPIRY_BUFFER_SECS must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            payout_expiry_buffer_secs: self.payout_expiry_buffer_secs,
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            poll_interval: Duration::from_secs(self.poll_expiry_interval_secs),
            vote_interval: Duration::from_secs(self.vote_expiry_interval_secs),
            stream_retry: Duration::from_secs(self.stream_retry_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::default().source(Some(source))
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(env(&[])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.ledger_backend, LedgerBackend::Postgres);
        assert_eq!(config.payout_expiry_buffer_secs, 43200);
        assert_eq!(config.lnd_macaroon_path, None);

        let settings = config.reconciler_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
        assert_eq!(settings.vote_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = Config::load(env(&[
            ("LEDGER_BACKEND", "memory"),
            ("POLL_EXPIRY_INTERVAL_SECS", "5"),
            ("LND_MACAROON_PATH", "/tmp/admin.macaroon"),
        ]))
        .unwrap();
        assert_eq!(config.ledger_backend, LedgerBackend::Memory);
        assert_eq!(config.poll_expiry_interval_secs, 5);
        assert_eq!(config.lnd_macaroon_path.as_deref(), Some("/tmp/admin.macaroon"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::load(env(&[("RPC_TIMEOUT_SECS", "soon")])).is_err());
        assert!(Config::load(env(&[("RPC_TIMEOUT_SECS", "0")])).is_err());
        assert!(Config::load(env(&[("LEDGER_BACKEND", "redis")])).is_err());
        assert!(Config::load(env(&[
            ("DB_MIN_CONNECTIONS", "50"),
            ("DB_MAX_CONNECTIONS", "10"),
        ]))
        .is_err());
    }
}
