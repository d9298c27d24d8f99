//! Master configuration from environment variables (`.env` honored by the
//! binary entrypoint).  Missing required values are fatal at startup.

use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub bind_addr: String,
    pub database_url: String,
    pub secret_key: String,
}

impl MasterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mqtt_port = match get("MQTT_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("MQTT_PORT", raw))?,
            None => 1883,
        };
        Ok(MasterConfig {
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "localhost".to_owned()),
            mqtt_port,
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            secret_key: get("SECRET_KEY").ok_or(ConfigError::Missing("SECRET_KEY"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| (*v).to_owned())
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let cfg = MasterConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite://fleet.db"),
            ("SECRET_KEY", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(cfg.mqtt_host, "localhost");
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let err = MasterConfig::from_lookup(lookup(&[("SECRET_KEY", "s3cret")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn missing_secret_key_is_fatal() {
        let err =
            MasterConfig::from_lookup(lookup(&[("DATABASE_URL", "sqlite://fleet.db")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SECRET_KEY")));
    }

    #[test]
    fn non_numeric_port_is_rejected() {
        let err = MasterConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite://fleet.db"),
            ("SECRET_KEY", "s3cret"),
            ("MQTT_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("MQTT_PORT", _)));
    }
}
