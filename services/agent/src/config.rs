//! Agent configuration from environment variables (`.env` honored by the
//! binary entrypoint).

use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    /// Fleet-unique human name; the Master keys identity reuse on it.
    pub node_name: String,
    /// Where the Master-assigned node id is cached between restarts.
    pub node_id_file: PathBuf,
    pub secret_key: String,
}

impl AgentConfig {
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
        Ok(AgentConfig {
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "localhost".to_owned()),
            mqtt_port,
            node_name: get("NODE_NAME").ok_or(ConfigError::Missing("NODE_NAME"))?,
            node_id_file: PathBuf::from(
                get("NODE_ID_FILE").unwrap_or_else(|| "./node_id".to_owned()),
            ),
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
        let cfg = AgentConfig::from_lookup(lookup(&[
            ("NODE_NAME", "edge-01"),
            ("SECRET_KEY", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(cfg.mqtt_host, "localhost");
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.node_id_file, PathBuf::from("./node_id"));
    }

    #[test]
    fn node_name_is_required() {
        let err = AgentConfig::from_lookup(lookup(&[("SECRET_KEY", "s3cret")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("NODE_NAME")));
    }

    #[test]
    fn secret_key_is_required() {
        let err = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "edge-01")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SECRET_KEY")));
    }
}
