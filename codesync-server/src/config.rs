use std::env;
use std::fmt::Display;
use std::str::FromStr;

use codesync_collab::ServerConfig;
use log::info;
use thiserror::Error;

pub const BIND_ADDR_VAR: &str = "CODESYNC_BIND_ADDR";
pub const OUTBOX_CAPACITY_VAR: &str = "CODESYNC_OUTBOX_CAPACITY";
pub const COMMAND_CAPACITY_VAR: &str = "CODESYNC_COMMAND_CAPACITY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Server configuration from the environment, defaults for anything unset.
pub fn load() -> Result<ServerConfig, ConfigError> {
    load_from(|key| env::var(key).ok())
}

pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerConfig, ConfigError> {
    let defaults = ServerConfig::default();
    let config = ServerConfig {
        bind_addr: try_load(&lookup, BIND_ADDR_VAR, defaults.bind_addr)?,
        outbox_capacity: try_load_capacity(&lookup, OUTBOX_CAPACITY_VAR, defaults.outbox_capacity)?,
        command_capacity: try_load_capacity(
            &lookup,
            COMMAND_CAPACITY_VAR,
            defaults.command_capacity,
        )?,
    };
    Ok(config)
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value,
            reason: e.to_string(),
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

/// Channel capacities must be positive; tokio panics on zero.
fn try_load_capacity(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let capacity = try_load(lookup, key, default)?;
    if capacity == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: capacity.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(load_from(lookup(&[])).unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load_from(lookup(&[
            (BIND_ADDR_VAR, "0.0.0.0:9000"),
            (OUTBOX_CAPACITY_VAR, " 32 "),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.outbox_capacity, 32);
        assert_eq!(config.command_capacity, 1024);
    }

    #[test]
    fn test_rejects_unparsable() {
        let err = load_from(lookup(&[(COMMAND_CAPACITY_VAR, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: COMMAND_CAPACITY_VAR, .. }));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = load_from(lookup(&[(OUTBOX_CAPACITY_VAR, "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }
}
