//! Runtime Configuration
//!
//! Settings for a [`Runtime`](crate::reactive::Runtime). Defaults suit most
//! networks; a config can also be read from JSON or from the environment.
//!
//! ```json
//! { "name": "ui", "lock_timeout_ms": 250 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FrpError, Result};

/// Environment variable overriding [`RuntimeConfig::lock_timeout`], in milliseconds.
pub const ENV_LOCK_TIMEOUT_MS: &str = "CASCADE_LOCK_TIMEOUT_MS";

/// Environment variable overriding [`RuntimeConfig::name`].
pub const ENV_NAME: &str = "CASCADE_NAME";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Label attached to the runtime's tracing events.
    pub name: String,

    /// How long an ingress call waits for the propagation lock before
    /// failing with [`FrpError::LockTimeout`].
    #[serde(rename = "lock_timeout_ms", with = "millis")]
    pub lock_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "cascade".to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from defaults overridden by `CASCADE_*` variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_NAME) {
            config.name = name;
        }
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                FrpError::InvalidConfig(format!("{ENV_LOCK_TIMEOUT_MS} is not a number: {raw:?}"))
            })?;
            config.lock_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Builder-style override of the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout.is_zero() {
            return Err(FrpError::InvalidConfig(
                "lock_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.name, "cascade");
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_overrides_and_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "lock_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.name, "cascade");
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let config = RuntimeConfig::default().with_lock_timeout(Duration::from_millis(42));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"lock_timeout_ms\":42"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{ "lock_timeout_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, FrpError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = RuntimeConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, FrpError::Config(_)));
    }

    #[test]
    fn lookup_overrides() {
        let vars: HashMap<&str, &str> =
            [(ENV_NAME, "ui"), (ENV_LOCK_TIMEOUT_MS, "75")].into_iter().collect();
        let config =
            RuntimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.name, "ui");
        assert_eq!(config.lock_timeout, Duration::from_millis(75));

        let err = RuntimeConfig::from_lookup(|key| {
            (key == ENV_LOCK_TIMEOUT_MS).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, FrpError::InvalidConfig(_)));
    }
}
