use std::time::Duration;

use embedstore_core::EmbedStoreError;
use embedstore_sql::DEFAULT_EMBEDDING_LIST_SIZE;
use serde::{Deserialize, Serialize};

/// Environment variable overriding [`StoreConfig::embedding_list_size`].
pub const ENV_EMBEDDING_LIST_SIZE: &str = "EMBEDSTORE_EMBEDDING_LIST_SIZE";
/// Environment variable setting [`StoreConfig::drain_timeout_ms`].
pub const ENV_DRAIN_TIMEOUT_MS: &str = "EMBEDSTORE_DRAIN_TIMEOUT_MS";

/// Store-wide settings that are not tied to one table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// ivfflat list count used when a Postgres vector index is created.
    pub embedding_list_size: u32,
    /// How long a search waits for pending embedding jobs. `None` waits forever.
    pub drain_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            embedding_list_size: DEFAULT_EMBEDDING_LIST_SIZE,
            drain_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `EMBEDSTORE_*` environment variables.
    pub fn from_env() -> Result<Self, EmbedStoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EmbedStoreError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_EMBEDDING_LIST_SIZE) {
            let size: u32 = parse_var(ENV_EMBEDDING_LIST_SIZE, &raw)?;
            if size == 0 {
                return Err(EmbedStoreError::Configuration(format!(
                    "{ENV_EMBEDDING_LIST_SIZE} must be greater than zero"
                )));
            }
            config.embedding_list_size = size;
        }
        if let Some(raw) = lookup(ENV_DRAIN_TIMEOUT_MS) {
            config.drain_timeout_ms = Some(parse_var(ENV_DRAIN_TIMEOUT_MS, &raw)?);
        }
        Ok(config)
    }

    pub fn with_embedding_list_size(mut self, size: u32) -> Self {
        self.embedding_list_size = size;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, EmbedStoreError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| EmbedStoreError::Configuration(format!("{name}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.embedding_list_size, 500);
        assert_eq!(config.drain_timeout(), None);
    }

    #[test]
    fn reads_both_variables() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_EMBEDDING_LIST_SIZE, "100"),
            (ENV_DRAIN_TIMEOUT_MS, " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.embedding_list_size, 100);
        assert_eq!(config.drain_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        for vars in [
            [(ENV_EMBEDDING_LIST_SIZE, "lots")],
            [(ENV_EMBEDDING_LIST_SIZE, "0")],
            [(ENV_DRAIN_TIMEOUT_MS, "-5")],
        ] {
            let err = StoreConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, EmbedStoreError::Configuration(_)), "{err}");
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"drain_timeout_ms": 1000}"#).unwrap();
        assert_eq!(config.embedding_list_size, 500);
        assert_eq!(config.drain_timeout_ms, Some(1000));
    }
}
