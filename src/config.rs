//! Client configuration.
//!
//! Everything is optional in the YAML file; missing fields take their
//! defaults. Durations are written in milliseconds.
//!
//! ```yaml
//! router:
//!   max_retries: 5
//!   retry_backoff: 100
//!   blocked_op_timeout: 30000
//! cache:
//!   max_bytes: 67108864
//!   dirty_high_water: 33554432
//! cache_enabled: true
//! durability: committed
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::router::RouterConfig;
use crate::types::Durability;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub router: RouterConfig,
    pub cache: CacheConfig,
    /// Route file I/O through the write-back cache
    pub cache_enabled: bool,
    /// Durability requested for direct writes and flushes
    pub durability: Durability,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            cache_enabled: true,
            durability: Durability::Committed,
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&text)?;
        info!(path = %path.display(), "loaded client configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or null.
pub(crate) mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = ClientConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.router.max_retries, RouterConfig::default().max_retries);
        assert!(config.cache_enabled);
        assert_eq!(config.durability, Durability::Committed);
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
router:
  max_retries: 2
  retry_backoff: 250
  blocked_op_timeout: 3000
cache:
  max_bytes: 1048576
  dirty_high_water: 524288
  dirty_low_water: 262144
cache_enabled: false
durability: applied
"#;
        let config = ClientConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.router.max_retries, 2);
        assert_eq!(config.router.retry_backoff, Duration::from_millis(250));
        assert_eq!(
            config.router.blocked_op_timeout,
            Some(Duration::from_secs(3))
        );
        assert_eq!(config.cache.max_bytes, 1048576);
        assert!(!config.cache_enabled);
        assert_eq!(config.durability, Durability::Applied);
    }

    #[test]
    fn test_invalid_watermarks_rejected() {
        let yaml = r#"
cache:
  dirty_high_water: 100
  dirty_low_water: 200
"#;
        assert!(matches!(
            ClientConfig::from_yaml_str(yaml),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_yaml() {
        let config = ClientConfig::default();
        let text = serde_yaml::to_string(&config).unwrap();
        let back = ClientConfig::from_yaml_str(&text).unwrap();
        assert_eq!(back.router.tick_interval, config.router.tick_interval);
        assert_eq!(back.cache.flush_interval, config.cache.flush_interval);
    }

    #[test]
    fn test_missing_file() {
        let err = ClientConfig::load("/nonexistent/osdc.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
