use fieldx::fxstruct;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

use crate::cache::MAX_TTL;
use crate::error::ConfigError;
use crate::key_policy::KeyPolicy;

/// Construction-time settings of a [`RecommendationService`](crate::RecommendationService).
///
/// Every field has a default, so an empty JSON object is a valid configuration:
///
/// ```
/// # use rec_cache::CacheConfig;
/// let config = CacheConfig::from_json(r#"{"capacity": 200, "key_policy": {"kind": "stable"}}"#).unwrap();
/// assert_eq!(config.capacity, 200);
/// assert_eq!(config.ttl_secs, 60);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[fxstruct(no_new, default, get(copy))]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    #[fieldx(get(clone), default(String::from("recommendations")))]
    pub name:       String,
    /// Maximum number of cached recommendation lists.
    #[fieldx(default(1000))]
    pub capacity:   usize,
    #[fieldx(default(60))]
    pub ttl_secs:   u64,
    /// Expiry sweep period; the TTL when omitted.
    pub sweep_secs: Option<u64>,
    #[fieldx(get(clone))]
    pub key_policy: KeyPolicy,
    /// Length of a recommendation list.
    #[fieldx(default(10))]
    pub limit:      usize,
    /// Catalog page size used while ranking.
    #[fieldx(default(500))]
    pub page_size:  u64,
}

impl CacheConfig {
    /// Parses and validates.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.ttl_secs > MAX_TTL.as_secs() {
            return Err(ConfigError::TtlTooLong(self.ttl()));
        }
        if self.sweep_secs == Some(0) {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        self.key_policy.validate()
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_secs.map(Duration::from_secs)
    }
}
