use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;

use crate::cache::MAX_TTL;
use crate::error::ConfigError;

/// Key and freshness window for one subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKey {
    pub key:    String,
    /// How long a value stored under `key` may be served. Never longer than the TTL passed to the policy.
    pub window: Duration,
}

/// How a subject maps to a cache key.
///
/// `Stable` is the recommended policy: one key per subject, freshness is entirely up to the cache TTL.
///
/// `Bucketed` folds a coarse time bucket into the key so the key itself changes on schedule. It exists for
/// compatibility only and is discouraged: every bucket transition mints a brand new key while the previous one stays
/// in the cache until evicted or expired. An uncapped map keyed like this grows forever; with
/// [`BoundedCache`](crate::BoundedCache) memory stays bounded by the capacity whatever the policy is, and the entry
/// window is clipped to the end of its bucket so stale buckets expire promptly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyPolicy {
    #[default]
    Stable,
    Bucketed {
        bucket_secs: u64,
    },
}

impl KeyPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Bucketed { bucket_secs: 0 } => Err(ConfigError::ZeroBucket),
            Self::Bucketed { bucket_secs } if *bucket_secs > MAX_TTL.as_secs() => {
                Err(ConfigError::BucketTooWide(*bucket_secs))
            }
            _ => Ok(()),
        }
    }

    pub fn derive<S: Display>(&self, subject: S, ttl: Duration) -> DerivedKey {
        self.derive_at(subject, ttl, Utc::now())
    }

    pub fn derive_at<S: Display>(&self, subject: S, ttl: Duration, now: DateTime<Utc>) -> DerivedKey {
        match self {
            Self::Stable => DerivedKey {
                key:    format!("rec_{subject}"),
                window: ttl,
            },
            Self::Bucketed { bucket_secs } => {
                // Widths past the millisecond range of i64 can't be told apart from a single everlasting bucket.
                let width = i64::try_from((*bucket_secs).max(1))
                    .ok()
                    .and_then(|secs| secs.checked_mul(1000))
                    .unwrap_or(i64::MAX);
                let now_ms = now.timestamp_millis();
                let bucket = now_ms.div_euclid(width);
                let remaining = Duration::from_millis((width - now_ms.rem_euclid(width)) as u64);

                DerivedKey {
                    key:    format!("rec_{subject}_{bucket}"),
                    window: remaining.min(ttl),
                }
            }
        }
    }
}

impl Display for KeyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Bucketed { bucket_secs } => write!(f, "bucketed({bucket_secs}s)"),
        }
    }
}
