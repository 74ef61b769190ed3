use fieldx::error::FieldXError;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The outcome of a failed [`BoundedCache::get`](crate::BoundedCache::get).
///
/// A single failed recomputation is shared by every caller that was waiting on it, hence the error of the
/// recomputation function is kept behind an `Arc`.
#[derive(Debug, Error)]
pub enum CacheError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    #[error("recomputation failed: {0}")]
    Recompute(Arc<E>),
    /// The recomputation task panicked or was torn down before publishing its outcome.
    #[error("recomputation aborted: {0}")]
    Aborted(String),
}

impl<E> CacheError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    pub fn recompute_error(&self) -> Option<&E> {
        match self {
            Self::Recompute(err) => Some(err.as_ref()),
            Self::Aborted(_) => None,
        }
    }
}

impl<E> Clone for CacheError<E>
where
    E: Display + Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::Recompute(err) => Self::Recompute(Arc::clone(err)),
            Self::Aborted(msg) => Self::Aborted(msg.clone()),
        }
    }
}

/// Construction-time errors. A cache or service is never handed out when one of these is raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cache capacity must be a positive number of entries")]
    ZeroCapacity,
    #[error("cache TTL must be a positive duration")]
    ZeroTtl,
    #[error("cache TTL of {0:?} is longer than the supported maximum")]
    TtlTooLong(Duration),
    #[error("sweep interval must be a positive duration")]
    ZeroSweepInterval,
    #[error("key bucket width must be a positive number of seconds")]
    ZeroBucket,
    #[error("key bucket width of {0}s is longer than the supported maximum")]
    BucketTooWide(u64),
    #[error("recommendation limit must be positive")]
    ZeroLimit,
    #[error("invalid configuration: {0}")]
    Parse(String),
    /// A builder was not given a mandatory value.
    #[error("incomplete configuration: {0}")]
    Incomplete(String),
}

impl From<FieldXError> for ConfigError {
    fn from(err: FieldXError) -> Self {
        Self::Incomplete(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("rating score {0} is outside of the 1..=5 range")]
    OutOfRange(i32),
}
