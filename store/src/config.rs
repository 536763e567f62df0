//! Store configuration.
//!
//! Values come from `PLAYERSTORE_*` environment variables, falling back to
//! defaults:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `PLAYERSTORE_RETRY_ATTEMPTS` | 3 | attempts for sorted get/set/range calls |
//! | `PLAYERSTORE_RETRY_DELAY_MS` | 500 | pause between those attempts |
//! | `PLAYERSTORE_SESSION_ATTEMPTS` | 5 | attempts to obtain a session lease |
//! | `PLAYERSTORE_SESSION_DELAY_MS` | 1000 | pause between lease attempts |
//! | `PLAYERSTORE_AUTOSAVE_SECS` | 30 | autosave interval, `0` disables |
//! | `PLAYERSTORE_LEASE_TTL_SECS` | 120 | lease lifetime granted by backends |
//!
//! The autosave interval must be shorter than the lease TTL.

use std::time::Duration;

use crate::error::StoreError;
use crate::retry::RetryPolicy;

const DEFAULT_AUTOSAVE_SECS: u64 = 30;
const DEFAULT_LEASE_TTL_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Policy for retry-wrapped sorted store calls.
    pub retry: RetryPolicy,
    /// Policy for acquiring a document session.
    pub session_start: RetryPolicy,
    /// `None` means the caller saves explicitly.
    pub autosave_interval: Option<Duration>,
    pub lease_ttl: Duration,
    /// Inclusive value bounds used when a range query omits them.
    pub sorted_min: i64,
    pub sorted_max: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            session_start: RetryPolicy::fixed(5, Duration::from_secs(1)),
            autosave_interval: Some(Duration::from_secs(DEFAULT_AUTOSAVE_SECS)),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            sorted_min: 0,
            sorted_max: i64::MAX,
        }
    }
}

impl StoreConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Unset variables keep their
    /// defaults; unparsable ones are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |name: &str| -> Result<Option<u64>, StoreError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                    StoreError::usage(format!("{} must be a non-negative integer, got {:?}", name, raw))
                }),
            }
        };

        let retry = RetryPolicy::new(
            read_u32(&read, "PLAYERSTORE_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_attempts()),
            read("PLAYERSTORE_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.delay()),
        )?;
        let session_start = RetryPolicy::new(
            read_u32(&read, "PLAYERSTORE_SESSION_ATTEMPTS")?
                .unwrap_or(defaults.session_start.max_attempts()),
            read("PLAYERSTORE_SESSION_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.session_start.delay()),
        )?;
        let autosave_interval = match read("PLAYERSTORE_AUTOSAVE_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.autosave_interval,
        };
        let lease_ttl = read("PLAYERSTORE_LEASE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);
        if lease_ttl.is_zero() {
            return Err(StoreError::usage("PLAYERSTORE_LEASE_TTL_SECS must be positive"));
        }
        if autosave_interval.is_some_and(|interval| interval >= lease_ttl) {
            return Err(StoreError::usage(format!(
                "PLAYERSTORE_AUTOSAVE_SECS must be below PLAYERSTORE_LEASE_TTL_SECS ({}s)",
                lease_ttl.as_secs()
            )));
        }

        Ok(Self {
            retry,
            session_start,
            autosave_interval,
            lease_ttl,
            ..defaults
        })
    }
}

fn read_u32<R>(read: &R, name: &str) -> Result<Option<u32>, StoreError>
where
    R: Fn(&str) -> Result<Option<u64>, StoreError>,
{
    read(name)?
        .map(|v| {
            u32::try_from(v).map_err(|_| StoreError::usage(format!("{} is out of range", name)))
        })
        .transpose()
}
