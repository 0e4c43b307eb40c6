//! Fetch configuration.

use crate::{channel::ConflictPolicy, Error, Result};
use std::time::Duration;

/// Tunables for [`Fetcher`][crate::channel::Fetcher] rounds.
///
/// The defaults query one day of reports in windows of 128 bits.
///
/// # Examples
///
/// ```
/// use crowdbits::FetchConfig;
/// use std::time::Duration;
///
/// let config = FetchConfig::new()
///     .with_window_size(64)
///     .with_lookback(Duration::from_secs(7 * 24 * 60 * 60));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Bits forged per round.
    pub window_size: u32,

    /// How far back from now reports are requested.
    pub lookback: Duration,

    /// Candidates tested per key before giving up.
    pub max_forge_attempts: u32,

    /// Upper bound for a single report query.
    pub query_timeout: Duration,

    /// Extra query attempts after the first one fails.
    pub query_retries: u32,

    /// Delay before the first retry, doubled on each further retry.
    pub retry_backoff: Duration,

    /// Cap on the retry delay.
    pub max_backoff: Duration,

    /// Rounds [`fetch_message`][crate::channel::Fetcher::fetch_message] runs
    /// before returning an unfinished message.
    pub max_rounds: u32,

    /// How bits with reports for both values are resolved.
    pub conflict_policy: ConflictPolicy,
}

impl FetchConfig {
    /// Seconds in the default lookback.
    pub const DEFAULT_LOOKBACK_SECS: u64 = 24 * 60 * 60;

    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            window_size: 128,
            lookback: Duration::from_secs(Self::DEFAULT_LOOKBACK_SECS),
            max_forge_attempts: 4096,
            query_timeout: Duration::from_secs(30),
            query_retries: 2,
            retry_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_rounds: 64,
            conflict_policy: ConflictPolicy::Majority,
        }
    }

    /// Sets the number of bits forged per round.
    #[must_use]
    pub const fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets the report lookback.
    #[must_use]
    pub const fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Sets the forge attempt cap.
    #[must_use]
    pub const fn with_max_forge_attempts(mut self, attempts: u32) -> Self {
        self.max_forge_attempts = attempts;
        self
    }

    /// Sets the per-query timeout.
    #[must_use]
    pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Sets the retry count and initial backoff.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.query_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Sets the round cap for whole-message fetches.
    #[must_use]
    pub const fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub const fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be positive".into()));
        }
        if self.max_forge_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_forge_attempts must be positive".into(),
            ));
        }
        if self.lookback.is_zero() || chrono::TimeDelta::from_std(self.lookback).is_err() {
            return Err(Error::InvalidConfig(format!(
                "lookback {:?} is out of range",
                self.lookback
            )));
        }
        if self.query_timeout.is_zero() {
            return Err(Error::InvalidConfig("query_timeout must be positive".into()));
        }
        if self.max_rounds == 0 {
            return Err(Error::InvalidConfig("max_rounds must be positive".into()));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FetchConfig::default();
        assert_eq!(config.window_size, 128);
        assert_eq!(config.lookback, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = FetchConfig::new().with_window_size(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn zero_lookback_is_rejected() {
        assert!(FetchConfig::new()
            .with_lookback(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = FetchConfig::new().with_retries(5, Duration::from_secs(4));
        assert_eq!(config.backoff(0), Duration::from_secs(4));
        assert_eq!(config.backoff(1), Duration::from_secs(8));
        assert_eq!(config.backoff(2), Duration::from_secs(16));
        assert_eq!(config.backoff(3), Duration::from_secs(30));
        assert_eq!(config.backoff(40), Duration::from_secs(30));
    }
}
