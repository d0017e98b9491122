//! Configuration for coordination primitives.
//!
//! Values are layered: hardcoded defaults, then an optional TOML file, then
//! `WARDEN_*` environment variables. [`CoordinationConfig::validate`] runs
//! last and rejects combinations that would break lease safety, such as a
//! renewal interval that is not comfortably inside the TTL.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::info;

use crate::constants::DEFAULT_CAMPAIGN_MAX_BACKOFF_MS;
use crate::constants::DEFAULT_CAMPAIGN_MIN_BACKOFF_MS;
use crate::constants::DEFAULT_HEALTH_POLL_INTERVAL_MS;
use crate::constants::DEFAULT_HEALTH_PROBE_TIMEOUT_MS;
use crate::constants::DEFAULT_KEEPALIVE_TIMEOUT_MS;
use crate::constants::DEFAULT_RENEW_INITIAL_BACKOFF_MS;
use crate::constants::DEFAULT_RENEW_MAX_BACKOFF_MS;
use crate::constants::DEFAULT_REVOKE_TIMEOUT_MS;
use crate::constants::DEFAULT_SESSION_TTL_MS;
use crate::constants::MAX_TRANSIENT_RETRIES;
use crate::constants::TRANSIENT_RETRY_INITIAL_BACKOFF_MS;
use crate::constants::TRANSIENT_RETRY_MAX_BACKOFF_MS;
use crate::error::ConfigError;
use crate::error::InvalidEnvSnafu;
use crate::error::ParseSnafu;
use crate::error::ReadFileSnafu;
use crate::error::ValidationSnafu;
use crate::verified::compute_renew_interval_ms;

/// Top-level coordination configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub session: SessionConfig,
    pub election: ElectionConfig,
    pub lock: LockConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
}

/// Session lease and renewal settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lease TTL used by [`crate::SessionManager::start_default`].
    pub ttl_ms: u64,
    /// Renewal cadence. `None` derives TTL/3.
    pub renew_interval_ms: Option<u64>,
    /// Timeout for a single keep-alive call.
    pub keepalive_timeout_ms: u64,
    /// First retry delay after a failed keep-alive.
    pub renew_initial_backoff_ms: u64,
    /// Cap on the retry delay after repeated failures.
    pub renew_max_backoff_ms: u64,
    /// Timeout for the best-effort revoke on close.
    pub revoke_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_SESSION_TTL_MS,
            renew_interval_ms: None,
            keepalive_timeout_ms: DEFAULT_KEEPALIVE_TIMEOUT_MS,
            renew_initial_backoff_ms: DEFAULT_RENEW_INITIAL_BACKOFF_MS,
            renew_max_backoff_ms: DEFAULT_RENEW_MAX_BACKOFF_MS,
            revoke_timeout_ms: DEFAULT_REVOKE_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Default TTL as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Renewal cadence for a lease of `ttl_ms`, always below half the TTL.
    pub fn renew_interval_for(&self, ttl_ms: u64) -> Duration {
        Duration::from_millis(compute_renew_interval_ms(ttl_ms, self.renew_interval_ms))
    }
}

/// Election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Upper bound on a blocking campaign. `None` waits until cancelled.
    pub campaign_timeout_ms: Option<u64>,
    /// Minimum randomized delay before re-contending.
    pub min_backoff_ms: u64,
    /// Maximum randomized delay before re-contending.
    pub max_backoff_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            campaign_timeout_ms: None,
            min_backoff_ms: DEFAULT_CAMPAIGN_MIN_BACKOFF_MS,
            max_backoff_ms: DEFAULT_CAMPAIGN_MAX_BACKOFF_MS,
        }
    }
}

impl ElectionConfig {
    pub fn campaign_timeout(&self) -> Option<Duration> {
        self.campaign_timeout_ms.map(Duration::from_millis)
    }
}

/// Lock settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Upper bound on a blocking acquire. `None` waits until cancelled.
    pub acquire_timeout_ms: Option<u64>,
    /// Identifier written into waiter entries. `None` uses the session ID.
    pub holder_id: Option<String>,
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Poll cadence.
    pub poll_interval_ms: u64,
    /// Timeout for one status poll or probe write.
    pub probe_timeout_ms: u64,
    /// Quorum loss must last longer than this before `degraded` is raised.
    /// `None` uses the session TTL.
    pub degraded_after_ms: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_HEALTH_POLL_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_HEALTH_PROBE_TIMEOUT_MS,
            degraded_after_ms: None,
        }
    }
}

/// Retry budget for transient store errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_TRANSIENT_RETRIES,
            initial_backoff_ms: TRANSIENT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: TRANSIENT_RETRY_MAX_BACKOFF_MS,
        }
    }
}

impl CoordinationConfig {
    /// Parse a TOML document. Missing sections and fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).context(ParseSnafu)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration with layered precedence, highest first:
    /// - `WARDEN_*` environment variables
    /// - the TOML file at `path`, if given
    /// - hardcoded defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "loading coordination config");
                Self::from_toml_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where F: Fn(&str) -> Option<String> {
        let env = EnvReader { lookup };
        if let Some(v) = env.u64("WARDEN_SESSION_TTL_MS")? {
            self.session.ttl_ms = v;
        }
        if let Some(v) = env.u64("WARDEN_SESSION_RENEW_INTERVAL_MS")? {
            self.session.renew_interval_ms = Some(v);
        }
        if let Some(v) = env.u64("WARDEN_SESSION_KEEPALIVE_TIMEOUT_MS")? {
            self.session.keepalive_timeout_ms = v;
        }
        if let Some(v) = env.u64("WARDEN_ELECTION_CAMPAIGN_TIMEOUT_MS")? {
            self.election.campaign_timeout_ms = Some(v);
        }
        if let Some(v) = env.u64("WARDEN_LOCK_ACQUIRE_TIMEOUT_MS")? {
            self.lock.acquire_timeout_ms = Some(v);
        }
        if let Some(v) = (env.lookup)("WARDEN_LOCK_HOLDER_ID") {
            self.lock.holder_id = Some(v);
        }
        if let Some(v) = env.u64("WARDEN_HEALTH_POLL_INTERVAL_MS")? {
            self.health.poll_interval_ms = v;
        }
        if let Some(v) = env.u64("WARDEN_HEALTH_DEGRADED_AFTER_MS")? {
            self.health.degraded_after_ms = Some(v);
        }
        if let Some(v) = env.u32("WARDEN_RETRY_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        Ok(())
    }

    /// Check range and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        ensure_field(session.ttl_ms > 0, "session.ttl_ms", "must be positive")?;
        if let Some(interval) = session.renew_interval_ms {
            ensure_field(interval > 0, "session.renew_interval_ms", "must be positive")?;
            ensure_field(
                interval.saturating_mul(2) < session.ttl_ms,
                "session.renew_interval_ms",
                "must be below half of session.ttl_ms",
            )?;
        }
        ensure_field(
            session.keepalive_timeout_ms > 0 && session.keepalive_timeout_ms < session.ttl_ms,
            "session.keepalive_timeout_ms",
            "must be positive and below session.ttl_ms",
        )?;
        ensure_field(
            session.renew_initial_backoff_ms > 0 && session.renew_initial_backoff_ms <= session.renew_max_backoff_ms,
            "session.renew_initial_backoff_ms",
            "must be positive and at most session.renew_max_backoff_ms",
        )?;
        ensure_field(
            self.election.min_backoff_ms <= self.election.max_backoff_ms,
            "election.min_backoff_ms",
            "must be at most election.max_backoff_ms",
        )?;
        ensure_field(self.health.poll_interval_ms > 0, "health.poll_interval_ms", "must be positive")?;
        ensure_field(self.health.probe_timeout_ms > 0, "health.probe_timeout_ms", "must be positive")?;
        ensure_field(self.retry.max_attempts > 0, "retry.max_attempts", "must be positive")?;
        ensure_field(
            self.retry.initial_backoff_ms <= self.retry.max_backoff_ms,
            "retry.initial_backoff_ms",
            "must be at most retry.max_backoff_ms",
        )?;
        Ok(())
    }
}

fn ensure_field(condition: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
    if condition {
        return Ok(());
    }
    ValidationSnafu { field, reason }.fail()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where F: Fn(&str) -> Option<String>
{
    fn u64(&self, variable: &str) -> Result<Option<u64>, ConfigError> {
        self.parse(variable)
    }

    fn u32(&self, variable: &str) -> Result<Option<u32>, ConfigError> {
        self.parse(variable)
    }

    fn parse<T: std::str::FromStr>(&self, variable: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = (self.lookup)(variable) else {
            return Ok(None);
        };
        match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => InvalidEnvSnafu { variable, value }.fail(),
        }
    }
}
