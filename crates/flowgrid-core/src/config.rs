//! flowgrid.toml configuration parser.
//!
//! Every section is optional. Durations are human strings (`"500ms"`,
//! `"5s"`, `"2m"`) and are resolved once into [`SchedulerSettings`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowgridConfig {
    pub offers: Option<OffersConfig>,
    pub launch: Option<LaunchConfig>,
    pub failure: Option<FailureConfig>,
    pub session: Option<SessionConfig>,
    pub readiness: Option<ReadinessConfig>,
    pub driver: Option<DriverConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffersConfig {
    /// Decline offers that stay unused for this long.
    pub decline_after: Option<String>,
    /// Revive offers when tasks have been pending this long without a fit.
    pub revive_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<String>,
    pub backoff_max: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureConfig {
    pub policy: Option<FailurePolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub stop_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadinessConfig {
    pub interval: Option<String>,
    pub max_interval: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    pub tick: Option<String>,
}

/// What happens to the rest of a session when a task dies unexpectedly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the whole session.
    #[default]
    AbortSession,
    /// Stop only the failed task's transitive dependents.
    AbortSubtree,
}

/// Resolved scheduler settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub offer_decline_after: Duration,
    pub revive_interval: Duration,
    pub max_launch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub failure_policy: FailurePolicy,
    pub stop_timeout: Duration,
    pub readiness_interval: Duration,
    pub readiness_max_interval: Duration,
    pub readiness_timeout: Duration,
    pub tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            offer_decline_after: Duration::from_secs(5),
            revive_interval: Duration::from_secs(10),
            max_launch_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            failure_policy: FailurePolicy::AbortSession,
            stop_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_secs(1),
            readiness_max_interval: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(2),
            tick: Duration::from_millis(250),
        }
    }
}

impl SchedulerSettings {
    /// Delay before launch attempt `attempt + 1`, after `attempt` rejections.
    ///
    /// `base * 2^(attempt-1)`, capped at `backoff_max`.
    pub fn launch_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// Parse a duration string like `"5s"`, `"500ms"`, `"2m"` or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn resolve(field: &'static str, value: Option<&String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: raw.clone(),
        }),
    }
}

impl FlowgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A config with every setting spelled out at its default value.
    pub fn scaffold() -> Self {
        FlowgridConfig {
            offers: Some(OffersConfig {
                decline_after: Some("5s".to_string()),
                revive_interval: Some("10s".to_string()),
            }),
            launch: Some(LaunchConfig {
                max_attempts: Some(3),
                backoff_base: Some("1s".to_string()),
                backoff_max: Some("60s".to_string()),
            }),
            failure: Some(FailureConfig {
                policy: Some(FailurePolicy::AbortSession),
            }),
            session: Some(SessionConfig {
                stop_timeout: Some("30s".to_string()),
            }),
            readiness: Some(ReadinessConfig {
                interval: Some("1s".to_string()),
                max_interval: Some("30s".to_string()),
                timeout: Some("2s".to_string()),
            }),
            driver: Some(DriverConfig {
                tick: Some("250ms".to_string()),
            }),
        }
    }

    /// Resolve into concrete settings, applying defaults.
    pub fn settings(&self) -> Result<SchedulerSettings, ConfigError> {
        let d = SchedulerSettings::default();
        let offers = self.offers.clone().unwrap_or_default();
        let launch = self.launch.clone().unwrap_or_default();
        let failure = self.failure.clone().unwrap_or_default();
        let session = self.session.clone().unwrap_or_default();
        let readiness = self.readiness.clone().unwrap_or_default();
        let driver = self.driver.clone().unwrap_or_default();

        let settings = SchedulerSettings {
            offer_decline_after: resolve(
                "offers.decline_after",
                offers.decline_after.as_ref(),
                d.offer_decline_after,
            )?,
            revive_interval: resolve(
                "offers.revive_interval",
                offers.revive_interval.as_ref(),
                d.revive_interval,
            )?,
            max_launch_attempts: launch.max_attempts.unwrap_or(d.max_launch_attempts),
            backoff_base: resolve("launch.backoff_base", launch.backoff_base.as_ref(), d.backoff_base)?,
            backoff_max: resolve("launch.backoff_max", launch.backoff_max.as_ref(), d.backoff_max)?,
            failure_policy: failure.policy.unwrap_or(d.failure_policy),
            stop_timeout: resolve("session.stop_timeout", session.stop_timeout.as_ref(), d.stop_timeout)?,
            readiness_interval: resolve(
                "readiness.interval",
                readiness.interval.as_ref(),
                d.readiness_interval,
            )?,
            readiness_max_interval: resolve(
                "readiness.max_interval",
                readiness.max_interval.as_ref(),
                d.readiness_max_interval,
            )?,
            readiness_timeout: resolve("readiness.timeout", readiness.timeout.as_ref(), d.readiness_timeout)?,
            tick: resolve("driver.tick", driver.tick.as_ref(), d.tick)?,
        };

        if settings.max_launch_attempts == 0 {
            return Err(ConfigError::Invalid("launch.max_attempts must be at least 1".into()));
        }
        if settings.tick.is_zero() {
            return Err(ConfigError::Invalid("driver.tick must be positive".into()));
        }
        if settings.backoff_max < settings.backoff_base {
            return Err(ConfigError::Invalid(
                "launch.backoff_max is smaller than launch.backoff_base".into(),
            ));
        }
        Ok(settings)
    }
}
