//! Execution core configuration.
//!
//! Every setting has a default; `from_env` overrides them from `MOLFLOW_*`
//! environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::worker::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How a newly created execution is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run in the caller's task; `start` returns the settled status.
    #[default]
    Inline,
    /// Hand off to a spawned task; `start` returns immediately.
    Dispatched,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "dispatched" => Ok(Self::Dispatched),
            other => Err(format!("expected 'inline' or 'dispatched', got '{other}'")),
        }
    }
}

/// Retry scheduler and stalled-run reaper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Maximum executions handled per tick
    pub batch_size: usize,
    /// `PENDING` rows older than this are assumed to have lost their dispatch.
    pub pending_grace: Duration,
    /// `RUNNING` rows not written for this long are assumed abandoned.
    pub running_lease: Duration,
    /// Also re-dispatch `WAITING_RESUME` rows.
    pub resume_suspended: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 32,
            pending_grace: Duration::from_secs(60),
            running_lease: Duration::from_secs(900),
            resume_suspended: true,
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub retry: RetryPolicy,
    /// Upper bound on one attempt of a unit of work.
    pub work_timeout: Duration,
    pub scheduler: SchedulerConfig,
    pub relay: RelayConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Inline,
            retry: RetryPolicy::default(),
            work_timeout: Duration::from_secs(300),
            scheduler: SchedulerConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl ExecutionConfig {
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn dispatched() -> Self {
        Self::default().with_mode(ExecutionMode::Dispatched)
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = timeout;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        if let Some(mode) = env.parse::<ExecutionMode>("MOLFLOW_EXECUTION_MODE")? {
            config.mode = mode;
        }

        if let Some(n) = env.parse::<u32>("MOLFLOW_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = env.parse::<u64>("MOLFLOW_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("MOLFLOW_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = env.parse::<f64>("MOLFLOW_RETRY_JITTER")? {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::Invalid {
                    key: "MOLFLOW_RETRY_JITTER",
                    value: jitter.to_string(),
                    reason: "must be between 0.0 and 1.0".to_string(),
                });
            }
            config.retry.jitter = jitter;
        }
        if config.retry.base_delay > config.retry.max_delay {
            return Err(ConfigError::Invalid {
                key: "MOLFLOW_RETRY_BASE_MS",
                value: config.retry.base_delay.as_millis().to_string(),
                reason: "must not exceed MOLFLOW_RETRY_MAX_MS".to_string(),
            });
        }

        if let Some(secs) = env.parse::<u64>("MOLFLOW_WORK_TIMEOUT_SECS")? {
            config.work_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = env.parse::<u64>("MOLFLOW_SCHEDULER_POLL_MS")? {
            config.scheduler.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse::<usize>("MOLFLOW_SCHEDULER_BATCH")? {
            config.scheduler.batch_size = n;
        }
        if let Some(secs) = env.parse::<u64>("MOLFLOW_PENDING_GRACE_SECS")? {
            config.scheduler.pending_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse::<u64>("MOLFLOW_RUNNING_LEASE_SECS")? {
            config.scheduler.running_lease = Duration::from_secs(secs);
        }
        if let Some(flag) = env.parse::<bool>("MOLFLOW_RESUME_SUSPENDED")? {
            config.scheduler.resume_suspended = flag;
        }

        if let Some(ms) = env.parse::<u64>("MOLFLOW_RELAY_POLL_MS")? {
            config.relay.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse::<usize>("MOLFLOW_RELAY_BATCH")? {
            config.relay.batch_size = n;
        }

        // A live attempt must settle before the reaper considers it stalled.
        if config.work_timeout >= config.scheduler.running_lease {
            return Err(ConfigError::Invalid {
                key: "MOLFLOW_WORK_TIMEOUT_SECS",
                value: config.work_timeout.as_secs().to_string(),
                reason: "must be shorter than MOLFLOW_RUNNING_LEASE_SECS".to_string(),
            });
        }

        Ok(config)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.0)(key) else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
    }
}
