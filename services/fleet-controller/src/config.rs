//! Configuration for the fleet controller.

use std::time::Duration;

use fleet_id::{IdError, WorkerName};
use fleet_reconcile::{RetryPolicy, DEFAULT_RETRY_STEPS};
use thiserror::Error;

use crate::lease::LeaseConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} is not a valid worker name")]
    InvalidWorkerName {
        var: &'static str,
        #[source]
        source: IdError,
    },

    #[error("inconsistent timing: {0}")]
    Inconsistent(String),
}

/// Fleet controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this process: Worker record name and lease holder.
    pub worker_name: WorkerName,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Name of the leader election lease.
    pub lease_name: String,

    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,

    /// Release the lease on shutdown.
    pub release_on_cancel: bool,

    pub heartbeat_interval: Duration,

    /// Time after the last heartbeat at which a Worker is evicted.
    pub heartbeat_ttl: Duration,

    /// Interval between sweep and balance passes.
    pub monitor_interval: Duration,

    /// How long to wait for background tasks on shutdown.
    pub shutdown_grace: Duration,

    /// Attempts per conditional write.
    pub retry_steps: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|var| std::env::var(var).ok())?)
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Explicit name, then the pod name when running in a cluster,
        // otherwise something random.
        let worker_name = match (lookup("FLEET_WORKER_NAME"), lookup("POD_NAME")) {
            (Some(name), _) => parse_worker_name("FLEET_WORKER_NAME", name)?,
            (None, Some(name)) => parse_worker_name("POD_NAME", name)?,
            (None, None) => WorkerName::random(),
        };

        let log_level = lookup("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let lease_name =
            lookup("FLEET_LEASE_NAME").unwrap_or_else(|| "fleet-controller".to_string());

        let release_on_cancel = lookup("FLEET_LEASE_RELEASE_ON_CANCEL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let config = Self {
            worker_name,
            log_level,
            lease_name,
            lease_duration: secs(&lookup, "FLEET_LEASE_DURATION_SECS", 60)?,
            renew_deadline: secs(&lookup, "FLEET_RENEW_DEADLINE_SECS", 15)?,
            retry_period: secs(&lookup, "FLEET_RETRY_PERIOD_SECS", 5)?,
            release_on_cancel,
            heartbeat_interval: secs(&lookup, "FLEET_HEARTBEAT_INTERVAL_SECS", 120)?,
            heartbeat_ttl: secs(&lookup, "FLEET_HEARTBEAT_TTL_SECS", 300)?,
            monitor_interval: secs(&lookup, "FLEET_MONITOR_INTERVAL_SECS", 30)?,
            shutdown_grace: secs(&lookup, "FLEET_SHUTDOWN_GRACE_SECS", 10)?,
            retry_steps: number(&lookup, "FLEET_RETRY_STEPS", DEFAULT_RETRY_STEPS)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the timing relationships the controller depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_deadline >= self.lease_duration {
            return Err(ConfigError::Inconsistent(format!(
                "renew deadline ({:?}) must be shorter than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(ConfigError::Inconsistent(format!(
                "retry period ({:?}) must be shorter than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.heartbeat_ttl <= self.heartbeat_interval {
            return Err(ConfigError::Inconsistent(format!(
                "heartbeat TTL ({:?}) must be longer than heartbeat interval ({:?})",
                self.heartbeat_ttl, self.heartbeat_interval
            )));
        }
        Ok(())
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            name: self.lease_name.clone(),
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            release_on_cancel: self.release_on_cancel,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            steps: self.retry_steps,
            ..RetryPolicy::default()
        }
    }
}

fn parse_worker_name(var: &'static str, value: String) -> Result<WorkerName, ConfigError> {
    WorkerName::new(value).map_err(|source| ConfigError::InvalidWorkerName { var, source })
}

fn number<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn secs<F>(lookup: &F, var: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = number(lookup, var, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
