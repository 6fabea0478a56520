// Engine configuration from the environment
//
// EngineConfig is shared by both binaries. Binaries call dotenvy before
// from_env so a local .env file works in development.

use std::time::Duration;

use crate::error::EngineError;

/// Tuning knobs and endpoints for one engine process
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection string for the persistence store
    pub database_url: String,

    /// Listen address for the HTTP surface
    pub listen_addr: String,

    /// Shared secret workers present to the controller endpoints
    pub worker_token: Option<String>,

    /// How often workers report liveness
    pub heartbeat_interval: Duration,

    /// How often the elected reaper scans for stale leases and overdue runs
    pub reap_interval: Duration,

    /// Heartbeats older than this mark a worker dead
    pub heartbeat_timeout: Duration,

    /// In-flight step limit per worker
    pub max_concurrent_steps: usize,

    /// How often the trigger engine reconciles cron jobs against the store
    pub sync_interval: Duration,

    /// Step budget per run; exceeded runs fail with `step_budget_exceeded`
    pub max_steps_per_run: u32,

    /// Grace period for in-flight steps during drain
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            listen_addr: "0.0.0.0:9000".to_string(),
            worker_token: None,
            heartbeat_interval: Duration::from_secs(5),
            reap_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_concurrent_steps: 10,
            sync_interval: Duration::from_secs(60),
            max_steps_per_run: 1000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// `DATABASE_URL` is required; everything else has defaults.
    pub fn from_env() -> Result<Self, EngineError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| EngineError::config("DATABASE_URL environment variable required"))?;

        let defaults = Self::default();

        Ok(Self {
            database_url,
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            worker_token: std::env::var("WORKER_TOKEN").ok(),
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            reap_interval: secs_var("REAP_INTERVAL", defaults.reap_interval)?,
            heartbeat_timeout: secs_var("HEARTBEAT_TIMEOUT", defaults.heartbeat_timeout)?,
            max_concurrent_steps: int_var("MAX_CONCURRENT_STEPS", defaults.max_concurrent_steps)?,
            sync_interval: secs_var("SYNC_INTERVAL", defaults.sync_interval)?,
            max_steps_per_run: int_var("MAX_STEPS_PER_RUN", defaults.max_steps_per_run)?,
            shutdown_timeout: secs_var("SHUTDOWN_TIMEOUT", defaults.shutdown_timeout)?,
        })
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, EngineError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| EngineError::config(format!("{} must be an integer (seconds)", name))),
        Err(_) => Ok(default),
    }
}

fn int_var<T>(name: &str, default: T) -> Result<T, EngineError>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| EngineError::config(format!("{} must be an integer", name))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reap_interval, Duration::from_secs(30));
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.max_steps_per_run, 1000);
    }
}
