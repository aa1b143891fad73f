//! Environment-driven configuration.
//!
//! The admin/config surface (an HTTP API, a settings UI) is someone else's
//! problem; this module only reads the handful of knobs the engine itself
//! needs to start, with the defaults spelled out in spec terms.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub worker_pool_size: usize,
    pub max_workers_per_job: usize,
    pub default_request_timeout: Duration,
    pub default_task_timeout: Duration,
    pub stuck_task_threshold: Duration,
    pub maintenance_interval: Duration,
}

impl Config {
    /// Read from the process environment, falling back to documented
    /// defaults for everything but `DATABASE_URL`.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            database_url,
            worker_pool_size: env_parse("WORKER_POOL_SIZE", 50)?,
            max_workers_per_job: env_parse("MAX_WORKERS_PER_JOB", 20)?,
            default_request_timeout: Duration::from_secs(env_parse("DEFAULT_REQUEST_TIMEOUT", 30)?),
            default_task_timeout: Duration::from_secs(env_parse("DEFAULT_TASK_TIMEOUT", 120)?),
            stuck_task_threshold: Duration::from_secs(env_parse("STUCK_TASK_THRESHOLD", 180)?),
            maintenance_interval: Duration::from_secs(env_parse("MAINTENANCE_INTERVAL", 300)?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default() {
        let v: u64 = env_parse("CACHE_WARMER_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}
