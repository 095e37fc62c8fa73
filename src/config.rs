//! Environment-driven configuration

use std::env;
use std::time::Duration;

/// Deployment environment (`APP_ENV`), `sandbox` when unset
pub fn get_environment() -> String {
    env::var("APP_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

pub fn get_redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Settings shared by the queue manager, its workers and the domain modules
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Default in-process parallelism per worker
    pub concurrency: usize,
    /// How long `shutdown()` waits for in-flight jobs
    pub drain_timeout: Duration,
    /// Sleep between fetches when a queue is empty or paused
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff
    pub backoff: Duration,
    /// A fetched job not settled within this window is treated as stalled
    pub lease: Duration,
    pub queue_prefix: String,
    pub health_check_timeout: Duration,
    /// Ops HTTP port, 0 disables the server
    pub port: u16,
    pub modules: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            lease: Duration::from_secs(300),
            queue_prefix: "jobrelay".to_string(),
            health_check_timeout: Duration::from_millis(2000),
            port: 8080,
            modules: vec!["financial".to_string(), "trading".to_string()],
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let modules = env::var("WORKER_MODULES")
            .map(|v| {
                v.split(',')
                    .map(|m| m.trim().to_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.modules);

        Self {
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency).max(1),
            drain_timeout: Duration::from_secs(env_or(
                "WORKER_DRAIN_TIMEOUT_SECONDS",
                defaults.drain_timeout.as_secs(),
            )),
            poll_interval: Duration::from_millis(env_or(
                "WORKER_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff: Duration::from_millis(env_or(
                "JOB_BACKOFF_MS",
                defaults.backoff.as_millis() as u64,
            )),
            lease: Duration::from_secs(env_or("JOB_LEASE_SECONDS", defaults.lease.as_secs())),
            queue_prefix: env::var("QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            health_check_timeout: Duration::from_millis(env_or(
                "HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout.as_millis() as u64,
            )),
            port: env_or("PORT", defaults.port),
            modules,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }
}
