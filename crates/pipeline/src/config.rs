//! Pipeline configuration loaded from environment variables.

use std::time::Duration;

use coursecast_core::backoff::RetryPolicy;

/// Tunables for the worker pool, queue, and reconciliation poller.
///
/// All fields have defaults suitable for local development; production
/// overrides come from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent worker loops (default: `5`, sized to provider limits).
    pub worker_count: usize,
    /// Submission quota shared by all workers (default: `10`/minute).
    pub submits_per_minute: u32,
    /// Queue lease visibility timeout (default: `60` s).
    pub visibility_timeout: Duration,
    /// How often an idle worker re-checks the queue (default: `1` s).
    pub idle_poll_interval: Duration,
    /// Retry budget for new jobs (default: `3`).
    pub max_retries: i32,
    /// Backoff schedule applied by the queue on nack.
    pub retry_policy: RetryPolicy,
    /// Per-call timeout for provider submissions (default: `30` s).
    pub submit_timeout: Duration,
    /// Wait after submission before the first poll (default: `5` s).
    pub poll_grace: Duration,
    /// Interval between provider polls (default: `5` s).
    pub poll_interval: Duration,
    /// Maximum polls before the attempt times out (default: `120`).
    pub poll_budget: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            submits_per_minute: 10,
            visibility_timeout: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_policy: RetryPolicy::default(),
            submit_timeout: Duration::from_secs(30),
            poll_grace: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            poll_budget: 120,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default |
    /// |--------------------------|---------|
    /// | `WORKER_COUNT`           | `5`     |
    /// | `SUBMITS_PER_MINUTE`     | `10`    |
    /// | `VISIBILITY_TIMEOUT_SECS`| `60`    |
    /// | `MAX_RETRIES`            | `3`     |
    /// | `SUBMIT_TIMEOUT_SECS`    | `30`    |
    /// | `POLL_GRACE_SECS`        | `5`     |
    /// | `POLL_INTERVAL_SECS`     | `5`     |
    /// | `POLL_BUDGET`            | `120`   |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parsed("WORKER_COUNT", defaults.worker_count),
            submits_per_minute: env_parsed("SUBMITS_PER_MINUTE", defaults.submits_per_minute),
            visibility_timeout: env_secs("VISIBILITY_TIMEOUT_SECS", defaults.visibility_timeout),
            idle_poll_interval: defaults.idle_poll_interval,
            max_retries: env_parsed("MAX_RETRIES", defaults.max_retries),
            retry_policy: defaults.retry_policy,
            submit_timeout: env_secs("SUBMIT_TIMEOUT_SECS", defaults.submit_timeout),
            poll_grace: env_secs("POLL_GRACE_SECS", defaults.poll_grace),
            poll_interval: env_secs("POLL_INTERVAL_SECS", defaults.poll_interval),
            poll_budget: env_parsed("POLL_BUDGET", defaults.poll_budget),
        }
    }
}

/// Read an env var and parse it, falling back to `default` when unset.
///
/// Panics on a present-but-unparsable value: a typo in deployment config
/// should fail fast at startup rather than run with a silent default.
fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .unwrap_or_else(|_| panic!("{name} must be a valid value, got '{value}'")),
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parsed(name, default.as_secs()))
}
