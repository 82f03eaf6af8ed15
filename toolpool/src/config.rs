//! Pool configuration.
//!
//! Read once when the pool is built. The pool itself never looks at the
//! environment; [`PoolConfig::from_env`] exists for binaries that want the
//! `TOOLPOOL_*` variables.

use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 1024;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(120);

/// What happens to a context whose task timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Reject the caller and leave the context running; the entry stays busy
    /// until the context reports completion or crashes.
    #[default]
    Detach,
    /// Reject the caller, kill the context and free its capacity.
    Terminate,
}

impl std::str::FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detach" => Ok(Self::Detach),
            "terminate" | "kill" => Ok(Self::Terminate),
            other => Err(format!(
                "invalid timeout policy '{other}', expected 'detach' or 'terminate'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub memory_limit_mb: u64,
    pub task_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    /// How long a fresh context may take to report ready.
    pub spawn_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            timeout_policy: TimeoutPolicy::default(),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cap of zero would queue every task forever, so it is raised to one.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Build from `TOOLPOOL_*` environment variables, falling back to defaults
    /// for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("TOOLPOOL_MAX_CONCURRENCY") {
            let n = parse_number("TOOLPOOL_MAX_CONCURRENCY", &v)?;
            if n == 0 {
                return Err(ConfigError {
                    var: "TOOLPOOL_MAX_CONCURRENCY",
                    reason: "must be at least 1".to_string(),
                });
            }
            config.max_concurrency = n as usize;
        }
        if let Some(v) = lookup("TOOLPOOL_MEMORY_LIMIT_MB") {
            config.memory_limit_mb = parse_number("TOOLPOOL_MEMORY_LIMIT_MB", &v)?;
        }
        if let Some(v) = lookup("TOOLPOOL_TASK_TIMEOUT_MS") {
            let ms = parse_number("TOOLPOOL_TASK_TIMEOUT_MS", &v)?;
            config.task_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("TOOLPOOL_TIMEOUT_POLICY") {
            config.timeout_policy = v.parse().map_err(|reason| ConfigError {
                var: "TOOLPOOL_TIMEOUT_POLICY",
                reason,
            })?;
        }

        Ok(config)
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|e| ConfigError {
        var,
        reason: format!("'{value}': {e}"),
    })
}
