//! Configuration types.

use std::time::Duration;

/// Execution-context pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrent execution contexts.
    pub max_concurrency: usize,
    /// How long an acquire request queues before failing as exhausted.
    pub acquire_timeout: Duration,
    /// Idle age after which a fully-available pool becomes disposable.
    pub idle_threshold: Duration,
    /// How often disposal eligibility is recomputed.
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            acquire_timeout: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(300), // 5 minutes
            reaper_interval: Duration::from_secs(30),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool settings.
    pub pool: PoolConfig,
    /// Whether appends to a closed stream channel surface an error
    /// instead of being dropped.
    pub strict_streams: bool,
    /// Grace period a stop request grants the interpreter before the
    /// job is forced down.
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            strict_streams: false,
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Configuration with a specific concurrency cap.
    pub fn with_max_concurrency(max: usize) -> Self {
        Self {
            pool: PoolConfig {
                max_concurrency: max,
                ..PoolConfig::default()
            },
            ..Self::default()
        }
    }
}
