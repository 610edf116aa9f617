use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tuning. `Default` gives production values; `from_env` layers
/// `REPLICANT_*` overrides on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Feed channel and coalescer capacity; a full coalescer forces a flush.
    pub queue_cap: usize,
    /// How often coalesced events are applied.
    pub flush_interval: Duration,
    /// Periodic re-evaluation of every controller. `None` disables it.
    pub resync_interval: Option<Duration>,
    /// Threads used to plan independent controllers in one pass.
    pub workers: usize,
    /// Upper bound on actions emitted for one controller in one pass.
    pub max_actions_per_pass: usize,
    /// Kind of resource created for under-provisioned controllers.
    pub resource_kind: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_cap: 4096,
            flush_interval: Duration::from_millis(8),
            resync_interval: Some(Duration::from_secs(300)),
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            max_actions_per_pass: 1000,
            resource_kind: "Pod".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("REPLICANT_QUEUE_CAP") { cfg.queue_cap = v.max(1); }
        if let Some(v) = env_parse::<u64>("REPLICANT_FLUSH_MS") { cfg.flush_interval = Duration::from_millis(v.max(1)); }
        if let Some(v) = env_parse::<u64>("REPLICANT_RESYNC_SECS") {
            cfg.resync_interval = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        if let Some(v) = env_parse::<usize>("REPLICANT_WORKERS") { cfg.workers = v.max(1); }
        if let Some(v) = env_parse::<usize>("REPLICANT_MAX_ACTIONS_PER_PASS") { cfg.max_actions_per_pass = v.max(1); }
        if let Ok(kind) = std::env::var("REPLICANT_RESOURCE_KIND") {
            if !kind.trim().is_empty() { cfg.resource_kind = kind.trim().to_string(); }
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}
