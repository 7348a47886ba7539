//! Council configuration
//!
//! Every field carries a serde default so partial TOML files are valid.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::CouncilError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CouncilConfig {
    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

impl CouncilConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CouncilError> {
        let cfg: CouncilConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading council config {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parsing council config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), CouncilError> {
        if self.planner.timeout_secs == 0 {
            return Err(CouncilError::Config("planner.timeout_secs must be > 0".into()));
        }
        if self.executor.task_timeout_secs == 0 {
            return Err(CouncilError::Config("executor.task_timeout_secs must be > 0".into()));
        }
        if self.batch.item_timeout_secs == 0 {
            return Err(CouncilError::Config("batch.item_timeout_secs must be > 0".into()));
        }
        if let CacheEpoch::Fixed(label) = &self.cache.epoch {
            if label.trim().is_empty() {
                return Err(CouncilError::Config("cache.epoch fixed label is empty".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Upper bound on the single planning call
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_planner_timeout_secs() -> u64 {
    30
}

impl PlannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

/// How independent tasks are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Chunks requested from the retrieval collaborator per task
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Serve a task from an exact cache hit instead of running it
    #[serde(default)]
    pub reuse_cached: bool,

    /// Length cap for summaries appended to the accumulated context
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_retrieval_top_k() -> usize {
    2
}

fn default_summary_chars() -> usize {
    1200
}

impl ExecutorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            task_timeout_secs: default_task_timeout_secs(),
            retrieval_top_k: default_retrieval_top_k(),
            reuse_cached: false,
            summary_chars: default_summary_chars(),
        }
    }
}

/// Date component of cache keys
///
/// `Daily` buckets by UTC calendar date, so identical analyses on different
/// days never share a key. `Fixed` pins the bucket to a label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEpoch {
    #[default]
    Daily,
    Fixed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub epoch: CacheEpoch,

    #[serde(default = "default_similar_top_k")]
    pub similar_top_k: usize,
}

fn default_similar_top_k() -> usize {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            epoch: CacheEpoch::default(),
            similar_top_k: default_similar_top_k(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_item_timeout_secs() -> u64 {
    300
}

impl BatchConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            item_timeout_secs: default_item_timeout_secs(),
        }
    }
}
