//! Council error types

use thiserror::Error;

use crate::types::TaskName;

/// Errors that abort a council operation.
///
/// External service failures never show up here: they are absorbed at the
/// task boundary and recorded on the task outcome instead.
#[derive(Debug, Error)]
pub enum CouncilError {
    /// Malformed plan or schema input
    #[error("Validation error: {0}")]
    Validation(String),

    /// The task graph contains a cycle
    #[error("Circular dependency detected: {0}")]
    CyclicDependency(String),

    /// A task depends on a task that is not part of the graph
    #[error("Dependency not found: task '{task}' depends on '{missing}'")]
    UnknownDependency { task: TaskName, missing: TaskName },

    /// The same task was declared twice
    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskName),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CouncilError {
    /// Structural errors signal a configuration defect in the task graph
    /// rather than a transient environment issue.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency(_) | Self::UnknownDependency { .. } | Self::DuplicateTask(_)
        )
    }
}

impl From<toml::de::Error> for CouncilError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
