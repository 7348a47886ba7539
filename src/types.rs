//! Shared identifiers and state enums

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CouncilError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a single executor run
    RunId
);
uuid_id!(
    /// Identifies a batch job
    JobId
);

/// Caller-assigned identifier of a batch item
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The closed set of analysis domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    Legal,
    Compliance,
    Finance,
    Operations,
}

impl TaskName {
    /// Every domain in canonical execution order
    pub const CANONICAL: [TaskName; 4] = [
        TaskName::Legal,
        TaskName::Compliance,
        TaskName::Finance,
        TaskName::Operations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legal => "legal",
            Self::Compliance => "compliance",
            Self::Finance => "finance",
            Self::Operations => "operations",
        }
    }

    /// Position in the canonical ordering
    pub fn rank(&self) -> usize {
        Self::CANONICAL
            .iter()
            .position(|name| name == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskName {
    type Err = CouncilError;

    /// Accepts `legal`, `Legal`, `LegalAgent`, `legal_agent` and `Legal Agent`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let stem = normalized.strip_suffix("agent").unwrap_or(&normalized);

        match stem {
            "legal" => Ok(Self::Legal),
            "compliance" => Ok(Self::Compliance),
            "finance" | "financial" => Ok(Self::Finance),
            "operations" | "operational" => Ok(Self::Operations),
            _ => Err(CouncilError::Validation(format!("unknown task name: {s:?}"))),
        }
    }
}

/// Per-task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Executor run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Building,
    Executing,
    Complete,
}
