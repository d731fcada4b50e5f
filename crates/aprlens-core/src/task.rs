//! Task kinds, execution policy and task definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::CoreError;

/// Pipeline stage a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Independent metric analysis tasks.
    Analysis,
    /// Cross-reference of analysis findings against tickets and pull requests.
    Linking,
    /// Final report synthesis.
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Analysis => "analysis",
            Self::Linking => "linking",
            Self::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

/// The fixed set of worker identities.
///
/// The derived ordering follows declaration order, so maps keyed by
/// `TaskKind` iterate analysis kinds in [`TaskKind::ANALYSIS`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// POI availability metrics.
    Pav,
    /// POI positional accuracy metrics.
    Ppa,
    /// Superfluous POI metrics.
    Sup,
    /// Duplicate POI metrics.
    Dup,
    /// Ticket and pull request linker.
    Linker,
    /// Report synthesis.
    Synthesis,
}

impl TaskKind {
    /// Analysis kinds in the deterministic order used for every concatenation.
    pub const ANALYSIS: [TaskKind; 4] = [Self::Pav, Self::Ppa, Self::Sup, Self::Dup];

    /// Every kind, in pipeline order.
    pub const ALL: [TaskKind; 6] = [
        Self::Pav,
        Self::Ppa,
        Self::Sup,
        Self::Dup,
        Self::Linker,
        Self::Synthesis,
    ];

    /// Stage this kind runs in.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Pav | Self::Ppa | Self::Sup | Self::Dup => Stage::Analysis,
            Self::Linker => Stage::Linking,
            Self::Synthesis => Stage::Synthesis,
        }
    }

    /// Returns true for the parallel analysis kinds.
    pub fn is_analysis(&self) -> bool {
        self.stage() == Stage::Analysis
    }

    /// Upper-case label used in composed inputs and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pav => "PAV",
            Self::Ppa => "PPA",
            Self::Sup => "SUP",
            Self::Dup => "DUP",
            Self::Linker => "LINKER",
            Self::Synthesis => "SYNTHESIS",
        }
    }

    /// Lower-case name, stable across releases (file names, config keys).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pav => "pav",
            Self::Ppa => "ppa",
            Self::Sup => "sup",
            Self::Dup => "dup",
            Self::Linker => "linker",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::UnknownTaskKind(s.to_string()))
    }
}

/// Retry and timeout policy of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Total wall-clock budget across every attempt.
    pub timeout: Duration,
    /// Attempts after the first one.
    pub max_retries: u32,
}

impl ExecutionPolicy {
    /// Default budget for analysis tasks.
    pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(360);
    /// Default budget for the linking and synthesis tasks, which issue many
    /// capability calls per run.
    pub const EXTENDED_TIMEOUT: Duration = Duration::from_secs(600);
    /// Default retry count.
    pub const DEFAULT_MAX_RETRIES: u32 = 2;

    /// Create a new policy.
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }

    /// Default policy for a given kind.
    pub fn for_kind(kind: TaskKind) -> Self {
        let timeout = match kind.stage() {
            Stage::Analysis => Self::ANALYSIS_TIMEOUT,
            Stage::Linking | Stage::Synthesis => Self::EXTENDED_TIMEOUT,
        };
        Self::new(timeout, Self::DEFAULT_MAX_RETRIES)
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Everything the backend needs to create one worker.
///
/// Definitions are built once at pipeline start and never mutated afterwards;
/// the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Worker identity.
    pub kind: TaskKind,

    /// Worker name registered with the backend.
    pub name: String,

    /// Model deployment the worker runs on.
    pub model: String,

    /// Named capabilities the worker may invoke during a run.
    pub capabilities: Vec<String>,

    /// Opaque instruction payload.
    pub instructions: String,

    /// Human-readable description.
    pub description: Option<String>,

    /// Retry and timeout policy.
    pub policy: ExecutionPolicy,
}

impl TaskDefinition {
    /// Create a definition with the kind's default policy and no capabilities.
    pub fn new(kind: TaskKind, model: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            kind,
            name: format!("{}_Agent", kind.label()),
            model: model.into(),
            capabilities: Vec::new(),
            instructions: instructions.into(),
            description: None,
            policy: ExecutionPolicy::for_kind(kind),
        }
    }

    /// Builder method to add a capability.
    pub fn with_capability(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.capabilities.contains(&name) {
            self.capabilities.push(name);
        }
        self
    }

    /// Builder method to add several capabilities.
    pub fn with_capabilities<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .fold(self, |def, name| def.with_capability(name))
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder method to set the policy.
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Stage this definition runs in.
    pub fn stage(&self) -> Stage {
        self.kind.stage()
    }
}
