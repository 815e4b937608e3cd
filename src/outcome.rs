//! Per-unit failure reporting
//!
//! Failures are scoped to the smallest unit that failed: one entity, one
//! relationship, or one component. They are data, not errors: a job keeps
//! going and reports every failed unit by name so a reconciliation pass can
//! re-run exactly those.

use crate::graph::EdgeKey;
use serde::{Deserialize, Serialize};

/// The unit a failure is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitId {
    Entity { name: String },
    Relationship { source: String, target: String },
    Component { index: usize },
}

impl UnitId {
    pub fn entity(name: impl Into<String>) -> Self {
        Self::Entity { name: name.into() }
    }

    pub fn relationship(key: &EdgeKey) -> Self {
        Self::Relationship {
            source: key.a.clone(),
            target: key.b.clone(),
        }
    }

    pub fn component(index: usize) -> Self {
        Self::Component { index }
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity { name } => write!(f, "entity {}", name),
            Self::Relationship { source, target } => {
                write!(f, "relationship {} -- {}", source, target)
            }
            Self::Component { index } => write!(f, "component #{}", index),
        }
    }
}

/// Why a unit failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed input record; retrying the same input cannot succeed
    Validation,
    /// Backend error that survived every retry
    Transient,
    /// Backend rejected the write (schema, serialization)
    Permanent,
    /// The unit's lock set was not granted in time
    LockTimeout,
    /// The job was cancelled before the unit ran
    Cancelled,
    /// The unit's component exceeded its time budget
    ComponentTimeout,
    /// Unexpected fault inside the engine (task panic, closed semaphore)
    Internal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation | Self::Permanent)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::LockTimeout => "lock timeout",
            Self::Cancelled => "cancelled",
            Self::ComponentTimeout => "component timeout",
            Self::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// One failed unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub kind: FailureKind,
    /// Human-readable reason
    pub reason: String,
    pub retryable: bool,
    /// Component the unit belonged to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<usize>,
}

impl UnitFailure {
    pub fn new(unit: UnitId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            unit,
            kind,
            reason: reason.into(),
            retryable: kind.is_retryable(),
            component: None,
        }
    }

    pub fn in_component(mut self, index: usize) -> Self {
        self.component = Some(index);
        self
    }
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.unit, self.kind, self.reason)
    }
}
