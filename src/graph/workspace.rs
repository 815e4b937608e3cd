//! Workspace: the tenant namespace every record, lock and storage row lives in

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while constructing graph identifiers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("workspace identifier cannot be empty")]
    EmptyWorkspace,

    #[error("invalid workspace identifier {0:?}: must not contain '/' or control characters")]
    InvalidWorkspace(String),
}

/// Unique identifier for a tenant workspace
///
/// Serializes as a plain string. The identifier may not contain `/`, which
/// is the separator used by serialized lock keys, so the workspace prefix of
/// a key is always unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workspace(String);

impl Workspace {
    /// Create a workspace from an identifier, trimming surrounding whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, GraphError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(GraphError::EmptyWorkspace);
        }
        if trimmed.contains('/') || trimmed.chars().any(char::is_control) {
            return Err(GraphError::InvalidWorkspace(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Workspace {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Workspace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
