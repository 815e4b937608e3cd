//! Lock keys and ordered lock sets

use super::LockError;
use crate::graph::{EdgeKey, Workspace};
use std::collections::BTreeMap;

/// A lockable unit, namespaced by workspace
///
/// Relation endpoints are normalized so `(A, B)` and `(B, A)` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Entity {
        workspace: Workspace,
        name: String,
    },
    Relation {
        workspace: Workspace,
        source: String,
        target: String,
    },
}

impl LockKey {
    pub fn entity(workspace: &Workspace, name: &str) -> Self {
        Self::Entity {
            workspace: workspace.clone(),
            name: name.to_string(),
        }
    }

    pub fn relation(workspace: &Workspace, a: &str, b: &str) -> Self {
        let key = EdgeKey::new(a, b);
        Self::Relation {
            workspace: workspace.clone(),
            source: key.a,
            target: key.b,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        match self {
            Self::Entity { workspace, .. } | Self::Relation { workspace, .. } => workspace,
        }
    }

    /// Serialized form; its byte order is the global acquisition order.
    ///
    /// Workspaces cannot contain `/`, so keys from different workspaces
    /// never collide.
    pub fn serialized(&self) -> String {
        match self {
            Self::Entity { workspace, name } => format!("{}/entity/{}", workspace, name),
            Self::Relation {
                workspace,
                source,
                target,
            } => format!("{}/relation/{}\u{1f}{}", workspace, source, target),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entity { workspace, name } => write!(f, "{}:entity({})", workspace, name),
            Self::Relation {
                workspace,
                source,
                target,
            } => write!(f, "{}:relation({}, {})", workspace, source, target),
        }
    }
}

/// The keys one logical operation needs, kept in acquisition order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    keys: BTreeMap<String, LockKey>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One entity key
    pub fn for_entity(workspace: &Workspace, name: &str) -> Self {
        let mut set = Self::new();
        set.insert(LockKey::entity(workspace, name));
        set
    }

    /// Both endpoint entity keys plus the relation key
    pub fn for_relationship(workspace: &Workspace, a: &str, b: &str) -> Self {
        let mut set = Self::new();
        set.insert(LockKey::entity(workspace, a));
        set.insert(LockKey::entity(workspace, b));
        set.insert(LockKey::relation(workspace, a, b));
        set
    }

    pub fn insert(&mut self, key: LockKey) {
        self.keys.insert(key.serialized(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Serialized keys in acquisition order
    pub fn ordered_keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.keys.values()
    }

    /// Reject empty sets and sets spanning more than one workspace
    pub fn validate(&self) -> Result<&Workspace, LockError> {
        let mut keys = self.keys.values();
        let first = keys.next().ok_or(LockError::EmptySet)?.workspace();
        if let Some(other) = keys.find(|k| k.workspace() != first) {
            return Err(LockError::MixedWorkspaces {
                first: first.to_string(),
                second: other.workspace().to_string(),
            });
        }
        Ok(first)
    }
}
