//! Berth core types: resource identifiers and observed statuses.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced when building or parsing an [`ObjId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("resource name is empty")]
    EmptyName,
    #[error("resource group and kind are both empty")]
    EmptyGroupKind,
    #[error("malformed identifier {0:?}: expected namespace_name_group_kind")]
    Malformed(String),
}

/// Uniquely names one resource in a cluster: {group, kind, namespace, name}.
/// Cluster-scoped resources carry an empty namespace. Equality is field-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjId {
    /// Builds an identifier, trimming surrounding whitespace from every field.
    /// The name must be non-empty; group and kind must not both be empty.
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Result<Self, IdError> {
        let group = group.trim();
        let kind = kind.trim();
        let namespace = namespace.trim();
        let name = name.trim();
        if name.is_empty() {
            return Err(IdError::EmptyName);
        }
        if group.is_empty() && kind.is_empty() {
            return Err(IdError::EmptyGroupKind);
        }
        Ok(Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

/// The persisted text form is `namespace_name_group_kind`, with an empty
/// namespace rendered as an empty leading segment. Kubernetes names, groups
/// and kinds cannot contain underscores, so the form is unambiguous.
impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.namespace, self.name, self.group, self.kind)
    }
}

impl FromStr for ObjId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, '_').collect();
        if parts.len() != 4 {
            return Err(IdError::Malformed(s.to_string()));
        }
        ObjId::new(parts[2], parts[3], parts[0], parts[1])
    }
}

/// Group + kind pair, used to key per-kind behavior (status readers, caches).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Latest observed condition of one resource.
/// `Current` is the terminal healthy state; `InProgress` covers every
/// non-terminal transient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    Unknown,
    InProgress,
    Current,
    Failed,
    Terminating,
    NotFound,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Unknown => "Unknown",
            ResourceStatus::InProgress => "InProgress",
            ResourceStatus::Current => "Current",
            ResourceStatus::Failed => "Failed",
            ResourceStatus::Terminating => "Terminating",
            ResourceStatus::NotFound => "NotFound",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
