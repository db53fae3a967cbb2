//! Typed wrapper over one desired-state document.

use crate::error::EngineError;
use berth_core::ObjId;
use serde_json::Value as Json;

/// One manifest destined for the cluster: its identifier, declared
/// apiVersion and the raw payload pushed on apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub id: ObjId,
    pub api_version: String,
    pub raw: Json,
}

impl Manifest {
    /// Validates the fields every manifest must carry and extracts the
    /// identifier. Namespace is optional (cluster-scoped resources omit it).
    pub fn from_json(raw: Json) -> Result<Self, EngineError> {
        let api_version = raw
            .get("apiVersion")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Input("manifest missing apiVersion".into()))?
            .to_string();
        let kind = raw
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Input("manifest missing kind".into()))?;
        let name = raw
            .pointer("/metadata/name")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Input("manifest missing metadata.name".into()))?;
        let namespace = raw.pointer("/metadata/namespace").and_then(Json::as_str).unwrap_or("");

        let group = match api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        };
        let id = ObjId::new(group, kind, namespace, name)
            .map_err(|e| EngineError::Input(e.to_string()))?;
        Ok(Self { id, api_version, raw })
    }

    /// The version segment of the declared apiVersion.
    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, version)) => version,
            None => &self.api_version,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.raw.pointer("/metadata/labels").and_then(|l| l.get(key)).and_then(Json::as_str)
    }
}

// Prerequisite kinds first: namespaces and cluster scaffolding before
// configuration, configuration before workloads.
const KIND_ORDER: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "StorageClass",
    "ServiceAccount",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Secret",
    "ConfigMap",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "Service",
];

fn apply_priority(kind: &str) -> usize {
    KIND_ORDER.iter().position(|k| *k == kind).unwrap_or(KIND_ORDER.len())
}

/// Orders manifests by kind priority; stable within a priority class.
pub fn sort_manifests(manifests: &mut [Manifest]) {
    manifests.sort_by_key(|m| apply_priority(&m.id.kind));
}
