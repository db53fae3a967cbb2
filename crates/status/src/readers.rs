//! Cluster readers and the fallback status computation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use berth_core::{ObjId, ResourceStatus};
use kube::Client;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::debug;

use crate::StatusObservation;

/// Computes the status of one resource identifier.
///
/// Implementations must be safe to call concurrently across distinct
/// identifiers; the engine never overlaps polls of the same identifier.
#[async_trait]
pub trait StatusReader: Send + Sync {
    async fn read_status(&self, id: &ObjId) -> Result<StatusObservation>;
}

/// Fetches one resource by identifier, optionally backed by a per-cycle cache.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn get(&self, id: &ObjId) -> Result<Option<Json>>;

    /// Refreshes any cache for the given identifier set. No-op by default.
    async fn sync(&self, ids: &[ObjId]) -> Result<()> {
        let _ = ids;
        Ok(())
    }
}

/// Issues one GET per lookup against the live cluster.
pub struct DirectClusterReader {
    client: Client,
}

impl DirectClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for DirectClusterReader {
    async fn get(&self, id: &ObjId) -> Result<Option<Json>> {
        let (ar, namespaced) =
            berth_kubehub::resolve_kind(self.client.clone(), &id.group_kind()).await?;
        let ns = (!id.namespace.is_empty()).then_some(id.namespace.as_str());
        let api = berth_kubehub::dynamic_api(self.client.clone(), &ar, namespaced, ns)?;
        match api.get_opt(&id.name).await.with_context(|| format!("fetching {}", id))? {
            Some(obj) => {
                let mut raw = serde_json::to_value(&obj).context("serializing fetched object")?;
                strip_managed_fields(&mut raw);
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }
}

fn page_limit() -> u32 {
    std::env::var("BERTH_PAGE_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(500)
}

/// Lists each distinct group-kind once per cycle and serves lookups from the
/// resulting map. Before the first `sync` it delegates to the direct reader;
/// after a sync, absence from the map means NotFound for that cycle.
pub struct CachingClusterReader {
    inner: DirectClusterReader,
    cache: tokio::sync::Mutex<Option<FxHashMap<ObjId, Json>>>,
}

impl CachingClusterReader {
    pub fn new(inner: DirectClusterReader) -> Self {
        Self { inner, cache: tokio::sync::Mutex::new(None) }
    }
}

#[async_trait]
impl ClusterReader for CachingClusterReader {
    async fn get(&self, id: &ObjId) -> Result<Option<Json>> {
        let cached = {
            let cache = self.cache.lock().await;
            cache.as_ref().map(|map| map.get(id).cloned())
        };
        match cached {
            Some(hit) => Ok(hit),
            None => self.inner.get(id).await,
        }
    }

    async fn sync(&self, ids: &[ObjId]) -> Result<()> {
        let mut scopes: Vec<(berth_core::GroupKind, String)> = Vec::new();
        for id in ids {
            let scope = (id.group_kind(), id.namespace.clone());
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }

        let mut map = FxHashMap::default();
        for (gk, namespace) in scopes {
            let (ar, namespaced) =
                berth_kubehub::resolve_kind(self.inner.client.clone(), &gk).await?;
            let ns = (!namespace.is_empty()).then_some(namespace.as_str());
            let api = berth_kubehub::dynamic_api(self.inner.client.clone(), &ar, namespaced, ns)?;

            let mut continue_token: Option<String> = None;
            loop {
                let mut params = kube::api::ListParams::default().limit(page_limit());
                if let Some(ref token) = continue_token {
                    params = params.continue_token(token);
                }
                let list = api.list(&params).await.with_context(|| format!("listing {}", gk))?;
                for obj in list.items {
                    let name = obj.metadata.name.clone().unwrap_or_default();
                    let id = ObjId {
                        group: ar.group.clone(),
                        kind: ar.kind.clone(),
                        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
                        name,
                    };
                    let mut raw =
                        serde_json::to_value(&obj).context("serializing listed object")?;
                    strip_managed_fields(&mut raw);
                    map.insert(id, raw);
                }
                continue_token = list.metadata.continue_.clone();
                if continue_token.is_none() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        debug!(objects = map.len(), "cluster cache refreshed");
        *self.cache.lock().await = Some(map);
        Ok(())
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Fallback reader: fetch the object and derive a generic status from its
/// metadata and conditions.
pub struct DefaultStatusReader {
    cluster: Arc<dyn ClusterReader>,
}

impl DefaultStatusReader {
    pub fn new(cluster: Arc<dyn ClusterReader>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl StatusReader for DefaultStatusReader {
    async fn read_status(&self, id: &ObjId) -> Result<StatusObservation> {
        match self.cluster.get(id).await? {
            None => Ok(StatusObservation {
                id: id.clone(),
                status: ResourceStatus::NotFound,
                message: None,
            }),
            Some(raw) => {
                let (status, message) = compute_status(&raw);
                Ok(StatusObservation { id: id.clone(), status, message })
            }
        }
    }
}

/// Generic status rules, in order: deletion in progress, stale observed
/// generation, negative readiness conditions, explicit failure conditions,
/// otherwise Current.
pub fn compute_status(raw: &Json) -> (ResourceStatus, Option<String>) {
    if raw.pointer("/metadata/deletionTimestamp").is_some() {
        return (ResourceStatus::Terminating, None);
    }

    let generation = raw.pointer("/metadata/generation").and_then(Json::as_i64);
    let observed = raw.pointer("/status/observedGeneration").and_then(Json::as_i64);
    if let (Some(gen), Some(obs)) = (generation, observed) {
        if obs < gen {
            return (
                ResourceStatus::InProgress,
                Some(format!("observed generation {} behind {}", obs, gen)),
            );
        }
    }

    if let Some(conditions) = raw.pointer("/status/conditions").and_then(Json::as_array) {
        for cond in conditions {
            let cond_type = cond.get("type").and_then(Json::as_str).unwrap_or("");
            let cond_status = cond.get("status").and_then(Json::as_str).unwrap_or("");
            let message = cond.get("message").and_then(Json::as_str).map(str::to_string);
            match cond_type {
                "Failed" | "ReplicaFailure" | "Stalled" if cond_status == "True" => {
                    return (ResourceStatus::Failed, message);
                }
                "Ready" | "Available" if cond_status == "False" => {
                    return (ResourceStatus::InProgress, message);
                }
                _ => {}
            }
        }
    }

    (ResourceStatus::Current, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deletion_timestamp_means_terminating() {
        let raw = json!({"metadata": {"name": "x", "deletionTimestamp": "2024-01-01T00:00:00Z"}});
        assert_eq!(compute_status(&raw).0, ResourceStatus::Terminating);
    }

    #[test]
    fn stale_observed_generation_means_in_progress() {
        let raw = json!({
            "metadata": {"name": "x", "generation": 3},
            "status": {"observedGeneration": 2}
        });
        let (status, message) = compute_status(&raw);
        assert_eq!(status, ResourceStatus::InProgress);
        assert!(message.unwrap().contains("behind"));
    }

    #[test]
    fn negative_ready_condition_means_in_progress() {
        let raw = json!({
            "metadata": {"name": "x"},
            "status": {"conditions": [
                {"type": "Available", "status": "False", "message": "waiting for pods"}
            ]}
        });
        let (status, message) = compute_status(&raw);
        assert_eq!(status, ResourceStatus::InProgress);
        assert_eq!(message.as_deref(), Some("waiting for pods"));
    }

    #[test]
    fn failure_condition_wins() {
        let raw = json!({
            "metadata": {"name": "x"},
            "status": {"conditions": [
                {"type": "ReplicaFailure", "status": "True", "message": "quota exceeded"}
            ]}
        });
        assert_eq!(compute_status(&raw).0, ResourceStatus::Failed);
    }

    #[test]
    fn settled_object_is_current() {
        let raw = json!({
            "metadata": {"name": "x", "generation": 1},
            "status": {"observedGeneration": 1, "conditions": [
                {"type": "Available", "status": "True"}
            ]}
        });
        assert_eq!(compute_status(&raw).0, ResourceStatus::Current);
    }
}
