//! Cluster-facing seams: apply and prune clients. The kube implementations
//! live here; tests substitute recording fakes.

use crate::grouping::{parse_grouping_contents, PriorGroup, PriorState, GROUPING_LABEL};
use crate::manifest::Manifest;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use berth_core::ObjId;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

pub const FIELD_MANAGER: &str = "berth";

/// Performs an idempotent server-side apply of one manifest.
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    async fn apply(&self, manifest: &Manifest) -> Result<()>;
}

/// Retrieves prior grouping objects and deletes resources by identifier.
/// NotFound on delete counts as success.
#[async_trait]
pub trait ResourcePruner: Send + Sync {
    async fn prior_state(&self, namespace: &str, set_id: &str) -> Result<PriorState>;
    async fn delete(&self, id: &ObjId) -> Result<()>;
}

/// Server-side apply against a live cluster.
pub struct SsaApplier {
    client: Client,
    dry_run: bool,
}

impl SsaApplier {
    pub fn new(client: Client, dry_run: bool) -> Self {
        Self { client, dry_run }
    }
}

#[async_trait]
impl ClusterApplier for SsaApplier {
    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        let (ar, namespaced) = berth_kubehub::resolve_gvk(
            self.client.clone(),
            &manifest.id.group,
            manifest.version(),
            &manifest.id.kind,
        )
        .await?;
        let ns = (!manifest.id.namespace.is_empty()).then_some(manifest.id.namespace.as_str());
        let api = berth_kubehub::dynamic_api(self.client.clone(), &ar, namespaced, ns)?;

        let mut params = PatchParams::apply(FIELD_MANAGER);
        if self.dry_run {
            params = params.dry_run();
        }
        api.patch(&manifest.id.name, &params, &Patch::Apply(&manifest.raw))
            .await
            .map_err(|e| anyhow!("server-side apply failed: {}", e))?;
        debug!(object = %manifest.id, dry_run = self.dry_run, "applied");
        Ok(())
    }
}

/// Prune client against a live cluster.
pub struct KubePruner {
    client: Client,
    dry_run: bool,
}

impl KubePruner {
    pub fn new(client: Client, dry_run: bool) -> Self {
        Self { client, dry_run }
    }
}

#[async_trait]
impl ResourcePruner for KubePruner {
    async fn prior_state(&self, namespace: &str, set_id: &str) -> Result<PriorState> {
        if namespace.is_empty() {
            return Err(anyhow!("grouping objects live in a namespace; none given"));
        }
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", GROUPING_LABEL, set_id));
        let list = api.list(&params).await.context("listing prior grouping objects")?;

        let mut groups = Vec::with_capacity(list.items.len());
        for cm in list.items {
            let name = cm.metadata.name.clone().unwrap_or_default();
            let id = ObjId {
                group: String::new(),
                kind: "ConfigMap".to_string(),
                namespace: namespace.to_string(),
                name,
            };
            let keys: Vec<String> = cm.data.unwrap_or_default().into_keys().collect();
            let contents = parse_grouping_contents(&id, &keys);
            groups.push(PriorGroup { id, contents });
        }
        debug!(namespace, set_id, groups = groups.len(), "prior grouping objects loaded");
        Ok(PriorState { groups })
    }

    async fn delete(&self, id: &ObjId) -> Result<()> {
        if self.dry_run {
            info!(object = %id, "dry-run: skipping delete");
            return Ok(());
        }
        let (ar, namespaced) =
            berth_kubehub::resolve_kind(self.client.clone(), &id.group_kind()).await?;
        let ns = (!id.namespace.is_empty()).then_some(id.namespace.as_str());
        let api = berth_kubehub::dynamic_api(self.client.clone(), &ar, namespaced, ns)?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is what prune wanted anyway.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", id)),
        }
    }
}

/// Pruner that never finds prior state and refuses nothing. Used when prune
/// is suppressed and by tests.
pub struct NoopPruner;

#[async_trait]
impl ResourcePruner for NoopPruner {
    async fn prior_state(&self, _namespace: &str, _set_id: &str) -> Result<PriorState> {
        Ok(PriorState::default())
    }

    async fn delete(&self, _id: &ObjId) -> Result<()> {
        Ok(())
    }
}
