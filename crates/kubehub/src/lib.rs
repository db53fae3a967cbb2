//! Berth kubehub: shared client, API discovery and group/kind resolution.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use berth_core::GroupKind;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

// Reuse a single kube Client across calls to avoid costly TLS/config setup.
static KUBE_CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();

pub async fn get_kube_client() -> Result<Client> {
    KUBE_CLIENT
        .get_or_try_init(|| async {
            Client::try_default().await.context("building kube client")
        })
        .await
        .map(|c| c.clone())
}

// Resolution cache: group/kind -> (ApiResource, namespaced)
static RESOLUTION_CACHE: Lazy<RwLock<FxHashMap<(String, String), (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(FxHashMap::default()));

/// Resolves a group/kind to its served `ApiResource` and scope, version-agnostic
/// (the server's recommended version wins). Results are cached in memory and,
/// best-effort, on disk.
pub async fn resolve_kind(client: Client, gk: &GroupKind) -> Result<(ApiResource, bool)> {
    let key = (gk.group.clone(), gk.kind.clone());
    if let Some(hit) = RESOLUTION_CACHE.read().unwrap().get(&key).cloned() {
        return Ok(hit);
    }
    run_discovery(client).await?;
    RESOLUTION_CACHE
        .read()
        .unwrap()
        .get(&key)
        .cloned()
        .ok_or_else(|| anyhow!("group/kind not served by cluster: {}", gk))
}

/// Resolves an exact group/version/kind, e.g. for a manifest's declared
/// apiVersion. Falls back to a full discovery run on a cache miss.
pub async fn resolve_gvk(
    client: Client,
    group: &str,
    version: &str,
    kind: &str,
) -> Result<(ApiResource, bool)> {
    let key = (group.to_string(), kind.to_string());
    let cached = RESOLUTION_CACHE.read().unwrap().get(&key).cloned();
    match cached {
        Some((ar, namespaced)) if ar.version == version => Ok((ar, namespaced)),
        _ => {
            let discovery = Discovery::new(client).run().await?;
            for api_group in discovery.groups() {
                for (ar, caps) in api_group.recommended_resources() {
                    if ar.group == group && ar.version == version && ar.kind == kind {
                        let namespaced = matches!(caps.scope, Scope::Namespaced);
                        RESOLUTION_CACHE
                            .write()
                            .unwrap()
                            .insert(key.clone(), (ar.clone(), namespaced));
                        return Ok((ar.clone(), namespaced));
                    }
                }
            }
            Err(anyhow!("GVK not found: {}/{}/{}", group, version, kind))
        }
    }
}

/// Builds a dynamic Api handle for one resource kind, namespaced or not.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Result<Api<DynamicObject>> {
    if namespaced {
        match namespace {
            Some(ns) if !ns.is_empty() => Ok(Api::namespaced_with(client, ns, ar)),
            _ => Err(anyhow!("namespace required for namespaced kind {}", ar.kind)),
        }
    } else {
        Ok(Api::all_with(client, ar))
    }
}

/// Runs full discovery and seeds the resolution cache. Consults the on-disk
/// cache first; writes it back after a live run.
async fn run_discovery(client: Client) -> Result<()> {
    if let Some(entries) = load_discovery_cache().ok().flatten() {
        debug!(count = entries.len(), "seeding resolution cache from disk");
        let mut cache = RESOLUTION_CACHE.write().unwrap();
        for e in entries {
            cache.insert(e.cache_key(), e.into_resource());
        }
        return Ok(());
    }

    let discovery = Discovery::new(client).run().await?;
    let mut disk_entries: Vec<DiskEntry> = Vec::new();
    {
        let mut cache = RESOLUTION_CACHE.write().unwrap();
        for api_group in discovery.groups() {
            for (ar, caps) in api_group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                cache.insert((ar.group.clone(), ar.kind.clone()), (ar.clone(), namespaced));
                disk_entries.push(DiskEntry {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced,
                });
            }
        }
    }
    if let Err(e) = save_discovery_cache(&disk_entries) {
        warn!(error = %e, "failed to persist discovery cache");
    }
    Ok(())
}

// -------- Discovery disk cache (best-effort) --------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskEntry {
    group: String,
    version: String,
    kind: String,
    plural: String,
    namespaced: bool,
}

impl DiskEntry {
    fn cache_key(&self) -> (String, String) {
        (self.group.clone(), self.kind.clone())
    }

    fn into_resource(self) -> (ApiResource, bool) {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        (
            ApiResource {
                group: self.group,
                version: self.version,
                api_version,
                kind: self.kind,
                plural: self.plural,
            },
            self.namespaced,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskCache {
    generated_at: u64,
    entries: Vec<DiskEntry>,
}

fn cache_file() -> PathBuf {
    if let Ok(p) = std::env::var("BERTH_DISCOVERY_PATH") {
        return PathBuf::from(p);
    }
    let mut base = std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
    base.push(".berth/cache/discovery.json");
    base
}

fn cache_ttl_secs() -> u64 {
    std::env::var("BERTH_DISCOVERY_TTL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(86_400)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn load_discovery_cache() -> Result<Option<Vec<DiskEntry>>> {
    let path = cache_file();
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(&path).context("read discovery cache")?;
    let dc: DiskCache = serde_json::from_slice(&data).context("parse discovery cache")?;
    if now_secs().saturating_sub(dc.generated_at) > cache_ttl_secs() {
        return Ok(None);
    }
    Ok(Some(dc.entries))
}

fn save_discovery_cache(entries: &[DiskEntry]) -> Result<()> {
    let path = cache_file();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok();
    }
    let tmp = path.with_extension("json.tmp");
    let dc = DiskCache { generated_at: now_secs(), entries: entries.to_vec() };
    let bytes = serde_json::to_vec_pretty(&dc).context("serialize discovery cache")?;
    fs::write(&tmp, &bytes).context("write tmp discovery cache")?;
    fs::rename(&tmp, &path).context("rename discovery cache")?;
    Ok(())
}
