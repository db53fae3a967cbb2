#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use berth_apply::client::{ClusterApplier, ResourcePruner};
use berth_apply::{Event, Manifest, PriorState};
use berth_core::{ObjId, ResourceStatus};
use berth_status::{PollOptions, StatusEvent, StatusObservation, StatusPoller};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn deployment(name: &str) -> Manifest {
    Manifest::from_json(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "default"}
    }))
    .unwrap()
}

pub fn grouping_template(name: &str) -> Manifest {
    Manifest::from_json(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": {(berth_apply::grouping::GROUPING_LABEL): "demo"}
        }
    }))
    .unwrap()
}

pub fn deployment_id(name: &str) -> ObjId {
    ObjId::new("apps", "Deployment", "default", name).unwrap()
}

pub fn configmap_id(name: &str) -> ObjId {
    ObjId::new("", "ConfigMap", "default", name).unwrap()
}

/// Apply client that records order and can be told to reject objects by name
/// or to take a while per object.
#[derive(Default)]
pub struct RecordingApplier {
    pub fail: Vec<String>,
    pub delay: Option<Duration>,
    pub applied: Mutex<Vec<ObjId>>,
}

#[async_trait]
impl ClusterApplier for RecordingApplier {
    async fn apply(&self, manifest: &Manifest) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.applied.lock().unwrap().push(manifest.id.clone());
        if self.fail.contains(&manifest.id.name) {
            anyhow::bail!("admission denied for {}", manifest.id.name);
        }
        Ok(())
    }
}

/// Pruner with canned prior state; records every delete.
#[derive(Default)]
pub struct RecordingPruner {
    pub prior: PriorState,
    pub deleted: Mutex<Vec<ObjId>>,
}

#[async_trait]
impl ResourcePruner for RecordingPruner {
    async fn prior_state(&self, _namespace: &str, _set_id: &str) -> Result<PriorState> {
        Ok(self.prior.clone())
    }

    async fn delete(&self, id: &ObjId) -> Result<()> {
        self.deleted.lock().unwrap().push(id.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub enum Step {
    Update(ObjId, ResourceStatus),
    Error(String),
}

/// Poller replaying a scripted observation sequence, one step per delay
/// tick, then holding the stream open until cancelled.
pub struct ScriptedPoller {
    pub step_delay: Duration,
    pub steps: Vec<Step>,
}

impl ScriptedPoller {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { step_delay: Duration::from_millis(20), steps }
    }
}

impl StatusPoller for ScriptedPoller {
    fn poll(
        &self,
        cancel: CancellationToken,
        _identifiers: Vec<ObjId>,
        _options: PollOptions,
    ) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(32);
        let steps = self.steps.clone();
        let delay = self.step_delay;
        tokio::spawn(async move {
            for step in steps {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(StatusEvent::Aborted).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match step {
                    Step::Update(id, status) => {
                        let obs = StatusObservation { id, status, message: None };
                        if tx.send(StatusEvent::ResourceUpdate(obs)).await.is_err() {
                            return;
                        }
                    }
                    Step::Error(msg) => {
                        let _ = tx.send(StatusEvent::Error(anyhow::anyhow!(msg))).await;
                        return;
                    }
                }
            }
            cancel.cancelled().await;
            let _ = tx.send(StatusEvent::Aborted).await;
        });
        rx
    }
}

pub async fn collect(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(ev) = rx.recv().await {
        out.push(ev);
    }
    out
}

/// Collect with an upper bound; fails the test if the stream never closes.
pub async fn collect_within(rx: mpsc::Receiver<Event>, limit: Duration) -> Vec<Event> {
    tokio::time::timeout(limit, collect(rx)).await.expect("event stream did not close in time")
}

pub fn tags(events: &[Event]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            Event::Init { .. } => "init",
            Event::ApplyItem { .. } => "apply_item",
            Event::ApplyCompleted => "apply_completed",
            Event::Status { .. } => "status",
            Event::StatusCompleted => "status_completed",
            Event::PruneItem { .. } => "prune_item",
            Event::PruneCompleted => "prune_completed",
            Event::Error { .. } => "error",
        })
        .collect()
}
