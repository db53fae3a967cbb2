//! Phase tasks. Each task runs its side effect on a fresh worker and posts
//! exactly one result back to the runner loop.

use crate::client::{ClusterApplier, ResourcePruner};
use crate::collector::Condition;
use crate::error::EngineError;
use crate::event::{Event, ItemOutcome};
use crate::grouping::PriorState;
use crate::manifest::Manifest;
use berth_core::ObjId;
use metrics::counter;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub(crate) type TaskResult = Result<(), EngineError>;

/// The closed set of phase tasks. Only `Wait` is interruptible and only
/// `Wait` consults the collector, so the runner matches on the variant.
pub(crate) enum Task {
    Apply(ApplyTask),
    Wait(WaitTask),
    Prune(PruneTask),
    Emit(EmitTask),
}

/// Pushes the full manifest set, grouping object first. Not atomic: a
/// partial apply leaves the cluster mixed and is never rolled back.
pub(crate) struct ApplyTask {
    pub manifests: Vec<Manifest>,
    pub client: Arc<dyn ClusterApplier>,
}

impl ApplyTask {
    pub(crate) fn start(self, task_tx: &mpsc::Sender<TaskResult>, events: &mpsc::Sender<Event>) {
        let ApplyTask { manifests, client } = self;
        let task_tx = task_tx.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let total = manifests.len();
            let mut failed = 0usize;
            for manifest in manifests {
                let id = manifest.id.clone();
                counter!("apply_attempts", 1u64);
                match client.apply(&manifest).await {
                    Ok(()) => {
                        counter!("apply_ok", 1u64);
                        let _ = events
                            .send(Event::ApplyItem { id, outcome: ItemOutcome::Succeeded })
                            .await;
                    }
                    Err(e) => {
                        counter!("apply_err", 1u64);
                        warn!(object = %id, error = %e, "apply rejected");
                        failed += 1;
                        let _ = events
                            .send(Event::ApplyItem {
                                id,
                                outcome: ItemOutcome::Failed(e.to_string()),
                            })
                            .await;
                    }
                }
            }
            let result = if failed > 0 {
                Err(EngineError::Apply(format!("{} of {} objects rejected", failed, total)))
            } else {
                Ok(())
            };
            let _ = task_tx.send(result).await;
        });
    }
}

/// Purely observational: completes when the runner decides the condition is
/// met, or when the armed timeout fires.
pub(crate) struct WaitTask {
    pub identifiers: Vec<ObjId>,
    pub condition: Condition,
    pub timeout: Duration,
}

impl WaitTask {
    pub(crate) fn start(self, task_tx: &mpsc::Sender<TaskResult>) -> WaitHandle {
        let done = Arc::new(AtomicBool::new(false));
        let timer = {
            let done = done.clone();
            let task_tx = task_tx.clone();
            let timeout = self.timeout;
            let waiting = self.identifiers.len();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !done.swap(true, Ordering::SeqCst) {
                    counter!("wait_timeouts_total", 1u64);
                    let _ = task_tx
                        .send(Err(EngineError::WaitTimeout(format!(
                            "condition not met for {} resource(s) within {:?}",
                            waiting, timeout
                        ))))
                        .await;
                }
            })
        };
        WaitHandle {
            identifiers: self.identifiers,
            condition: self.condition,
            done,
            timer: Some(timer),
            task_tx: task_tx.clone(),
        }
    }

    /// Used when the condition already holds at task entry: no timer, the
    /// result is posted immediately.
    pub(crate) fn start_and_complete(self, task_tx: &mpsc::Sender<TaskResult>) -> WaitHandle {
        let mut handle = WaitHandle {
            identifiers: self.identifiers,
            condition: self.condition,
            done: Arc::new(AtomicBool::new(false)),
            timer: None,
            task_tx: task_tx.clone(),
        };
        handle.complete();
        handle
    }
}

/// Runner-side handle to an in-flight wait task.
pub(crate) struct WaitHandle {
    pub identifiers: Vec<ObjId>,
    pub condition: Condition,
    done: Arc<AtomicBool>,
    timer: Option<tokio::task::JoinHandle<()>>,
    task_tx: mpsc::Sender<TaskResult>,
}

impl WaitHandle {
    /// Posts the success result unless the task already finished. Safe to
    /// call any number of times.
    pub(crate) fn complete(&mut self) {
        self.clear_timeout();
        if !self.done.swap(true, Ordering::SeqCst) {
            let task_tx = self.task_tx.clone();
            tokio::spawn(async move {
                let _ = task_tx.send(Ok(())).await;
            });
        }
    }

    /// Cancels the armed timeout; idempotent.
    pub(crate) fn clear_timeout(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Deletes what earlier applies recorded but the new set no longer contains,
/// then the superseded grouping objects themselves.
pub(crate) struct PruneTask {
    pub prior: PriorState,
    pub applied: Vec<ObjId>,
    pub client: Arc<dyn ResourcePruner>,
}

impl PruneTask {
    fn targets(&self) -> Vec<ObjId> {
        let applied: FxHashSet<&ObjId> = self.applied.iter().collect();
        let mut targets: Vec<ObjId> = Vec::new();
        for group in &self.prior.groups {
            for id in &group.contents {
                if !applied.contains(id) && !targets.contains(id) {
                    targets.push(id.clone());
                }
            }
        }
        for group in &self.prior.groups {
            if !applied.contains(&group.id) && !targets.contains(&group.id) {
                targets.push(group.id.clone());
            }
        }
        targets
    }

    pub(crate) fn start(self, task_tx: &mpsc::Sender<TaskResult>, events: &mpsc::Sender<Event>) {
        let targets = self.targets();
        let client = self.client;
        let task_tx = task_tx.clone();
        let events = events.clone();
        tokio::spawn(async move {
            debug!(count = targets.len(), "prune pass starting");
            let total = targets.len();
            let mut failed = 0usize;
            for id in targets {
                counter!("prune_attempts", 1u64);
                match client.delete(&id).await {
                    Ok(()) => {
                        counter!("prune_ok", 1u64);
                        let _ = events
                            .send(Event::PruneItem { id, outcome: ItemOutcome::Succeeded })
                            .await;
                    }
                    Err(e) => {
                        counter!("prune_err", 1u64);
                        warn!(object = %id, error = %e, "prune delete rejected");
                        failed += 1;
                        let _ = events
                            .send(Event::PruneItem {
                                id,
                                outcome: ItemOutcome::Failed(e.to_string()),
                            })
                            .await;
                    }
                }
            }
            let result = if failed > 0 {
                Err(EngineError::Prune(format!("{} of {} deletions rejected", failed, total)))
            } else {
                Ok(())
            };
            let _ = task_tx.send(result).await;
        });
    }
}

/// Writes one pre-baked event to the output stream and completes.
pub(crate) struct EmitTask {
    pub event: Event,
}

impl EmitTask {
    pub(crate) fn start(self, task_tx: &mpsc::Sender<TaskResult>, events: &mpsc::Sender<Event>) {
        let task_tx = task_tx.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let _ = events.send(self.event).await;
            let _ = task_tx.send(Ok(())).await;
        });
    }
}
