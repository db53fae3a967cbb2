//! Task-queue construction. The queue is built once, before execution, and
//! consumed once by the runner loop.

use crate::client::{ClusterApplier, ResourcePruner};
use crate::collector::Condition;
use crate::event::Event;
use crate::grouping::PriorState;
use crate::manifest::Manifest;
use crate::task::{ApplyTask, EmitTask, PruneTask, Task, WaitTask};
use berth_core::ObjId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub(crate) fn next(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Inputs for one queue. `manifests` is the full ordered applied set with
/// the grouping object first; `prior` is Some exactly when prune runs.
pub(crate) struct QueueSpec {
    pub manifests: Vec<Manifest>,
    pub wait_timeout: Option<Duration>,
    pub prior: Option<PriorState>,
}

/// The construction rule is fixed: apply, then optionally wait for
/// reconciliation, then optionally prune, each phase closed by its
/// completion event.
pub(crate) fn build_task_queue(
    spec: QueueSpec,
    applier: Arc<dyn ClusterApplier>,
    pruner: Arc<dyn ResourcePruner>,
) -> TaskQueue {
    let applied: Vec<ObjId> = spec.manifests.iter().map(|m| m.id.clone()).collect();
    let reconcile_ids: Vec<ObjId> = applied.iter().skip(1).cloned().collect();

    let mut tasks = VecDeque::new();
    tasks.push_back(Task::Apply(ApplyTask { manifests: spec.manifests, client: applier }));
    tasks.push_back(Task::Emit(EmitTask { event: Event::ApplyCompleted }));

    if let Some(timeout) = spec.wait_timeout {
        tasks.push_back(Task::Wait(WaitTask {
            identifiers: reconcile_ids,
            condition: Condition::AllCurrent,
            timeout,
        }));
        tasks.push_back(Task::Emit(EmitTask { event: Event::StatusCompleted }));
    }

    if let Some(prior) = spec.prior {
        tasks.push_back(Task::Prune(PruneTask { prior, applied, client: pruner }));
        tasks.push_back(Task::Emit(EmitTask { event: Event::PruneCompleted }));
    }

    TaskQueue { tasks }
}
