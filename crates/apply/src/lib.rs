//! Berth apply engine: applies a declarative set of manifests to a cluster,
//! optionally waits for every resource to reconcile, and prunes what earlier
//! applies left behind.
//!
//! Progress streams to a single consumer as [`Event`] values; the run is
//! driven by a fixed task queue multiplexed with a background status poller.

#![forbid(unsafe_code)]

pub mod client;
pub mod collector;
pub mod error;
pub mod event;
pub mod grouping;
pub mod manifest;

mod queue;
mod runner;
mod task;

use crate::client::{ClusterApplier, KubePruner, ResourcePruner, SsaApplier};
use crate::collector::StatusCollector;
use crate::grouping::GROUPING_LABEL;
use crate::queue::{build_task_queue, QueueSpec};
use berth_core::{ObjId, ResourceStatus};
use berth_status::{PollOptions, PollerEngine, StatusPoller};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use crate::collector::Condition;
pub use crate::error::EngineError;
pub use crate::event::{ActionType, Event, ItemOutcome, ResourceGroup};
pub use crate::grouping::{PriorGroup, PriorState};
pub use crate::manifest::{sort_manifests, Manifest};

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    /// Wait for every applied resource to reach Current, with this timeout.
    pub wait: Option<Duration>,
    /// Prune resources recorded by earlier applies but absent from this set.
    pub prune: bool,
    /// Propagate server-side dry-run to apply and skip prune deletions.
    pub dry_run: bool,
    pub poll_interval: Duration,
    pub use_cache: bool,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            wait: None,
            prune: true,
            dry_run: false,
            poll_interval: PollOptions::default().poll_interval,
            use_cache: true,
        }
    }
}

fn event_queue_cap() -> usize {
    std::env::var("BERTH_EVENT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(64)
}

/// Applies a set of resources, conditionally waits for them to reconcile and
/// finally prunes. The work is described by a task queue executed by the
/// runner loop while the status poller observes the cluster in the
/// background.
pub struct Applier {
    applier: Arc<dyn ClusterApplier>,
    pruner: Arc<dyn ResourcePruner>,
    poller: Arc<dyn StatusPoller>,
    options: ApplierOptions,
}

impl Applier {
    pub fn new(
        applier: Arc<dyn ClusterApplier>,
        pruner: Arc<dyn ResourcePruner>,
        poller: Arc<dyn StatusPoller>,
        options: ApplierOptions,
    ) -> Self {
        Self { applier, pruner, poller, options }
    }

    /// Applier wired to the current kube context.
    pub async fn for_cluster(options: ApplierOptions) -> anyhow::Result<Self> {
        let client = berth_kubehub::get_kube_client().await?;
        let applier = Arc::new(SsaApplier::new(client.clone(), options.dry_run));
        let pruner = Arc::new(KubePruner::new(client.clone(), options.dry_run));
        let poller = Arc::new(PollerEngine::for_cluster(client));
        Ok(Self::new(applier, pruner, poller, options))
    }

    /// Runs the operation. The returned stream is the authoritative progress
    /// record: it carries every event of the run and closes exactly once,
    /// after the terminal event. Cancelling the token interrupts any
    /// in-flight wait; apply and prune always run to completion first.
    pub fn run(&self, cancel: CancellationToken, manifests: Vec<Manifest>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(event_queue_cap());
        let applier = self.applier.clone();
        let pruner = self.pruner.clone();
        let poller = self.poller.clone();
        let options = self.options.clone();

        tokio::spawn(async move {
            counter!("apply_runs_total", 1u64);
            let started = std::time::Instant::now();
            let result =
                run_inner(applier, pruner, poller, options, manifests, cancel, &tx).await;
            histogram!("apply_run_ms", started.elapsed().as_secs_f64() * 1000.0);
            if let Err(error) = result {
                // Cancellation closes the stream cleanly without an event.
                if error != EngineError::Cancelled {
                    counter!("apply_runs_failed", 1u64);
                    let _ = tx.send(Event::Error { error }).await;
                }
            }
        });
        rx
    }
}

async fn run_inner(
    applier: Arc<dyn ClusterApplier>,
    pruner: Arc<dyn ResourcePruner>,
    poller: Arc<dyn StatusPoller>,
    options: ApplierOptions,
    manifests: Vec<Manifest>,
    cancel: CancellationToken,
    events: &mpsc::Sender<Event>,
) -> Result<(), EngineError> {
    // Prepare the applied set: exactly one grouping template, a single
    // namespace, prerequisite kinds first, grouping object in front.
    let (mut resources, templates) = grouping::split_manifests(manifests);
    let template = grouping::single_template(templates)?;
    grouping::validate_single_namespace(&resources)?;
    sort_manifests(&mut resources);
    let grouping_obj = grouping::build_grouping_object(template, &resources)?;

    let set_id = grouping_obj.label(GROUPING_LABEL).unwrap_or_default().to_string();
    let grouping_ns = grouping_obj.id.namespace.clone();

    // Prior grouping state is fetched up front; the queue is immutable once
    // execution starts.
    let prior = if options.prune {
        let state = pruner
            .prior_state(&grouping_ns, &set_id)
            .await
            .map_err(|e| EngineError::Prune(e.to_string()))?;
        Some(state)
    } else {
        None
    };

    let mut applied = Vec::with_capacity(resources.len() + 1);
    applied.push(grouping_obj);
    applied.append(&mut resources);
    let all_ids: Vec<ObjId> = applied.iter().map(|m| m.id.clone()).collect();

    info!(objects = all_ids.len(), wait = options.wait.is_some(), prune = options.prune, "run starting");
    let _ = events
        .send(Event::Init {
            groups: vec![ResourceGroup { action: ActionType::Apply, identifiers: all_ids.clone() }],
        })
        .await;

    let queue = build_task_queue(
        QueueSpec { manifests: applied, wait_timeout: options.wait, prior },
        applier,
        pruner,
    );

    // The poller lives exactly as long as the runner: cancelled and drained
    // before this function returns, so no background work outlives the run.
    let poll_cancel = cancel.child_token();
    let mut status_rx = poller.poll(
        poll_cancel.clone(),
        all_ids.clone(),
        PollOptions {
            poll_interval: options.poll_interval,
            poll_until_cancelled: true,
            use_cache: options.use_cache,
            desired: ResourceStatus::Current,
        },
    );
    let mut collector = StatusCollector::new(&all_ids);

    let result = runner::run(queue, &mut status_rx, events, &cancel, &mut collector).await;

    poll_cancel.cancel();
    while status_rx.recv().await.is_some() {}
    debug!("status channel drained");

    result
}
