//! Berth status engine: background polling of resource statuses.
//!
//! The engine visits a fixed identifier set every poll interval through
//! per-kind status readers and emits observations on a bounded channel until
//! it completes, errors, or is cancelled.

#![forbid(unsafe_code)]

pub mod readers;

use berth_core::{GroupKind, ObjId, ResourceStatus};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use readers::{
    compute_status, CachingClusterReader, ClusterReader, DefaultStatusReader, DirectClusterReader,
    StatusReader,
};

/// One status observation for one resource.
#[derive(Debug, Clone)]
pub struct StatusObservation {
    pub id: ObjId,
    pub status: ResourceStatus,
    pub message: Option<String>,
}

/// Events on the poll stream. `ResourceUpdate` flows repeatedly; the other
/// three are terminal and are followed by stream close.
#[derive(Debug)]
pub enum StatusEvent {
    ResourceUpdate(StatusObservation),
    Completed,
    Aborted,
    Error(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub poll_interval: Duration,
    /// Keep polling after the aggregate reaches the desired status; the
    /// stream then ends only on cancellation or error.
    pub poll_until_cancelled: bool,
    /// Refresh the cluster reader's cache once per cycle instead of issuing
    /// one GET per identifier.
    pub use_cache: bool,
    pub desired: ResourceStatus,
}

impl Default for PollOptions {
    fn default() -> Self {
        let ms = std::env::var("BERTH_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(2_000);
        Self {
            poll_interval: Duration::from_millis(ms),
            poll_until_cancelled: false,
            use_cache: true,
            desired: ResourceStatus::Current,
        }
    }
}

/// The poller is defined by its stream contract, not its implementation.
/// [`PollerEngine`] is the real one; tests substitute scripted fakes.
pub trait StatusPoller: Send + Sync {
    fn poll(
        &self,
        cancel: CancellationToken,
        identifiers: Vec<ObjId>,
        options: PollOptions,
    ) -> mpsc::Receiver<StatusEvent>;
}

// -------- Aggregation --------

/// Running aggregate over the observations of one poll stream.
pub trait StatusAggregator: Send {
    fn observe(&mut self, observation: &StatusObservation);
    fn aggregate(&self) -> ResourceStatus;
    fn completed(&self) -> bool;
}

pub type AggregatorFactory =
    Arc<dyn Fn(&[ObjId], ResourceStatus) -> Box<dyn StatusAggregator> + Send + Sync>;

/// Completed once every identifier has reached the desired status.
pub struct DesiredStatusAggregator {
    statuses: FxHashMap<ObjId, ResourceStatus>,
    desired: ResourceStatus,
}

impl DesiredStatusAggregator {
    pub fn new(identifiers: &[ObjId], desired: ResourceStatus) -> Self {
        let mut statuses = FxHashMap::default();
        for id in identifiers {
            statuses.insert(id.clone(), ResourceStatus::Unknown);
        }
        Self { statuses, desired }
    }
}

impl StatusAggregator for DesiredStatusAggregator {
    fn observe(&mut self, observation: &StatusObservation) {
        self.statuses.insert(observation.id.clone(), observation.status);
    }

    fn aggregate(&self) -> ResourceStatus {
        if self.completed() {
            self.desired
        } else {
            ResourceStatus::InProgress
        }
    }

    fn completed(&self) -> bool {
        self.statuses.values().all(|s| *s == self.desired)
    }
}

// -------- Readers --------

/// Per-kind status readers with a fallback, injected into the engine.
pub struct StatusReaders {
    by_kind: FxHashMap<GroupKind, Arc<dyn StatusReader>>,
    fallback: Arc<dyn StatusReader>,
}

impl StatusReaders {
    pub fn new(fallback: Arc<dyn StatusReader>) -> Self {
        Self { by_kind: FxHashMap::default(), fallback }
    }

    pub fn with_reader(mut self, gk: GroupKind, reader: Arc<dyn StatusReader>) -> Self {
        self.by_kind.insert(gk, reader);
        self
    }

    fn for_id(&self, id: &ObjId) -> Arc<dyn StatusReader> {
        self.by_kind
            .get(&id.group_kind())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// -------- Engine --------

fn status_queue_cap() -> usize {
    std::env::var("BERTH_STATUS_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(32)
}

/// The polling engine. Owns its reader set and aggregator factory; each call
/// to [`StatusPoller::poll`] spawns one worker that drives the cycle loop.
pub struct PollerEngine {
    readers: Arc<StatusReaders>,
    cluster: Option<Arc<dyn ClusterReader>>,
    aggregator_factory: AggregatorFactory,
}

impl PollerEngine {
    pub fn new(readers: StatusReaders) -> Self {
        Self {
            readers: Arc::new(readers),
            cluster: None,
            aggregator_factory: Arc::new(|ids, desired| {
                Box::new(DesiredStatusAggregator::new(ids, desired))
            }),
        }
    }

    /// Engine wired to a live cluster: caching reader + generic fallback
    /// status reader.
    pub fn for_cluster(client: kube::Client) -> Self {
        let cluster: Arc<dyn ClusterReader> =
            Arc::new(CachingClusterReader::new(DirectClusterReader::new(client)));
        let fallback = Arc::new(DefaultStatusReader::new(cluster.clone()));
        Self::new(StatusReaders::new(fallback)).with_cluster_reader(cluster)
    }

    pub fn with_cluster_reader(mut self, cluster: Arc<dyn ClusterReader>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_aggregator_factory(mut self, factory: AggregatorFactory) -> Self {
        self.aggregator_factory = factory;
        self
    }
}

impl StatusPoller for PollerEngine {
    fn poll(
        &self,
        cancel: CancellationToken,
        identifiers: Vec<ObjId>,
        options: PollOptions,
    ) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(status_queue_cap());
        let readers = self.readers.clone();
        let cluster = self.cluster.clone();
        let mut aggregator = (self.aggregator_factory)(&identifiers, options.desired);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(StatusEvent::Aborted).await;
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let cycle_start = std::time::Instant::now();
                if options.use_cache {
                    if let Some(cluster) = cluster.as_ref() {
                        if let Err(e) = cluster.sync(&identifiers).await {
                            counter!("poll_errors_total", 1u64);
                            let _ = tx.send(StatusEvent::Error(e)).await;
                            return;
                        }
                    }
                }

                // Reads run concurrently; results are emitted in input order.
                let reads = identifiers.iter().map(|id| {
                    let reader = readers.for_id(id);
                    let id = id.clone();
                    async move { reader.read_status(&id).await }
                });
                let results = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(StatusEvent::Aborted).await;
                        return;
                    }
                    results = futures::future::join_all(reads) => results,
                };

                for result in results {
                    match result {
                        Ok(observation) => {
                            aggregator.observe(&observation);
                            counter!("status_observations_total", 1u64);
                            if tx.send(StatusEvent::ResourceUpdate(observation)).await.is_err() {
                                debug!("status channel closed; stopping poller");
                                return;
                            }
                        }
                        Err(e) => {
                            counter!("poll_errors_total", 1u64);
                            let _ = tx.send(StatusEvent::Error(e)).await;
                            return;
                        }
                    }
                }

                counter!("poll_cycles_total", 1u64);
                histogram!("poll_cycle_ms", cycle_start.elapsed().as_secs_f64() * 1000.0);

                if !options.poll_until_cancelled && aggregator.completed() {
                    let _ = tx.send(StatusEvent::Completed).await;
                    return;
                }
            }
        });
        rx
    }
}
