//! The runner loop: a single-consumer multiplexer over task completions,
//! status observations and caller cancellation.
//!
//! The loop is the sole writer of the output stream and the sole mutator of
//! the collector, which is what keeps event ordering lock-free.

use crate::collector::StatusCollector;
use crate::error::EngineError;
use crate::event::Event;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskResult, WaitHandle};
use berth_status::StatusEvent;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What the loop currently has in flight. Only wait tasks hand back a
/// handle; everything else runs to completion untouched.
enum InFlight {
    Wait(WaitHandle),
    Other,
}

/// Drives the queue to completion. Returns when the queue is exhausted, a
/// task fails, or an abort (poller error, cancellation) has been observed
/// and the in-flight task has finished.
pub(crate) async fn run(
    mut queue: TaskQueue,
    status_rx: &mut mpsc::Receiver<StatusEvent>,
    events: &mpsc::Sender<Event>,
    cancel: &CancellationToken,
    collector: &mut StatusCollector,
) -> Result<(), EngineError> {
    // Buffered size 1 is enough: every task posts exactly once.
    let (task_tx, mut task_rx) = mpsc::channel::<TaskResult>(1);

    let mut current = match next_task(&mut queue, &task_tx, events, collector) {
        Some(in_flight) => in_flight,
        None => return Ok(()),
    };

    // Once abort is set the loop stops consuming status updates and exits as
    // soon as the in-flight task finishes. Only wait tasks are interrupted;
    // apply and prune always run to completion.
    let mut abort = false;
    let mut abort_reason = EngineError::Cancelled;
    // Fired select branches are disarmed through these flags so a closed
    // channel or a completed token cannot busy-fire.
    let mut cancel_seen = false;
    let mut status_closed = false;

    loop {
        tokio::select! {
            observation = status_rx.recv(), if !status_closed => {
                match observation {
                    None => {
                        status_closed = true;
                    }
                    Some(_) if abort => {}
                    Some(StatusEvent::Error(e)) => {
                        counter!("runner_aborts_total", 1u64);
                        abort = true;
                        abort_reason = EngineError::Poller(e.to_string());
                        if let InFlight::Wait(wait) = &mut current {
                            wait.complete();
                        }
                    }
                    Some(StatusEvent::ResourceUpdate(obs)) => {
                        let _ = events
                            .send(Event::Status { id: obs.id.clone(), status: obs.status })
                            .await;
                        collector.observe(&obs.id, obs.status);
                        if let InFlight::Wait(wait) = &mut current {
                            if collector.condition_met(&wait.identifiers, wait.condition) {
                                wait.complete();
                            }
                        }
                    }
                    Some(StatusEvent::Completed) | Some(StatusEvent::Aborted) => {}
                }
            }
            Some(result) = task_rx.recv() => {
                if let InFlight::Wait(wait) = &mut current {
                    wait.clear_timeout();
                }
                result?;
                if abort {
                    return Err(abort_reason);
                }
                current = match next_task(&mut queue, &task_tx, events, collector) {
                    Some(in_flight) => in_flight,
                    None => return Ok(()),
                };
            }
            _ = cancel.cancelled(), if !cancel_seen => {
                debug!("cancellation observed; finishing in-flight task");
                counter!("runner_aborts_total", 1u64);
                cancel_seen = true;
                abort = true;
                abort_reason = EngineError::Cancelled;
                if let InFlight::Wait(wait) = &mut current {
                    wait.complete();
                }
            }
        }
    }
}

/// Starts the next task. Wait tasks are checked against the collector first:
/// if the condition already holds, the task is completed on entry instead of
/// waiting for status events that may never come.
fn next_task(
    queue: &mut TaskQueue,
    task_tx: &mpsc::Sender<TaskResult>,
    events: &mpsc::Sender<Event>,
    collector: &StatusCollector,
) -> Option<InFlight> {
    let task = queue.next()?;
    Some(match task {
        Task::Wait(wait) => {
            if collector.condition_met(&wait.identifiers, wait.condition) {
                InFlight::Wait(wait.start_and_complete(task_tx))
            } else {
                InFlight::Wait(wait.start(task_tx))
            }
        }
        Task::Apply(apply) => {
            apply.start(task_tx, events);
            InFlight::Other
        }
        Task::Prune(prune) => {
            prune.start(task_tx, events);
            InFlight::Other
        }
        Task::Emit(emit) => {
            emit.start(task_tx, events);
            InFlight::Other
        }
    })
}
