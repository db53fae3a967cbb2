#![forbid(unsafe_code)]

mod common;

use berth_apply::{Applier, ApplierOptions, EngineError, Event, PriorGroup, PriorState};
use berth_core::ResourceStatus;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn options(wait: Option<Duration>, prune: bool) -> ApplierOptions {
    ApplierOptions {
        wait,
        prune,
        dry_run: false,
        poll_interval: Duration::from_millis(10),
        use_cache: false,
    }
}

fn set() -> Vec<berth_apply::Manifest> {
    vec![deployment("foo"), grouping_template("group")]
}

#[tokio::test]
async fn wait_completes_once_resource_reaches_current() {
    let applier = Arc::new(RecordingApplier::default());
    let pruner = Arc::new(RecordingPruner::default());
    let poller = Arc::new(ScriptedPoller::new(vec![
        Step::Update(deployment_id("foo"), ResourceStatus::InProgress),
        Step::Update(deployment_id("foo"), ResourceStatus::Current),
    ]));
    let engine = Applier::new(applier, pruner, poller, options(Some(Duration::from_secs(30)), false));

    let rx = engine.run(CancellationToken::new(), set());
    let events = collect_within(rx, Duration::from_secs(5)).await;

    assert_eq!(
        tags(&events),
        vec![
            "init",
            "apply_item",
            "apply_item",
            "apply_completed",
            "status",
            "status",
            "status_completed"
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Status { id, status: ResourceStatus::Current } if id == &deployment_id("foo")
    )));
}

#[tokio::test]
async fn wait_short_circuits_when_condition_already_met() {
    // Applies are slow enough that Current is observed while the apply task
    // is still running; the wait task must complete on entry.
    let applier = Arc::new(RecordingApplier {
        delay: Some(Duration::from_millis(60)),
        ..RecordingApplier::default()
    });
    let pruner = Arc::new(RecordingPruner::default());
    let poller = Arc::new(ScriptedPoller::new(vec![Step::Update(
        deployment_id("foo"),
        ResourceStatus::Current,
    )]));
    let engine = Applier::new(applier, pruner, poller, options(Some(Duration::from_secs(30)), false));

    let rx = engine.run(CancellationToken::new(), set());
    let events = collect_within(rx, Duration::from_secs(5)).await;
    let observed = tags(&events);

    assert_eq!(observed.last(), Some(&"status_completed"));
    let status_at = observed.iter().position(|t| *t == "status").unwrap();
    let completed_at = observed.iter().position(|t| *t == "apply_completed").unwrap();
    assert!(status_at < completed_at, "status should arrive during the apply phase: {observed:?}");
    assert!(!observed.contains(&"error"));
}

#[tokio::test]
async fn wait_timeout_surfaces_typed_error_and_skips_prune() {
    let applier = Arc::new(RecordingApplier::default());
    let stale = deployment_id("stale");
    let pruner = Arc::new(RecordingPruner {
        prior: PriorState {
            groups: vec![PriorGroup { id: configmap_id("group-old"), contents: vec![stale] }],
        },
        ..RecordingPruner::default()
    });
    let poller = Arc::new(ScriptedPoller::new(vec![
        Step::Update(deployment_id("foo"), ResourceStatus::InProgress),
        Step::Update(deployment_id("bar"), ResourceStatus::Current),
    ]));
    let engine = Applier::new(
        applier,
        pruner.clone(),
        poller,
        options(Some(Duration::from_millis(200)), true),
    );

    let mut manifests = set();
    manifests.push(deployment("bar"));
    let rx = engine.run(CancellationToken::new(), manifests);
    let events = collect_within(rx, Duration::from_secs(5)).await;
    let observed = tags(&events);

    assert!(matches!(events.last(), Some(Event::Error { error: EngineError::WaitTimeout(_) })));
    assert!(observed.contains(&"status"), "expected status updates before the timeout");
    assert!(!observed.contains(&"status_completed"));
    assert!(!observed.contains(&"prune_item"));
    assert!(pruner.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn poller_error_mid_wait_aborts_with_poller_error() {
    let applier = Arc::new(RecordingApplier::default());
    let pruner = Arc::new(RecordingPruner::default());
    let poller = Arc::new(ScriptedPoller::new(vec![
        Step::Update(deployment_id("foo"), ResourceStatus::InProgress),
        Step::Error("status backend went away".to_string()),
    ]));
    let engine = Applier::new(applier, pruner, poller, options(Some(Duration::from_secs(30)), false));

    let rx = engine.run(CancellationToken::new(), set());
    let events = collect_within(rx, Duration::from_secs(5)).await;
    let observed = tags(&events);

    assert!(observed.contains(&"status"), "the update before the error is still forwarded");
    assert!(!observed.contains(&"status_completed"));
    match events.last() {
        Some(Event::Error { error: EngineError::Poller(msg) }) => {
            assert!(msg.contains("went away"), "{msg}");
        }
        other => panic!("expected poller error terminal, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_during_wait_returns_promptly_without_error_event() {
    let applier = Arc::new(RecordingApplier::default());
    let stale = deployment_id("stale");
    let pruner = Arc::new(RecordingPruner {
        prior: PriorState {
            groups: vec![PriorGroup { id: configmap_id("group-old"), contents: vec![stale] }],
        },
        ..RecordingPruner::default()
    });
    let poller = Arc::new(ScriptedPoller::new(vec![Step::Update(
        deployment_id("foo"),
        ResourceStatus::InProgress,
    )]));
    let engine = Applier::new(
        applier,
        pruner.clone(),
        poller,
        options(Some(Duration::from_secs(30)), true),
    );

    let cancel = CancellationToken::new();
    let rx = engine.run(cancel.clone(), set());
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        canceller.cancel();
    });

    let events = collect_within(rx, Duration::from_secs(2)).await;
    let observed = tags(&events);

    assert!(!observed.contains(&"error"), "cancellation must not synthesize an error event");
    assert!(!observed.contains(&"prune_item"));
    assert!(pruner.deleted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn prune_deletes_difference_and_superseded_grouping_objects() {
    let applier = Arc::new(RecordingApplier::default());
    let stale = deployment_id("stale");
    let pruner = Arc::new(RecordingPruner {
        prior: PriorState {
            groups: vec![PriorGroup {
                id: configmap_id("group-old"),
                contents: vec![deployment_id("foo"), stale.clone()],
            }],
        },
        ..RecordingPruner::default()
    });
    let poller = Arc::new(ScriptedPoller::new(vec![]));
    let engine = Applier::new(applier, pruner.clone(), poller, options(None, true));

    let rx = engine.run(CancellationToken::new(), set());
    let events = collect_within(rx, Duration::from_secs(5)).await;
    let observed = tags(&events);

    assert_eq!(observed.last(), Some(&"prune_completed"));
    assert_eq!(observed.iter().filter(|t| **t == "prune_item").count(), 2);
    let deleted = pruner.deleted.lock().unwrap().clone();
    assert_eq!(deleted, vec![stale, configmap_id("group-old")]);
}

#[tokio::test]
async fn wait_success_is_sticky_despite_later_regressions() {
    let applier = Arc::new(RecordingApplier::default());
    let pruner = Arc::new(RecordingPruner::default());
    let poller = Arc::new(ScriptedPoller::new(vec![
        Step::Update(deployment_id("foo"), ResourceStatus::Current),
        Step::Update(deployment_id("foo"), ResourceStatus::InProgress),
    ]));
    let engine = Applier::new(applier, pruner, poller, options(Some(Duration::from_secs(30)), false));

    let rx = engine.run(CancellationToken::new(), set());
    let events = collect_within(rx, Duration::from_secs(5)).await;
    let observed = tags(&events);

    assert!(observed.contains(&"status_completed"));
    assert!(!observed.contains(&"error"));
}
