//! End-to-end tests for the replace-then-retire protocol.
//!
//! Workers run as in-process tasks but speak to the supervisor over the real
//! control bridge. Guarantees exercised here:
//! - A version change produces exactly one successor, with the new version.
//! - The successor reports listening strictly before the predecessor is sent
//!   shutdown.
//! - Under concurrent load spanning a switch, every response carries either
//!   the old or the new version, and every request is answered on its first
//!   attempt.
//! - A drift report from a successor that is not yet listening is acted on
//!   once that successor owns its slot.
//! - A graceful stop shuts every worker down and exits cleanly.

use autoswitch_core::{
    BackoffConfig, JournalEvent, ReplacementConfig, Supervisor, SupervisorHandle, SwitchConfig,
    VersionToken, WorkerContext, WorkerId, WorkerState,
};
use autoswitch_test_utils::{
    count, exits, init_test_logging, seq_of, spawned, wait_for, wait_for_entry, workload,
    InProcessLauncher, MockOracle, RequestQueue,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> SwitchConfig {
    SwitchConfig::new()
        .with_grace_period(Duration::from_millis(500))
        .with_drain_period(Duration::from_millis(200))
        .with_ready_timeout(Duration::from_secs(5))
        .with_replacement(ReplacementConfig {
            max_attempts: 3,
            backoff: BackoffConfig::Fixed { delay_ms: 10 },
        })
}

async fn start(oracle: &MockOracle, queue: &RequestQueue) -> SupervisorHandle {
    let launcher = InProcessLauncher::new(Arc::new(oracle.clone()), queue.workload());
    let handle = Supervisor::new(test_config(), Arc::new(oracle.clone()), Arc::new(launcher))
        .start()
        .await
        .unwrap();

    assert!(wait_for(PATIENCE, || queue.listeners() == 1).await);
    handle
}

async fn stop(mut handle: SupervisorHandle) {
    handle.shutdown();
    tokio::time::timeout(PATIENCE, handle.wait())
        .await
        .expect("supervisor stops in time")
        .expect("graceful shutdown");
}

/// Round trip: 1.0 is served, the oracle moves to 2.1, and after one gate
/// invocation exactly one successor running 2.1 takes over.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_trip_switches_to_new_version_once() {
    init_test_logging();
    let oracle = MockOracle::new("1.0");
    let queue = RequestQueue::new();
    let handle = start(&oracle, &queue).await;

    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "1.0");

    oracle.set("2.1");
    // Served by the old worker, whose gate now observes the drift.
    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "1.0");

    let journal = handle.journal().clone();
    let old = WorkerId(1);
    let shutdown = wait_for_entry(&journal, PATIENCE, |e| {
        e.worker_id == old && e.event == JournalEvent::ShutdownSent
    })
    .await
    .expect("predecessor retired");

    let versions = spawned(&journal);
    assert_eq!(
        versions,
        vec![(WorkerId(1), "1.0".to_string()), (WorkerId(2), "2.1".to_string())]
    );

    let listening = seq_of(&journal, WorkerId(2), &JournalEvent::Listening).unwrap();
    assert!(listening < shutdown.seq, "successor must listen before predecessor shutdown");

    assert!(wait_for(PATIENCE, || queue.listeners() == 1).await);
    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "2.1");

    assert!(
        wait_for(PATIENCE, || exits(&journal).contains_key(&old)).await,
        "old worker exits after shutdown"
    );
    assert_eq!(exits(&journal)[&old], (Some(0), true));
    assert_eq!(count(&journal, |e| *e == JournalEvent::RetirementRequested), 1);

    stop(handle).await;
}

/// Load: concurrent requests spanning 1.0 -> 2.2 only ever see those two
/// versions, and each one is answered without a retry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_across_switch_sees_only_old_or_new() {
    init_test_logging();
    let oracle = MockOracle::new("1.0");
    let queue = RequestQueue::new();
    let handle = start(&oracle, &queue).await;
    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "1.0");

    const REQUESTS: usize = 200;
    let mut tasks = Vec::with_capacity(REQUESTS);
    for i in 0..REQUESTS {
        if i == REQUESTS / 4 {
            oracle.set("2.2");
        }
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move { queue.request_once().await }));
        if i % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    for task in futures::future::join_all(tasks).await {
        match task.unwrap() {
            Ok(version) => {
                seen.insert(version.to_string());
            }
            Err(err) => failures.push(err.to_string()),
        }
    }

    assert!(failures.is_empty(), "requests failed: {failures:?}");
    assert!(seen.is_subset(&HashSet::from(["1.0".to_string(), "2.2".to_string()])));

    let journal = handle.journal().clone();
    assert!(
        wait_for(PATIENCE, || spawned(&journal).len() == 2
            && seq_of(&journal, WorkerId(1), &JournalEvent::ShutdownSent).is_some())
        .await
    );
    assert_eq!(spawned(&journal)[1].1, "2.2");
    let answer: VersionToken = queue.request(REQUEST_TIMEOUT).await.unwrap();
    assert_eq!(answer, "2.2");

    stop(handle).await;
}

/// A successor that observes drift before it reports listening is retired
/// as soon as it owns the slot, not forgotten.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drift_seen_by_unready_successor_is_deferred_not_lost() {
    init_test_logging();
    let oracle = MockOracle::new("1.0");
    let queue = RequestQueue::new();
    let serve = queue.workload();
    let bump = oracle.clone();
    let eager = workload(move |ctx: WorkerContext| {
        let serve = serve.clone();
        let bump = bump.clone();
        async move {
            if *ctx.version() == "2.0" {
                bump.set("3.0");
            }
            ctx.check_drift().await?;
            serve(ctx).await
        }
    });

    let launcher = Arc::new(InProcessLauncher::new(Arc::new(oracle.clone()), eager));
    let handle = Supervisor::new(test_config(), Arc::new(oracle.clone()), launcher.clone())
        .start()
        .await
        .unwrap();
    assert!(wait_for(PATIENCE, || queue.listeners() == 1).await);

    oracle.set("2.0");
    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "1.0");

    let journal = handle.journal().clone();
    assert!(
        wait_for(PATIENCE, || spawned(&journal).len() == 3).await,
        "third worker never spawned: {:?}",
        spawned(&journal)
    );
    assert_eq!(launcher.launched_versions(), vec!["1.0", "2.0", "3.0"]);

    let second_listening = seq_of(&journal, WorkerId(2), &JournalEvent::Listening).unwrap();
    let second_retiring =
        seq_of(&journal, WorkerId(2), &JournalEvent::RetirementRequested).unwrap();
    assert!(second_listening < second_retiring);

    assert!(
        wait_for(PATIENCE, || seq_of(&journal, WorkerId(2), &JournalEvent::ShutdownSent)
            .is_some())
        .await
    );
    assert!(wait_for(PATIENCE, || queue.listeners() == 1).await);
    assert_eq!(queue.request(REQUEST_TIMEOUT).await.unwrap(), "3.0");

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot
        .iter()
        .any(|w| w.worker_id == WorkerId(3) && w.state == WorkerState::Listening));

    stop(handle).await;
}

/// Graceful stop sends shutdown to every worker and exits with success.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_shutdown_stops_all_workers() {
    init_test_logging();
    let oracle = MockOracle::new("1.0");
    let queue = RequestQueue::new();
    let launcher = InProcessLauncher::new(Arc::new(oracle.clone()), queue.workload());
    let handle = Supervisor::new(
        test_config().with_slots(2),
        Arc::new(oracle.clone()),
        Arc::new(launcher),
    )
    .start()
    .await
    .unwrap();

    assert!(wait_for(PATIENCE, || queue.listeners() == 2).await);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|w| w.state == WorkerState::Listening));
    assert_eq!(
        snapshot.iter().map(|w| w.slot.0).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let journal = handle.journal().clone();
    stop(handle).await;

    assert_eq!(count(&journal, |e| *e == JournalEvent::ShutdownSent), 2);
    let exits = exits(&journal);
    assert_eq!(exits.len(), 2);
    assert!(exits.values().all(|(_, planned)| *planned));
    assert_eq!(queue.listeners(), 0);
}

/// A worker that asks twice, or a second worker observing drift while one
/// replacement is in flight, does not start a second successor.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_drift_reports_start_one_successor() {
    init_test_logging();
    let oracle = MockOracle::new("1.0");
    let queue = RequestQueue::new();
    let handle = start(&oracle, &queue).await;

    oracle.set("3.0");
    let mut requests = Vec::new();
    for _ in 0..32 {
        let queue = queue.clone();
        requests.push(tokio::spawn(async move { queue.request(REQUEST_TIMEOUT).await }));
    }
    for request in requests {
        request.await.unwrap().unwrap();
    }

    let journal = handle.journal().clone();
    assert!(
        wait_for(PATIENCE, || seq_of(&journal, WorkerId(1), &JournalEvent::ShutdownSent)
            .is_some())
        .await
    );
    assert_eq!(count(&journal, |e| *e == JournalEvent::RetirementRequested), 1);
    assert_eq!(spawned(&journal).len(), 2);

    stop(handle).await;
}
