//! Drift gate behavior against the shared test doubles.
//!
//! Guarantees exercised here:
//! - Concurrent checks that all observe drift send one retirement signal.
//! - Once the signal is out, checks no longer query the oracle.
//! - A failed delivery re-arms the gate for the next check.

use autoswitch_core::{DriftGate, RetirementTransport, VersionOracle, VersionToken};
use autoswitch_test_utils::{MockOracle, RecordingTransport};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn gate(oracle: &MockOracle, transport: &Arc<RecordingTransport>) -> DriftGate {
    let oracle: Arc<dyn VersionOracle> = Arc::new(oracle.clone());
    let transport: Arc<dyn RetirementTransport> = transport.clone();
    DriftGate::new(VersionToken::from("1.0"), oracle, transport)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checks_send_one_signal() {
    let oracle = MockOracle::new("2.0");
    let transport = Arc::new(RecordingTransport::new());
    let gate = gate(&oracle, &transport);

    let checks: Vec<_> = (0..64)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.check().await })
        })
        .collect();
    for check in futures::future::join_all(checks).await {
        check.unwrap().unwrap();
    }

    assert_eq!(transport.signals(), 1);
    assert!(gate.signal_sent());
}

#[tokio::test]
async fn spent_gate_stops_querying_oracle() {
    let oracle = MockOracle::new("1.0");
    let transport = Arc::new(RecordingTransport::new());
    let gate = gate(&oracle, &transport);

    gate.check().await.unwrap();
    assert_eq!(oracle.calls(), 1);
    assert_eq!(transport.signals(), 0);

    oracle.set("2.0");
    gate.check().await.unwrap();
    assert_eq!(oracle.calls(), 2);
    assert_eq!(transport.signals(), 1);

    for _ in 0..10 {
        gate.check().await.unwrap();
    }
    assert_eq!(oracle.calls(), 2);
    assert_eq!(transport.signals(), 1);
}

#[tokio::test]
async fn failed_delivery_rearms_gate() {
    let oracle = MockOracle::new("2.0");
    let transport = Arc::new(RecordingTransport::new());
    transport.set_failing(true);
    let gate = gate(&oracle, &transport);

    gate.check().await.unwrap();
    assert!(!gate.signal_sent());
    assert_eq!(transport.signals(), 0);

    transport.set_failing(false);
    gate.check().await.unwrap();
    assert!(gate.signal_sent());
    assert_eq!(transport.signals(), 1);
    assert_eq!(oracle.calls(), 2);
}

#[tokio::test]
async fn oracle_failure_surfaces_without_signal() {
    let oracle = MockOracle::failing();
    let transport = Arc::new(RecordingTransport::new());
    let gate = gate(&oracle, &transport);

    assert!(gate.check().await.is_err());
    assert!(!gate.signal_sent());
    assert_eq!(transport.signals(), 0);
}
