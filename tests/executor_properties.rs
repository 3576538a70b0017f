//! Properties of concurrent node dispatch.

mod common;

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use common::{network, transport_error, RecordingExecutor};
use ledgerforge::orchestrator::{for_each_node, map_nodes, FailurePolicy, NodeSelection};
use ledgerforge::{BuildError, HostId};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_every_node_runs_once_and_failures_are_reported(
        failing in prop::collection::vec(any::<bool>(), 0..12)
    ) {
        let n = failing.len();
        let host = Arc::new(RecordingExecutor::new("h0"));
        let net = network("ethclassic", n, host);
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(Mutex::new(vec![0u32; n]));

        let result = runtime().block_on({
            let calls = Arc::clone(&calls);
            let failing = failing.clone();
            async move {
                for_each_node(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, move |_, node| {
                    let calls = Arc::clone(&calls);
                    let fail = failing[node.absolute_index];
                    async move {
                        calls.lock().unwrap()[node.absolute_index] += 1;
                        if fail {
                            Err(BuildError::from(transport_error("unreachable")))
                        } else {
                            Ok(())
                        }
                    }
                })
                .await
            }
        });

        prop_assert!(calls.lock().unwrap().iter().all(|&c| c == 1));

        let expected: Vec<usize> = (0..n).filter(|&i| failing[i]).collect();
        match result {
            Ok(()) => prop_assert!(expected.is_empty()),
            Err(err) => {
                prop_assert!(!expected.is_empty());
                prop_assert_eq!(err.failed_nodes(), expected);
            }
        }
    }

    #[test]
    fn prop_results_are_in_node_order(n in 0usize..12) {
        let host = Arc::new(RecordingExecutor::new("h0"));
        let net = network("ethclassic", n, host);
        let (_tx, rx) = watch::channel(false);

        let values = runtime().block_on(async move {
            map_nodes(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, |_, node| async move {
                // Later nodes finish first.
                tokio::time::sleep(Duration::from_micros((20 - node.absolute_index as u64) * 50)).await;
                Ok(node.absolute_index * 10)
            })
            .await
        })
        .unwrap();

        prop_assert_eq!(values, (0..n).map(|i| i * 10).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_newly_added_selection_skips_prior_nodes() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let mut net = network("ethclassic", 3, host);
    net.add_node("10.0.0.20", HostId::new("h0"));
    net.add_node("10.0.0.21", HostId::new("h0"));
    let (_tx, rx) = watch::channel(false);

    let seen = map_nodes(&net, NodeSelection::NewlyAdded, FailurePolicy::RunToCompletion, &rx, |_, node| async move {
        Ok(node.absolute_index)
    })
    .await
    .unwrap();

    assert_eq!(seen, vec![3, 4]);
}

#[tokio::test]
async fn test_panicking_task_is_reported_not_propagated() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let net = network("ethclassic", 3, host);
    let (_tx, rx) = watch::channel(false);

    let err = for_each_node(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, |_, node| async move {
        if node.absolute_index == 1 {
            panic!("boom on node one");
        }
        Ok(())
    })
    .await
    .unwrap_err();

    match err {
        BuildError::NodeTasksFailed { total, failures } => {
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, BuildError::TaskPanicked(ref msg) if msg.contains("boom")));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_host_fails_only_that_node() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let mut net = network("ethclassic", 2, host);
    net.push_node("10.0.0.99", HostId::new("missing"));
    let (_tx, rx) = watch::channel(false);
    let ran = Arc::new(Mutex::new(BTreeSet::new()));

    let err = {
        let ran = Arc::clone(&ran);
        for_each_node(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, move |_, node| {
            let ran = Arc::clone(&ran);
            async move {
                ran.lock().unwrap().insert(node.absolute_index);
                Ok(())
            }
        })
        .await
        .unwrap_err()
    };

    assert_eq!(err.failed_nodes(), vec![2]);
    assert_eq!(*ran.lock().unwrap(), BTreeSet::from([0, 1]));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_reaches_in_flight_tasks() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let net = network("ethclassic", 2, host);
    let (tx, rx) = watch::channel(false);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = tx.send(true);
        tx
    });

    let err = for_each_node(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, |_, _| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.failed_nodes(), vec![0, 1]);
    drop(canceller.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_aborts_siblings() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let net = network("ethclassic", 3, host);
    let (_tx, rx) = watch::channel(false);
    let finished = Arc::new(Mutex::new(Vec::new()));

    let err = {
        let finished = Arc::clone(&finished);
        for_each_node(&net, NodeSelection::All, FailurePolicy::FailFast, &rx, move |_, node| {
            let finished = Arc::clone(&finished);
            async move {
                if node.absolute_index == 0 {
                    return Err(BuildError::Config("bad node".to_string()));
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                finished.lock().unwrap().push(node.absolute_index);
                Ok(())
            }
        })
        .await
        .unwrap_err()
    };

    assert_eq!(err.failed_nodes(), vec![0]);
    assert!(finished.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_task_dying_before_its_guard_counts_as_failure() {
    let host = Arc::new(RecordingExecutor::new("h0"));
    let net = network("ethclassic", 3, host);
    let (_tx, rx) = watch::channel(false);

    // The panic happens while building the future, outside the per-task guard.
    let err = map_nodes(&net, NodeSelection::All, FailurePolicy::RunToCompletion, &rx, |_, node| {
        if node.absolute_index == 1 {
            panic!("setup failed");
        }
        async move { Ok(node.absolute_index) }
    })
    .await
    .unwrap_err();

    match err {
        BuildError::NodeTasksFailed { total, ref failures } => {
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, BuildError::TaskPanicked(_)));
        }
        ref other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.failed_nodes(), vec![1]);
}
