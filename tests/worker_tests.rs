//! End-to-end worker tests: acquisition, supervision, hand-over and the
//! status API.

mod test_harness;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use hostwarden::claim::{ClaimState, ClaimStore, MemoryClaimStore};
use hostwarden::error::HostwardenError;
use hostwarden::inventory::{Credentials, HostEntry, Inventory, TransportKind};
use hostwarden::remote::TransportConnector;
use hostwarden::status::router;
use hostwarden::worker::{Worker, WorkerPhase};
use test_harness::{
    capture_sinks, local_inventory, test_config, wait_for, ScriptedConnector, Step, TestWorker,
};

async fn claim_state(store: &Arc<dyn ClaimStore>, host: &str) -> Option<(String, ClaimState)> {
    store
        .read(host)
        .await
        .unwrap()
        .map(|c| (c.owner_id, c.state))
}

#[tokio::test]
async fn single_worker_claims_first_host_and_runs() {
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let worker = TestWorker::spawn(
        test_config("pod-a"),
        local_inventory(&["app1", "app2", "app3"]),
        store.clone(),
        Arc::new(ScriptedConnector::hanging()),
    );

    let running = wait_for(Duration::from_secs(3), || {
        let store = store.clone();
        async move {
            claim_state(&store, "app1").await == Some(("pod-a".into(), ClaimState::Running))
        }
    })
    .await;
    assert!(running);
    assert_eq!(claim_state(&store, "app2").await, None);
    assert_eq!(claim_state(&store, "app3").await, None);

    let status = worker.worker.subscribe().borrow().clone();
    assert_eq!(status.phase, WorkerPhase::Supervising);
    assert_eq!(status.host.as_deref(), Some("app1"));
    assert_eq!(status.acquisitions, 1);

    let rx = worker.worker.subscribe();
    worker.stop().await.unwrap();
    assert_eq!(rx.borrow().phase, WorkerPhase::Stopped);
    assert_eq!(
        claim_state(&store, "app1").await,
        Some(("pod-a".into(), ClaimState::Released))
    );
}

#[tokio::test]
async fn one_of_two_simultaneous_workers_wins_the_host() {
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let inventory = local_inventory(&["app1"]);

    let a = TestWorker::spawn(
        test_config("pod-a"),
        inventory.clone(),
        store.clone(),
        Arc::new(ScriptedConnector::hanging()),
    );
    let b = TestWorker::spawn(
        test_config("pod-b"),
        inventory.clone(),
        store.clone(),
        Arc::new(ScriptedConnector::hanging()),
    );

    assert!(
        wait_for(Duration::from_secs(3), || {
            let store = store.clone();
            async move {
                claim_state(&store, "app1")
                    .await
                    .is_some_and(|(_, state)| state == ClaimState::Running)
            }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (owner, _) = claim_state(&store, "app1").await.unwrap();
    let (winner, loser) = if owner == "pod-a" { (a, b) } else { (b, a) };
    assert_eq!(loser.worker.subscribe().borrow().phase, WorkerPhase::Acquiring);
    assert_eq!(winner.worker.subscribe().borrow().phase, WorkerPhase::Supervising);

    // Once the winner shuts down and releases, the waiting worker takes over.
    let loser_id = loser.worker.worker_id().to_string();
    winner.stop().await.unwrap();

    let handed_over = wait_for(Duration::from_secs(3), || {
        let store = store.clone();
        let expected = Some((loser_id.clone(), ClaimState::Running));
        async move { claim_state(&store, "app1").await == expected }
    })
    .await;
    assert!(handed_over);
    loser.stop().await.unwrap();
}

#[tokio::test]
async fn failing_host_is_given_up_for_the_next_one() {
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let connector = Arc::new(ScriptedConnector::new(
        [Step::Refuse, Step::Refuse],
        Step::Hang,
    ));
    let mut config = test_config("pod-a");
    config.supervisor.max_consecutive_failures = Some(2);

    let worker = TestWorker::spawn(
        config,
        local_inventory(&["app1", "app2"]),
        store.clone(),
        connector.clone(),
    );

    let moved = wait_for(Duration::from_secs(3), || {
        let store = store.clone();
        async move {
            claim_state(&store, "app2").await == Some(("pod-a".into(), ClaimState::Running))
        }
    })
    .await;
    assert!(moved);
    assert_eq!(
        claim_state(&store, "app1").await,
        Some(("pod-a".into(), ClaimState::Failed))
    );
    assert_eq!(worker.worker.subscribe().borrow().acquisitions, 2);

    let hosts: Vec<String> = connector.open_records().into_iter().map(|r| r.host).collect();
    assert_eq!(hosts, vec!["app1", "app1", "app2"]);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn unusable_credentials_stop_the_worker() {
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let host = HostEntry::new("app1", "127.0.0.1", TransportKind::SecureShell).with_credentials(
        Credentials {
            user: Some("deploy".into()),
            private_key_file: Some(PathBuf::from("/nonexistent/id_rsa")),
            password: None,
        },
    );
    let worker = Worker::new(
        test_config("pod-a"),
        Arc::new(Inventory::new(vec![host]).unwrap()),
        store.clone(),
        Arc::new(TransportConnector::new(Duration::from_secs(1))),
    );

    let err = tokio::time::timeout(Duration::from_secs(5), worker.run(CancellationToken::new()))
        .await
        .expect("worker should stop on its own")
        .unwrap_err();

    assert!(matches!(err, HostwardenError::Config(_)));
    assert_eq!(worker.subscribe().borrow().phase, WorkerPhase::Failed);
    assert_eq!(
        claim_state(&store, "app1").await,
        Some(("pod-a".into(), ClaimState::Failed))
    );
}

#[tokio::test]
async fn invalid_config_is_rejected_before_claiming() {
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let mut config = test_config("pod-a");
    config.claim.heartbeat_interval_ms = config.claim.stale_after_ms;

    let worker = Worker::new(
        config,
        local_inventory(&["app1"]),
        store.clone(),
        Arc::new(ScriptedConnector::hanging()),
    );
    let err = worker.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HostwardenError::Config(_)));
    assert!(store.read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn local_host_from_inventory_file_streams_output() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[workers]\napp1 ansible_connection=local env_GREETING=hello"
    )
    .unwrap();
    let inventory = Arc::new(Inventory::load(file.path(), "workers").await.unwrap());

    let mut config = test_config("pod-a");
    config.supervisor.command =
        "echo \"$GREETING from $HOSTWARDEN_HOST ($HOSTWARDEN_WORKER_ID)\"; echo oops >&2; exec sleep 30"
            .into();
    let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
    let (sinks, stdout, stderr) = capture_sinks();
    let worker = Arc::new(
        Worker::new(
            config,
            inventory,
            store.clone(),
            Arc::new(TransportConnector::new(Duration::from_secs(1))),
        )
        .with_output(sinks),
    );

    let shutdown = CancellationToken::new();
    let handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    let printed = wait_for(Duration::from_secs(5), || {
        let seen = stdout.contents().contains("hello from app1 (pod-a)")
            && stderr.contents().contains("oops");
        async move { seen }
    })
    .await;
    assert!(printed, "stdout: {:?}", stdout.contents());

    // The status API reflects the running command.
    let response = router(worker.status_state())
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["worker_id"], "pod-a");
    assert_eq!(json["host"], "app1");
    assert_eq!(json["state"], "running");
    assert_eq!(json["restarts"], 0);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(
        claim_state(&store, "app1").await,
        Some(("pod-a".into(), ClaimState::Released))
    );
}
