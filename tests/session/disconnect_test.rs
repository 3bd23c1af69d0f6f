//! Disconnect and teardown behaviour of `ConnectionSession`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kuberun::cluster::ClusterError;
use kuberun::pod::PodError;
use kuberun::session::{SessionError, SessionState};

use crate::fake_cluster::{backend, client_addr, FakePodApi, RecordingLauncher, Rollout};

fn session_for(api: &FakePodApi) -> kuberun::session::ConnectionSession {
    backend(api, &RecordingLauncher::default()).on_network_connection(b"conn-2".to_vec(), client_addr())
}

#[tokio::test(start_paused = true)]
async fn idle_disconnect_makes_no_cluster_calls() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    let session = session_for(&api);

    session.on_disconnect().await;
    session.on_disconnect().await;

    assert_eq!(session.state().await, SessionState::Terminated);
    assert_eq!(api.total_calls(), 0);

    let late = session.on_handshake_success("alice").await;
    assert!(matches!(
        late,
        Err(SessionError::AlreadyStarted {
            state: SessionState::Terminated
        })
    ));
    assert_eq!(api.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn ready_session_pod_is_deleted_once() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    let session = session_for(&api);
    session
        .on_handshake_success("alice")
        .await
        .expect("handshake should succeed");

    session.on_disconnect().await;
    session.on_disconnect().await;

    assert_eq!(session.state().await, SessionState::Terminated);
    assert!(session.pod().await.is_none());
    assert_eq!(api.delete_attempts().len(), 1);
    assert_eq!(api.pod_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_deletes_are_retried_every_ten_seconds() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    api.fail_deletes(2);
    let session = session_for(&api);
    session
        .on_handshake_success("alice")
        .await
        .expect("handshake should succeed");

    session.on_disconnect().await;

    let attempts = api.delete_attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1] - attempts[0], Duration::from_secs(10));
    assert_eq!(attempts[2] - attempts[1], Duration::from_secs(10));
    assert_eq!(api.pod_count(), 0);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn teardown_gives_up_when_its_budget_runs_out() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    api.fail_deletes(u32::MAX);
    let session = session_for(&api);
    session
        .on_handshake_success("alice")
        .await
        .expect("handshake should succeed");
    let started = Instant::now();

    session.on_disconnect().await;

    assert_eq!(started.elapsed(), Duration::from_secs(60));
    assert_eq!(api.delete_attempts().len(), 7);
    assert_eq!(api.pod_count(), 1);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_after_readiness_timeout_removes_pod() {
    let api = FakePodApi::new(Rollout::StayPending);
    let session = session_for(&api);
    let result = session.on_handshake_success("bob").await;
    assert!(matches!(
        result,
        Err(SessionError::Pod(PodError::ReadinessTimeout { .. }))
    ));
    assert_eq!(api.pod_count(), 1);

    session.on_disconnect().await;

    assert_eq!(api.delete_attempts().len(), 1);
    assert_eq!(api.pod_count(), 0);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_after_pod_loss_tolerates_missing_pod() {
    let api = FakePodApi::new(Rollout::Vanish(Duration::from_secs(1)));
    let session = session_for(&api);
    let _ = session.on_handshake_success("bob").await;

    session.on_disconnect().await;

    assert_eq!(api.delete_attempts().len(), 1);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_created_pod_deletes_nothing() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    api.fail_creates(vec![ClusterError::Api {
        code: 403,
        message: "pods is forbidden".to_owned(),
    }]);
    let session = session_for(&api);
    let _ = session.on_handshake_success("bob").await;

    session.on_disconnect().await;

    assert!(api.delete_attempts().is_empty());
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_readiness_cancels_watch_and_deletes_pod() {
    let api = FakePodApi::new(Rollout::StayPending);
    let session = Arc::new(session_for(&api));

    let handshake = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.on_handshake_success("alice").await }
    });
    api.wait_for_watch().await;
    assert_eq!(session.state().await, SessionState::Provisioning);
    let started = Instant::now();

    session.on_disconnect().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    let result = handshake.await.expect("handshake task should not panic");
    assert!(matches!(
        result,
        Err(SessionError::Pod(PodError::Cancelled))
    ));
    assert!(api.all_watches_closed());
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.delete_attempts().len(), 1);
    assert_eq!(api.pod_count(), 0);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_inflight_create_deletes_the_pod() {
    let api = FakePodApi::new(Rollout::StayPending);
    api.slow_creates(Duration::from_secs(5));
    let session = Arc::new(session_for(&api));

    let handshake = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.on_handshake_success("alice").await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.pod_count(), 0);
    let started = Instant::now();

    session.on_disconnect().await;

    // Disconnect waits for the create answer, then removes what it produced.
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    let result = handshake.await.expect("handshake task should not panic");
    assert!(matches!(
        result,
        Err(SessionError::Pod(PodError::Cancelled))
    ));
    assert_eq!(api.create_calls(), 1);
    assert_eq!(api.watch_calls(), 0);
    assert_eq!(api.delete_attempts().len(), 1);
    assert_eq!(api.pod_count(), 0);
    assert_eq!(session.state().await, SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_create_retries_stops_creating() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(1)));
    api.fail_creates(vec![ClusterError::Transport("connection refused".to_owned()); 100]);
    let session = Arc::new(session_for(&api));

    let handshake = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.on_handshake_success("alice").await }
    });
    tokio::time::sleep(Duration::from_secs(15)).await;

    session.on_disconnect().await;

    let result = handshake.await.expect("handshake task should not panic");
    assert!(matches!(
        result,
        Err(SessionError::Pod(PodError::Cancelled))
    ));
    assert_eq!(api.create_calls(), 2);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.create_calls(), 2);
    assert!(api.delete_attempts().is_empty());
    assert_eq!(session.state().await, SessionState::Terminated);
}
