//! Readiness waits against a scripted control plane.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kuberun::cluster::PodApi;
use kuberun::pod::{
    CorrelationLabels, OperationContext, PodError, PodPhase, PodProvisioner, PodReference,
    ReadinessWatcher,
};
use kuberun::config::PodConfig;

use crate::fake_cluster::{FakePodApi, Rollout};

async fn created_pod(api: &FakePodApi) -> PodReference {
    let labels = CorrelationLabels::new(b"watch", [127, 0, 0, 1].into(), "alice");
    let ctx = OperationContext::new(Duration::from_secs(60));
    PodProvisioner::new(Arc::new(api.clone()), &PodConfig::default())
        .create(&ctx, &labels)
        .await
        .expect("create should succeed")
}

fn watcher(api: &FakePodApi) -> ReadinessWatcher {
    let api: Arc<dyn PodApi> = Arc::new(api.clone());
    ReadinessWatcher::new(api)
}

#[tokio::test(start_paused = true)]
async fn ready_event_completes_the_wait() {
    let api = FakePodApi::new(Rollout::BecomeReady(Duration::from_secs(7)));
    let pod = created_pod(&api).await;
    let ctx = OperationContext::new(Duration::from_secs(60));
    let started = Instant::now();

    let ready = watcher(&api)
        .wait_until_available(&ctx, pod.clone())
        .await
        .expect("pod should become ready");

    assert_eq!(started.elapsed(), Duration::from_secs(7));
    assert_eq!(ready.name, pod.name);
    assert_eq!(ready.phase, PodPhase::Running);
    assert!(ready.ready);
    assert_eq!(api.watch_calls(), 1);
    assert!(api.all_watches_closed());
}

#[tokio::test(start_paused = true)]
async fn deadline_reports_last_observed_phase() {
    let api = FakePodApi::new(Rollout::StayPending);
    let pod = created_pod(&api).await;
    let ctx = OperationContext::new(Duration::from_secs(30));

    let err = watcher(&api)
        .wait_until_available(&ctx, pod.clone())
        .await
        .expect_err("pod never becomes ready");

    match err {
        PodError::ReadinessTimeout { pod: name, phase } => {
            assert_eq!(name, pod.name);
            assert_eq!(phase, PodPhase::Pending);
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert!(api.all_watches_closed());
}

#[tokio::test(start_paused = true)]
async fn deletion_while_waiting_is_reported() {
    let api = FakePodApi::new(Rollout::Vanish(Duration::from_secs(3)));
    let pod = created_pod(&api).await;
    let ctx = OperationContext::new(Duration::from_secs(60));

    let err = watcher(&api)
        .wait_until_available(&ctx, pod)
        .await
        .expect_err("pod was deleted");

    assert!(matches!(err, PodError::PodLost { .. }));
}

#[tokio::test(start_paused = true)]
async fn stream_failure_is_not_resubscribed() {
    let api = FakePodApi::new(Rollout::BreakWatch(Duration::from_secs(3)));
    let pod = created_pod(&api).await;
    let ctx = OperationContext::new(Duration::from_secs(60));

    let err = watcher(&api)
        .wait_until_available(&ctx, pod)
        .await
        .expect_err("watch breaks");

    match err {
        PodError::WatchInterrupted { reason, .. } => assert!(reason.contains("connection reset")),
        other => panic!("expected watch interruption, got {other:?}"),
    }
    assert_eq!(api.watch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn completed_pod_counts_as_available() {
    let api = FakePodApi::new(Rollout::Complete(Duration::from_secs(2)));
    let pod = created_pod(&api).await;
    let ctx = OperationContext::new(Duration::from_secs(60));

    let done = watcher(&api)
        .wait_until_available(&ctx, pod)
        .await
        .expect("finished pod is available");

    assert_eq!(done.phase, PodPhase::Succeeded);
    assert!(!done.ready);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_wait_promptly() {
    let api = FakePodApi::new(Rollout::StayPending);
    let pod = created_pod(&api).await;
    let token = CancellationToken::new();
    let ctx = OperationContext::with_token(token.clone(), Duration::from_secs(60));

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        token.cancel();
    });
    let started = Instant::now();
    let err = watcher(&api)
        .wait_until_available(&ctx, pod)
        .await
        .expect_err("wait is cancelled");
    canceller.await.expect("canceller should not panic");

    assert!(matches!(err, PodError::Cancelled));
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert!(api.all_watches_closed());
}
