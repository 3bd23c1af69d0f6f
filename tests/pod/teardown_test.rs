//! Bounded pod deletion.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use kuberun::pod::{OperationContext, PodError, PodPhase, PodReference, TeardownLoop};

use crate::fake_cluster::{FakePodApi, Rollout};

fn missing_pod() -> PodReference {
    PodReference {
        name: "containerssh-gone".to_owned(),
        namespace: "default".to_owned(),
        created_at: None,
        phase: PodPhase::Running,
        ready: true,
    }
}

fn teardown(api: &FakePodApi) -> TeardownLoop {
    TeardownLoop::new(Arc::new(api.clone()))
}

#[tokio::test(start_paused = true)]
async fn missing_pod_counts_as_deleted() {
    let api = FakePodApi::new(Rollout::StayPending);
    let ctx = OperationContext::new(Duration::from_secs(60));

    let attempts = teardown(&api)
        .delete(&ctx, &missing_pod())
        .await
        .expect("a pod that is already gone is deleted");

    assert_eq!(attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn failures_are_retried_until_the_pod_is_gone() {
    let api = FakePodApi::new(Rollout::StayPending);
    api.fail_deletes(3);
    let ctx = OperationContext::new(Duration::from_secs(60));
    let started = Instant::now();

    let attempts = teardown(&api)
        .delete(&ctx, &missing_pod())
        .await
        .expect("fourth attempt finds the pod gone");

    assert_eq!(attempts, 4);
    assert_eq!(started.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn last_attempt_lands_on_the_deadline() {
    let api = FakePodApi::new(Rollout::StayPending);
    api.fail_deletes(u32::MAX);
    let ctx = OperationContext::new(Duration::from_secs(25));

    let err = teardown(&api)
        .delete(&ctx, &missing_pod())
        .await
        .expect_err("every attempt fails");

    match err {
        PodError::TeardownFailed { pod, attempts, reason } => {
            assert_eq!(pod, "containerssh-gone");
            assert_eq!(attempts, 4);
            assert!(reason.contains("503"));
        }
        other => panic!("expected teardown failure, got {other:?}"),
    }
    let times = api.delete_attempts();
    assert_eq!(times[3] - times[2], Duration::from_secs(5));
}
