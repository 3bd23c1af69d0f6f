//! Event-driven wait for a pod to become usable.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::cluster::{PodApi, PodEvent};

use super::{is_ready, Interrupt, OperationContext, PodError, PodPhase, PodReference};

/// Classification of a single watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Running and ready, or already finished.
    Available,
    /// Removed before becoming usable.
    Lost,
    /// Keep waiting.
    Pending,
}

/// Classify a watch event.
pub fn classify(event: &PodEvent) -> Availability {
    let pod = match event {
        PodEvent::Deleted(_) => return Availability::Lost,
        PodEvent::Applied(pod) => pod,
    };
    match PodPhase::of(pod) {
        PodPhase::Failed | PodPhase::Succeeded => Availability::Available,
        PodPhase::Running if is_ready(pod) => Availability::Available,
        _ => Availability::Pending,
    }
}

/// Watches a pod until it is available, lost, or the context ends.
pub struct ReadinessWatcher {
    api: Arc<dyn PodApi>,
}

impl ReadinessWatcher {
    /// Watcher using the given control plane.
    pub fn new(api: Arc<dyn PodApi>) -> Self {
        Self { api }
    }

    /// Wait for the pod to be running and ready, or to have finished.
    ///
    /// Uses one subscription; the returned reference reflects the last
    /// observed snapshot.
    ///
    /// # Errors
    ///
    /// - [`PodError::PodLost`] if the pod is deleted while waiting.
    /// - [`PodError::ReadinessTimeout`] when the deadline passes.
    /// - [`PodError::WatchInterrupted`] if the subscription fails or ends.
    /// - [`PodError::Cancelled`] on cancellation.
    /// - [`PodError::Cluster`] if the subscription cannot be opened.
    pub async fn wait_until_available(
        &self,
        ctx: &OperationContext,
        pod: PodReference,
    ) -> Result<PodReference, PodError> {
        let mut reference = pod;

        let mut events = tokio::select! {
            biased;
            interrupt = ctx.done() => return Err(interrupted(interrupt, &reference)),
            opened = self.api.watch(&reference.namespace, &reference.name) => opened?,
        };
        debug!(pod = %reference.name, namespace = %reference.namespace, "watching pod");

        loop {
            tokio::select! {
                biased;
                interrupt = ctx.done() => {
                    let err = interrupted(interrupt, &reference);
                    warn!(pod = %reference.name, error = %err, "stopped waiting for pod");
                    return Err(err);
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        let availability = classify(&event);
                        if availability == Availability::Lost {
                            return Err(PodError::PodLost { pod: reference.name });
                        }
                        reference.observe(event.pod());
                        if availability == Availability::Available {
                            info!(
                                pod = %reference.name,
                                phase = %reference.phase,
                                ready = reference.ready,
                                "pod available"
                            );
                            return Ok(reference);
                        }
                        debug!(pod = %reference.name, phase = %reference.phase, "pod not ready yet");
                    }
                    Some(Err(e)) => {
                        return Err(PodError::WatchInterrupted {
                            pod: reference.name,
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        return Err(PodError::WatchInterrupted {
                            pod: reference.name,
                            reason: "watch stream ended".to_owned(),
                        });
                    }
                },
            }
        }
    }
}

fn interrupted(interrupt: Interrupt, reference: &PodReference) -> PodError {
    match interrupt {
        Interrupt::Cancelled => PodError::Cancelled,
        Interrupt::DeadlineExceeded => PodError::ReadinessTimeout {
            pod: reference.name.clone(),
            phase: reference.phase,
        },
    }
}
