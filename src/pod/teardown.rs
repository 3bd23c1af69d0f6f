//! Pod deletion with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::PodApi;

use super::{OperationContext, PodError, PodReference};

/// Delay between delete attempts.
pub const DELETE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Deletes session pods.
///
/// The loop holds no session lock, so backoff sleeps never stall other
/// operations on the same session.
pub struct TeardownLoop {
    api: Arc<dyn PodApi>,
}

impl TeardownLoop {
    /// Teardown loop using the given control plane.
    pub fn new(api: Arc<dyn PodApi>) -> Self {
        Self { api }
    }

    /// Delete the pod, retrying until it is gone or the deadline passes.
    ///
    /// A pod that no longer exists counts as deleted. Returns the number of
    /// delete requests issued.
    ///
    /// # Errors
    ///
    /// Returns [`PodError::TeardownFailed`] with the last failure once the
    /// deadline has passed.
    pub async fn delete(&self, ctx: &OperationContext, pod: &PodReference) -> Result<u32, PodError> {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let request = self.api.delete(&pod.namespace, &pod.name);
            let reason = match tokio::time::timeout_at(ctx.deadline(), request).await {
                Ok(Ok(())) => {
                    info!(pod = %pod.name, namespace = %pod.namespace, attempts, "pod deleted");
                    return Ok(attempts);
                }
                Ok(Err(e)) if e.is_not_found() => {
                    debug!(pod = %pod.name, namespace = %pod.namespace, "pod already gone");
                    return Ok(attempts);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "delete request did not complete before the deadline".to_owned(),
            };

            if ctx.is_expired() {
                return Err(PodError::TeardownFailed {
                    pod: pod.name.clone(),
                    attempts,
                    reason,
                });
            }

            warn!(
                pod = %pod.name,
                namespace = %pod.namespace,
                attempt = attempts,
                error = %reason,
                "pod deletion failed, will retry"
            );
            let next = Instant::now()
                .checked_add(DELETE_RETRY_INTERVAL)
                .map_or(ctx.deadline(), |at| at.min(ctx.deadline()));
            tokio::time::sleep_until(next).await;
        }
    }
}
