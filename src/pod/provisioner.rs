//! Pod creation with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::cluster::PodApi;
use crate::config::PodConfig;

use super::{CorrelationLabels, Interrupt, OperationContext, PodError, PodReference};

/// Delay between create attempts.
pub const CREATE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Prefix of every generated pod name.
pub const POD_NAME_PREFIX: &str = "containerssh-";

/// Creates session pods from the configured template.
pub struct PodProvisioner {
    api: Arc<dyn PodApi>,
    namespace: String,
    template: PodSpec,
    console_container: usize,
    idle_command: Vec<String>,
}

impl PodProvisioner {
    /// Provisioner for the given pod settings.
    pub fn new(api: Arc<dyn PodApi>, config: &PodConfig) -> Self {
        Self {
            api,
            namespace: config.namespace.clone(),
            template: config.spec.clone(),
            console_container: config.console_container,
            idle_command: config.idle_command.clone(),
        }
    }

    /// Render the pod object submitted for a connection.
    ///
    /// The attach container runs the idle command so later execs can attach
    /// to it independently of its image entrypoint.
    pub fn build_pod(&self, labels: &CorrelationLabels) -> Pod {
        let mut spec = self.template.clone();
        if let Some(container) = spec.containers.get_mut(self.console_container) {
            container.command = Some(self.idle_command.clone());
            container.args = None;
        }

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(POD_NAME_PREFIX.to_owned()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.to_map()),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            ..Pod::default()
        }
    }

    /// Create the pod, retrying transient failures until the context ends.
    ///
    /// A create request that is already in flight is allowed to finish even
    /// if cancellation arrives meanwhile, so a pod accepted by the server is
    /// always reported back to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`PodError::Provision`] when the deadline passes or the server
    /// rejects the pod permanently, and [`PodError::Cancelled`] on cancellation.
    pub async fn create(
        &self,
        ctx: &OperationContext,
        labels: &CorrelationLabels,
    ) -> Result<PodReference, PodError> {
        let pod = self.build_pod(labels);
        let mut attempts: u32 = 0;
        let mut last_error = String::from("deadline expired before the first attempt");

        loop {
            if ctx.is_cancelled() {
                return Err(PodError::Cancelled);
            }
            if ctx.is_expired() {
                return Err(PodError::Provision {
                    attempts,
                    reason: last_error,
                });
            }

            attempts = attempts.saturating_add(1);
            debug!(
                namespace = %self.namespace,
                connection_id = labels.connection_id(),
                attempt = attempts,
                "creating pod"
            );
            let request = self.api.create(&self.namespace, &pod);
            match tokio::time::timeout_at(ctx.deadline(), request).await {
                Ok(Ok(created)) => {
                    let reference = PodReference::from_pod(&created, &self.namespace)?;
                    info!(
                        pod = %reference.name,
                        namespace = %reference.namespace,
                        connection_id = labels.connection_id(),
                        attempt = attempts,
                        "pod created"
                    );
                    return Ok(reference);
                }
                Ok(Err(e)) if !e.is_transient() => {
                    warn!(namespace = %self.namespace, error = %e, "pod rejected by control plane");
                    return Err(PodError::Provision {
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(
                        namespace = %self.namespace,
                        attempt = attempts,
                        error = %e,
                        "pod creation failed, will retry"
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = "create request did not complete before the deadline".to_owned();
                }
            }

            tokio::select! {
                biased;
                interrupt = ctx.done() => {
                    return Err(match interrupt {
                        Interrupt::Cancelled => PodError::Cancelled,
                        Interrupt::DeadlineExceeded => PodError::Provision {
                            attempts,
                            reason: last_error,
                        },
                    });
                }
                () = tokio::time::sleep(CREATE_RETRY_INTERVAL) => {}
            }
        }
    }
}
