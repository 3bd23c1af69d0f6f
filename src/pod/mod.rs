//! Pod lifecycle building blocks: provisioning, readiness and teardown.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

use crate::cluster::{ClusterError, PodApi};

pub mod context;
pub mod provisioner;
pub mod readiness;
pub mod teardown;

pub use context::{Interrupt, OperationContext};
pub use provisioner::PodProvisioner;
pub use readiness::{Availability, ReadinessWatcher};
pub use teardown::TeardownLoop;

/// Label carrying the hex-encoded connection identifier.
pub const LABEL_CONNECTION_ID: &str = "containerssh_connection_id";
/// Label carrying the client IP address.
pub const LABEL_IP: &str = "containerssh_ip";
/// Label carrying the authenticated username.
pub const LABEL_USERNAME: &str = "containerssh_username";

const MAX_LABEL_VALUE_LEN: usize = 63;

/// Errors from the pod lifecycle steps.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PodError {
    /// Creation did not succeed within its budget.
    #[error("failed to create pod after {attempts} attempt(s): {reason}")]
    Provision {
        /// Number of create requests issued.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },
    /// The pod never became available before the deadline.
    #[error("pod {pod} did not become ready in time (last phase: {phase})")]
    ReadinessTimeout {
        /// Pod name.
        pod: String,
        /// Last observed phase.
        phase: PodPhase,
    },
    /// The pod was deleted while waiting for it.
    #[error("pod {pod} was deleted before it became ready")]
    PodLost {
        /// Pod name.
        pod: String,
    },
    /// The watch subscription broke before a terminal event arrived.
    #[error("watch on pod {pod} was interrupted: {reason}")]
    WatchInterrupted {
        /// Pod name.
        pod: String,
        /// Stream failure reason.
        reason: String,
    },
    /// Deletion did not succeed within its budget.
    #[error("failed to delete pod {pod} after {attempts} attempt(s): {reason}")]
    TeardownFailed {
        /// Pod name.
        pod: String,
        /// Number of delete requests issued.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },
    /// The operation was cancelled by a disconnect.
    #[error("operation cancelled")]
    Cancelled,
    /// A control-plane request failed in a way that is not retried.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Pod phase as reported in `status.phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    /// Accepted but not all containers are running yet.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// Missing or unrecognised phase.
    Unknown,
}

impl PodPhase {
    /// Phase of a pod snapshot.
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Whether the pod has finished running.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Whether the snapshot carries a `Ready=True` condition.
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The session's handle on its provisioned pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodReference {
    /// Server-generated name.
    pub name: String,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Server-side creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Last observed phase.
    pub phase: PodPhase,
    /// Last observed ready condition.
    pub ready: bool,
}

impl PodReference {
    /// Build a reference from a server snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PodError::Provision`] if the server returned an object without a name.
    pub fn from_pod(pod: &Pod, fallback_namespace: &str) -> Result<Self, PodError> {
        let name = pod.metadata.name.clone().ok_or_else(|| PodError::Provision {
            attempts: 1,
            reason: "control plane returned a pod without a name".to_owned(),
        })?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| fallback_namespace.to_owned());
        Ok(Self {
            name,
            namespace,
            created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            phase: PodPhase::of(pod),
            ready: is_ready(pod),
        })
    }

    /// Refresh the observed phase and ready condition from a newer snapshot.
    pub fn observe(&mut self, pod: &Pod) {
        self.phase = PodPhase::of(pod);
        self.ready = is_ready(pod);
        if self.created_at.is_none() {
            self.created_at = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
        }
    }
}

/// Labels tying a pod back to the connection that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationLabels {
    connection_id: String,
    client_ip: String,
    username: String,
}

impl CorrelationLabels {
    /// Compute the label set for a connection.
    pub fn new(connection_id: &[u8], client_ip: IpAddr, username: &str) -> Self {
        Self {
            connection_id: hex::encode(connection_id),
            client_ip: ip_label_value(client_ip),
            username: sanitize_label_value(username),
        }
    }

    /// Hex-encoded connection identifier.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Label-safe client address.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Label-safe username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Labels as stored in pod metadata.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_CONNECTION_ID.to_owned(), self.connection_id.clone()),
            (LABEL_IP.to_owned(), self.client_ip.clone()),
            (LABEL_USERNAME.to_owned(), self.username.clone()),
        ])
    }

    /// Selector matching every pod of this connection.
    pub fn selector(&self) -> String {
        format!("{LABEL_CONNECTION_ID}={}", self.connection_id)
    }
}

/// Selector matching the pods of a raw connection identifier.
pub fn connection_selector(connection_id: &[u8]) -> String {
    format!("{LABEL_CONNECTION_ID}={}", hex::encode(connection_id))
}

/// List the pods correlated with a connection.
///
/// # Errors
///
/// Returns the control-plane error if the list request fails.
pub async fn find_session_pods(
    api: &dyn PodApi,
    namespace: &str,
    connection_id: &[u8],
) -> Result<Vec<Pod>, ClusterError> {
    api.list(namespace, &connection_selector(connection_id)).await
}

/// Label-safe rendering of a client address.
///
/// IPv6 addresses are written as eight zero-padded groups so that distinct
/// addresses never collapse onto the same value.
fn ip_label_value(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|group| format!("{group:04x}"))
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Coerce arbitrary text into a valid label value.
fn sanitize_label_value(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();
    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}
