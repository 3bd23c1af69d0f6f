//! Control-plane access for namespaced pods.
//!
//! Everything else in the crate talks to the cluster through [`PodApi`], so the
//! lifecycle logic can be exercised against an in-memory implementation.

use std::pin::Pin;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio_stream::Stream;

pub mod client;
pub mod exec;

pub use client::KubePodApi;
pub use exec::KubeExecLauncher;

/// A change observed on a watched pod.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// The pod was listed or modified; carries the latest snapshot.
    Applied(Pod),
    /// The pod was removed; carries the last known snapshot.
    Deleted(Pod),
}

impl PodEvent {
    /// Snapshot carried by the event.
    pub fn pod(&self) -> &Pod {
        match self {
            Self::Applied(pod) | Self::Deleted(pod) => pod,
        }
    }
}

/// Stream of watch events for a single pod.
pub type PodEventStream = Pin<Box<dyn Stream<Item = Result<PodEvent, ClusterError>> + Send>>;

/// Errors reported by the control plane.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// The named object does not exist.
    #[error("pod {0} not found")]
    NotFound(String),
    /// The API server answered with an error status.
    #[error("control plane rejected the request ({code}): {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Server-provided message.
        message: String,
    },
    /// The request never got an answer from the API server.
    #[error("control plane unreachable: {0}")]
    Transport(String),
    /// A watch subscription failed after it was opened.
    #[error("watch stream failed: {0}")]
    Watch(String),
}

impl ClusterError {
    /// Returns `true` for the typed "not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` when retrying the same request may succeed.
    ///
    /// Client errors other than conflicts and throttling are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Api { code, .. } => matches!(code, 409 | 429) || *code >= 500,
            Self::Transport(_) | Self::Watch(_) => true,
        }
    }
}

/// Narrow view of the pod endpoints this crate needs.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Submit a pod for creation and return the object as stored by the server.
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;

    /// List pods matching an equality label selector (`key=value,...`).
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Open a list+watch subscription scoped to exactly one pod name.
    async fn watch(&self, namespace: &str, name: &str) -> Result<PodEventStream, ClusterError>;

    /// Delete a pod by name.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
