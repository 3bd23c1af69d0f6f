//! Per-connection session lifecycle.
//!
//! A [`ConnectionSession`] is created for every accepted network connection.
//! The protocol engine drives it through three layers:
//!
//! - connection: auth callbacks, [`ConnectionSession::on_handshake_success`],
//!   [`ConnectionSession::on_disconnect`];
//! - session: [`SessionHandle::on_session_channel`];
//! - channel: [`ChannelHandler`] requests.
//!
//! Lifecycle state lives behind one mutex that is never held across a
//! control-plane call. A separate turn lock is held by the handshake for its
//! whole duration, which lets a disconnect wait for a cancelled handshake to
//! drain before tearing the pod down.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::cluster::PodApi;
use crate::config::KuberunConfig;
use crate::logging;
use crate::pod::{
    CorrelationLabels, OperationContext, PodError, PodPhase, PodProvisioner, PodReference,
    ReadinessWatcher, TeardownLoop,
};

pub mod channel;

pub use channel::{
    ChannelError, ChannelHandler, ChannelIo, ExitCallback, ExitStatus, LaunchRequest,
    ProcessLauncher, Terminal,
};

/// Errors returned across the connection-level boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// This backend does not authenticate users.
    #[error("the backend handler does not support {method} authentication")]
    Unsupported {
        /// Authentication method that was attempted.
        method: &'static str,
    },
    /// A handshake was already processed for this connection.
    #[error("handshake already processed (session is {state})")]
    AlreadyStarted {
        /// Lifecycle state at the time of the call.
        state: SessionState,
    },
    /// Provisioning or readiness failed.
    #[error(transparent)]
    Pod(#[from] PodError),
}

/// Answer to an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResponse {
    /// Credentials accepted.
    Success,
    /// Credentials rejected.
    Failure,
    /// The backend cannot judge the credentials.
    Unavailable,
}

/// Observable lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake yet.
    Idle,
    /// Pod creation or readiness wait in progress.
    Provisioning,
    /// Pod available; channels may be opened.
    Ready,
    /// Provisioning failed.
    Failed,
    /// Pod deletion in progress.
    Terminating,
    /// Session finished.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Provisioning {
        cancel: CancellationToken,
        pod: Option<PodReference>,
    },
    Ready {
        pod: PodReference,
    },
    Failed {
        pod: Option<PodReference>,
        reason: String,
    },
    Terminating,
    Terminated,
}

impl Lifecycle {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Provisioning { .. } => SessionState::Provisioning,
            Self::Ready { .. } => SessionState::Ready,
            Self::Failed { .. } => SessionState::Failed,
            Self::Terminating => SessionState::Terminating,
            Self::Terminated => SessionState::Terminated,
        }
    }

    fn pod(&self) -> Option<&PodReference> {
        match self {
            Self::Provisioning { pod, .. } | Self::Failed { pod, .. } => pod.as_ref(),
            Self::Ready { pod } => Some(pod),
            Self::Idle | Self::Terminating | Self::Terminated => None,
        }
    }

    fn take_pod(&mut self) -> Option<PodReference> {
        match self {
            Self::Provisioning { pod, .. } | Self::Failed { pod, .. } => pod.take(),
            Self::Ready { pod } => Some(pod.clone()),
            Self::Idle | Self::Terminating | Self::Terminated => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    lifecycle: Lifecycle,
    labels: Option<CorrelationLabels>,
}

/// Where channel programs run, fixed once the pod is ready.
#[derive(Debug)]
pub struct AttachTarget {
    /// The ready pod.
    pub pod: PodReference,
    /// Name of the attach container.
    pub container_name: String,
    /// Index of the attach container in the pod spec.
    pub container_index: usize,
    /// Command run for shell requests.
    pub shell_command: Vec<String>,
    /// Subsystem name to executable.
    pub subsystems: BTreeMap<String, String>,
}

/// Session-level handler returned by a successful handshake.
#[derive(Clone)]
pub struct SessionHandle {
    username: String,
    target: Arc<AttachTarget>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("username", &self.username)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Reason a session channel was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelRejection {
    /// The pod finished before the channel was opened.
    #[error("session pod has already finished (phase {0})")]
    PodFinished(PodPhase),
}

impl SessionHandle {
    /// The pod this session runs in.
    pub fn pod(&self) -> &PodReference {
        &self.target.pod
    }

    /// Index of the attach container.
    pub fn container_index(&self) -> usize {
        self.target.container_index
    }

    /// Name of the attach container.
    pub fn container_name(&self) -> &str {
        &self.target.container_name
    }

    /// Authenticated username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Accept a new session channel.
    ///
    /// # Errors
    ///
    /// [`ChannelRejection::PodFinished`] when the pod had already run to
    /// completion by the time it was observed.
    pub fn on_session_channel(&self, channel_id: u64) -> Result<ChannelHandler, ChannelRejection> {
        if self.target.pod.phase.is_terminal() {
            return Err(ChannelRejection::PodFinished(self.target.pod.phase));
        }
        debug!(channel_id, pod = %self.target.pod.name, "session channel opened");
        Ok(ChannelHandler::new(
            channel_id,
            Arc::clone(&self.target),
            Arc::clone(&self.launcher),
        ))
    }
}

/// Lifecycle owner for one network connection.
pub struct ConnectionSession {
    connection_id: Vec<u8>,
    remote_addr: SocketAddr,
    config: Arc<KuberunConfig>,
    provisioner: PodProvisioner,
    watcher: ReadinessWatcher,
    teardown: TeardownLoop,
    launcher: Arc<dyn ProcessLauncher>,
    inner: Mutex<Inner>,
    turn: Arc<Mutex<()>>,
    span: Span,
}

impl ConnectionSession {
    /// Session for a freshly accepted connection.
    pub fn new(
        config: Arc<KuberunConfig>,
        api: Arc<dyn PodApi>,
        launcher: Arc<dyn ProcessLauncher>,
        connection_id: Vec<u8>,
        remote_addr: SocketAddr,
    ) -> Self {
        let span = logging::connection_span(&hex::encode(&connection_id), remote_addr);
        Self {
            connection_id,
            remote_addr,
            provisioner: PodProvisioner::new(Arc::clone(&api), &config.pod),
            watcher: ReadinessWatcher::new(Arc::clone(&api)),
            teardown: TeardownLoop::new(api),
            launcher,
            config,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Idle,
                labels: None,
            }),
            turn: Arc::new(Mutex::new(())),
            span,
        }
    }

    /// Hex-encoded connection identifier.
    pub fn connection_id(&self) -> String {
        hex::encode(&self.connection_id)
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current lifecycle phase.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.lifecycle.state()
    }

    /// Current pod reference, if one exists.
    pub async fn pod(&self) -> Option<PodReference> {
        self.inner.lock().await.lifecycle.pod().cloned()
    }

    /// Why provisioning failed, while the session is in [`SessionState::Failed`].
    pub async fn failure_reason(&self) -> Option<String> {
        match &self.inner.lock().await.lifecycle {
            Lifecycle::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Correlation labels, once a handshake has been processed.
    pub async fn labels(&self) -> Option<CorrelationLabels> {
        self.inner.lock().await.labels.clone()
    }

    /// Password authentication is handled upstream.
    ///
    /// # Errors
    ///
    /// Always [`SessionError::Unsupported`].
    pub fn on_auth_password(
        &self,
        _username: &str,
        _password: &[u8],
    ) -> Result<AuthResponse, SessionError> {
        Err(SessionError::Unsupported { method: "password" })
    }

    /// Public key authentication is handled upstream.
    ///
    /// # Errors
    ///
    /// Always [`SessionError::Unsupported`].
    pub fn on_auth_pubkey(
        &self,
        _username: &str,
        _public_key: &[u8],
    ) -> Result<AuthResponse, SessionError> {
        Err(SessionError::Unsupported { method: "public key" })
    }

    /// Notification that the protocol handshake failed.
    pub fn on_handshake_failed(&self, reason: &dyn std::error::Error) {
        info!(
            connection_id = %self.connection_id(),
            remote = %self.remote_addr,
            error = %reason,
            "handshake failed"
        );
    }

    /// Provision the session pod and wait until it can be used.
    ///
    /// The caller must invoke [`ConnectionSession::on_disconnect`] whatever
    /// the outcome; a pod left behind by a failed readiness wait is removed
    /// there.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyStarted`] unless the session is idle, otherwise
    /// the provisioning or readiness failure.
    pub async fn on_handshake_success(&self, username: &str) -> Result<SessionHandle, SessionError> {
        self.handshake(username).instrument(self.span.clone()).await
    }

    async fn handshake(&self, username: &str) -> Result<SessionHandle, SessionError> {
        let (ctx, labels, turn) = {
            let mut inner = self.inner.lock().await;
            let state = inner.lifecycle.state();
            if state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted { state });
            }
            let turn = Arc::clone(&self.turn)
                .try_lock_owned()
                .map_err(|_| SessionError::AlreadyStarted { state })?;

            let ctx = OperationContext::new(self.config.timeout());
            let labels = CorrelationLabels::new(&self.connection_id, self.remote_addr.ip(), username);
            inner.labels = Some(labels.clone());
            inner.lifecycle = Lifecycle::Provisioning {
                cancel: ctx.token().clone(),
                pod: None,
            };
            (ctx, labels, turn)
        };

        info!(
            connection_id = labels.connection_id(),
            username,
            remote = %self.remote_addr,
            "provisioning session pod"
        );
        let outcome = self.provision(&ctx, &labels).await;

        let mut inner = self.inner.lock().await;
        let result = match outcome {
            Ok(pod) => {
                inner.lifecycle = Lifecycle::Ready { pod: pod.clone() };
                Ok(self.session_handle(username, pod))
            }
            Err(err) => {
                let pod = inner.lifecycle.take_pod();
                warn!(
                    connection_id = labels.connection_id(),
                    pod = pod.as_ref().map(|p| p.name.as_str()),
                    error = %err,
                    "session provisioning failed"
                );
                inner.lifecycle = Lifecycle::Failed {
                    pod,
                    reason: err.to_string(),
                };
                Err(err.into())
            }
        };
        drop(inner);
        drop(turn);
        result
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        labels: &CorrelationLabels,
    ) -> Result<PodReference, PodError> {
        let pod = self.provisioner.create(ctx, labels).await?;
        {
            let mut inner = self.inner.lock().await;
            if let Lifecycle::Provisioning { pod: slot, .. } = &mut inner.lifecycle {
                *slot = Some(pod.clone());
            }
        }
        self.watcher.wait_until_available(ctx, pod).await
    }

    fn session_handle(&self, username: &str, pod: PodReference) -> SessionHandle {
        let pod_config = &self.config.pod;
        let target = AttachTarget {
            pod,
            container_name: pod_config
                .attach_container_name()
                .unwrap_or_default()
                .to_owned(),
            container_index: pod_config.console_container,
            shell_command: pod_config.shell_command.clone(),
            subsystems: pod_config.subsystems.clone(),
        };
        SessionHandle {
            username: username.to_owned(),
            target: Arc::new(target),
            launcher: Arc::clone(&self.launcher),
        }
    }

    /// Tear the session down.
    ///
    /// Safe to call in any state and more than once. In-flight provisioning
    /// is cancelled and drained first. Deletion failures are logged, never
    /// returned.
    pub async fn on_disconnect(&self) {
        self.disconnect().instrument(self.span.clone()).await;
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        match inner.lifecycle.state() {
            SessionState::Idle => {
                debug!(connection_id = %self.connection_id(), "disconnect before handshake");
                inner.lifecycle = Lifecycle::Terminated;
                return;
            }
            SessionState::Terminating | SessionState::Terminated => {
                debug!(connection_id = %self.connection_id(), "session already shutting down");
                return;
            }
            SessionState::Provisioning => {
                if let Lifecycle::Provisioning { cancel, .. } = &inner.lifecycle {
                    cancel.cancel();
                }
                info!(connection_id = %self.connection_id(), "cancelling in-flight provisioning");
                drop(inner);
                let _drained = self.turn.lock().await;
                inner = self.inner.lock().await;
                if matches!(
                    inner.lifecycle,
                    Lifecycle::Terminating | Lifecycle::Terminated
                ) {
                    return;
                }
            }
            SessionState::Ready | SessionState::Failed => {}
        }

        let pod = inner.lifecycle.take_pod();
        inner.lifecycle = Lifecycle::Terminating;
        drop(inner);

        if let Some(pod) = pod {
            self.remove_pod(&pod, self.config.teardown_timeout()).await;
        }

        self.inner.lock().await.lifecycle = Lifecycle::Terminated;
        debug!(connection_id = %self.connection_id(), "session terminated");
    }

    async fn remove_pod(&self, pod: &PodReference, budget: Duration) {
        let ctx = OperationContext::new(budget);
        match self.teardown.delete(&ctx, pod).await {
            Ok(attempts) => {
                debug!(connection_id = %self.connection_id(), pod = %pod.name, attempts, "teardown complete");
            }
            Err(err) => {
                error!(
                    connection_id = %self.connection_id(),
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    error = %err,
                    "failed to remove session pod, it may leak"
                );
            }
        }
    }
}
