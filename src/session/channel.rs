//! Per-channel request handling and the process-execution boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::AttachTarget;

/// Errors returned by channel requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// A program has already been started on this channel.
    #[error("program already running")]
    ProgramAlreadyRunning,
    /// Signal delivery is not supported.
    #[error("signals are not supported")]
    SignalsUnsupported,
    /// The requested subsystem is not configured.
    #[error("unknown subsystem: {0}")]
    UnknownSubsystem(String),
    /// The execution backend failed to start the program.
    #[error("failed to launch program: {0}")]
    Launch(String),
}

/// Exit status reported when a program finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub u32);

impl ExitStatus {
    /// Successful exit.
    pub const SUCCESS: Self = Self(0);
    /// Generic failure, used when the backend reports no code.
    pub const FAILURE: Self = Self(1);

    /// Numeric exit code.
    pub fn code(self) -> u32 {
        self.0
    }
}

/// Callback invoked exactly once when the program exits.
pub type ExitCallback = Box<dyn FnOnce(ExitStatus) + Send>;

/// Byte streams of a session channel.
pub struct ChannelIo {
    /// Data sent by the client.
    pub stdin: Box<dyn AsyncRead + Send + Unpin>,
    /// Data returned to the client.
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    /// Extended (stderr) data returned to the client.
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIo").finish_non_exhaustive()
    }
}

/// Terminal requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    /// `TERM` value.
    pub term: String,
    /// Width in characters.
    pub columns: u32,
    /// Height in rows.
    pub rows: u32,
}

/// Everything the execution backend needs to start a program in the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Pod name.
    pub pod: String,
    /// Pod namespace.
    pub namespace: String,
    /// Name of the container to attach to.
    pub container: String,
    /// Index of that container in the pod spec.
    pub container_index: usize,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Environment requested by the client.
    pub env: BTreeMap<String, String>,
    /// Terminal, when a pty was requested.
    pub tty: Option<Terminal>,
}

impl LaunchRequest {
    /// Command line with the client environment applied through `env`.
    pub fn command_with_env(&self) -> Vec<String> {
        if self.env.is_empty() {
            return self.command.clone();
        }
        std::iter::once("env".to_owned())
            .chain(self.env.iter().map(|(name, value)| format!("{name}={value}")))
            .chain(self.command.iter().cloned())
            .collect()
    }
}

/// Starts programs inside a session pod.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the program and return once it is running.
    ///
    /// `on_exit` must be called exactly once when the program finishes.
    async fn launch(
        &self,
        request: LaunchRequest,
        io: ChannelIo,
        on_exit: ExitCallback,
    ) -> Result<(), ChannelError>;
}

#[derive(Debug, Default)]
struct ChannelState {
    env: BTreeMap<String, String>,
    terminal: Option<Terminal>,
    running: bool,
}

/// Handler for one session channel.
pub struct ChannelHandler {
    channel_id: u64,
    target: Arc<AttachTarget>,
    launcher: Arc<dyn ProcessLauncher>,
    state: Mutex<ChannelState>,
}

impl ChannelHandler {
    pub(super) fn new(
        channel_id: u64,
        target: Arc<AttachTarget>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            channel_id,
            target,
            launcher,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Channel identifier assigned by the protocol engine.
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Whether a program has been started.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Record an environment variable for the program.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProgramAlreadyRunning`] once a program was started.
    pub async fn on_env_request(&self, name: &str, value: &str) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        state.env.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    /// Request a pseudo-terminal.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProgramAlreadyRunning`] once a program was started.
    pub async fn on_pty_request(&self, term: &str, columns: u32, rows: u32) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        state.env.insert("TERM".to_owned(), term.to_owned());
        state.terminal = Some(Terminal {
            term: term.to_owned(),
            columns,
            rows,
        });
        Ok(())
    }

    /// Update the terminal size before the program starts.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProgramAlreadyRunning`] once a program was started.
    pub async fn on_window(&self, columns: u32, rows: u32) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(ChannelError::ProgramAlreadyRunning);
        }
        if let Some(terminal) = state.terminal.as_mut() {
            terminal.columns = columns;
            terminal.rows = rows;
        }
        Ok(())
    }

    /// Signals are never delivered.
    ///
    /// # Errors
    ///
    /// Always [`ChannelError::SignalsUnsupported`].
    pub async fn on_signal(&self, signal: &str) -> Result<(), ChannelError> {
        debug!(channel_id = self.channel_id, signal, "rejecting signal");
        Err(ChannelError::SignalsUnsupported)
    }

    /// Run `program` through `/bin/sh -c`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProgramAlreadyRunning`] or a launch failure.
    pub async fn on_exec_request(
        &self,
        program: &str,
        io: ChannelIo,
        on_exit: ExitCallback,
    ) -> Result<(), ChannelError> {
        let command = vec!["/bin/sh".to_owned(), "-c".to_owned(), program.to_owned()];
        self.start(command, io, on_exit).await
    }

    /// Run the configured shell.
    ///
    /// # Errors
    ///
    /// [`ChannelError::ProgramAlreadyRunning`] or a launch failure.
    pub async fn on_shell(&self, io: ChannelIo, on_exit: ExitCallback) -> Result<(), ChannelError> {
        let command = self.target.shell_command.clone();
        self.start(command, io, on_exit).await
    }

    /// Run the executable registered for `subsystem`.
    ///
    /// # Errors
    ///
    /// [`ChannelError::UnknownSubsystem`], [`ChannelError::ProgramAlreadyRunning`]
    /// or a launch failure.
    pub async fn on_subsystem(
        &self,
        subsystem: &str,
        io: ChannelIo,
        on_exit: ExitCallback,
    ) -> Result<(), ChannelError> {
        let executable = self
            .target
            .subsystems
            .get(subsystem)
            .ok_or_else(|| ChannelError::UnknownSubsystem(subsystem.to_owned()))?;
        self.start(vec![executable.clone()], io, on_exit).await
    }

    async fn start(
        &self,
        command: Vec<String>,
        io: ChannelIo,
        on_exit: ExitCallback,
    ) -> Result<(), ChannelError> {
        let request = {
            let mut state = self.state.lock().await;
            if state.running {
                return Err(ChannelError::ProgramAlreadyRunning);
            }
            state.running = true;
            LaunchRequest {
                pod: self.target.pod.name.clone(),
                namespace: self.target.pod.namespace.clone(),
                container: self.target.container_name.clone(),
                container_index: self.target.container_index,
                command,
                env: state.env.clone(),
                tty: state.terminal.clone(),
            }
        };

        info!(
            channel_id = self.channel_id,
            pod = %request.pod,
            container = %request.container,
            tty = request.tty.is_some(),
            "starting program"
        );
        let launched = self.launcher.launch(request, io, on_exit).await;
        if launched.is_err() {
            self.state.lock().await.running = false;
        }
        launched
    }
}
