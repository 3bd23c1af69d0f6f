//! [`ProcessLauncher`] on top of the pod `exec` subresource.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, TerminalSize};
use kube::Client;
use tracing::{debug, warn};

use crate::session::{
    ChannelError, ChannelIo, ExitCallback, ExitStatus, LaunchRequest, ProcessLauncher, Terminal,
};

/// Runs channel programs with `kubectl exec` semantics.
#[derive(Clone)]
pub struct KubeExecLauncher {
    client: Client,
}

impl KubeExecLauncher {
    /// Launcher using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProcessLauncher for KubeExecLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
        io: ChannelIo,
        on_exit: ExitCallback,
    ) -> Result<(), ChannelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let tty = request.tty.is_some();
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);

        let mut attached = pods
            .exec(&request.pod, request.command_with_env(), &params)
            .await
            .map_err(|e| ChannelError::Launch(e.to_string()))?;

        if let Some(terminal) = request.tty.as_ref() {
            match attached.terminal_size() {
                Some(mut resize) => {
                    if let Err(e) = resize.try_send(terminal_size(terminal)) {
                        warn!(pod = %request.pod, error = %e, "failed to set terminal size");
                    }
                }
                None => debug!(pod = %request.pod, "exec session has no resize channel"),
            }
        }

        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let status = attached.take_status();
        let ChannelIo {
            mut stdin,
            mut stdout,
            mut stderr,
        } = io;

        if let Some(mut writer) = remote_stdin {
            tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut writer).await {
                    debug!(error = %e, "stdin pump stopped");
                }
            });
        }

        let pod = request.pod;
        tokio::spawn(async move {
            let stdout_pump = async {
                if let Some(mut reader) = remote_stdout {
                    if let Err(e) = tokio::io::copy(&mut reader, &mut stdout).await {
                        debug!(error = %e, "stdout pump stopped");
                    }
                }
            };
            let stderr_pump = async {
                if let Some(mut reader) = remote_stderr {
                    if let Err(e) = tokio::io::copy(&mut reader, &mut stderr).await {
                        debug!(error = %e, "stderr pump stopped");
                    }
                }
            };
            tokio::join!(stdout_pump, stderr_pump);

            let exit = match status {
                Some(status) => exit_status(status.await.as_ref()),
                None => ExitStatus::FAILURE,
            };
            if let Err(e) = attached.join().await {
                warn!(pod = %pod, error = %e, "exec session ended with an error");
            }
            debug!(pod = %pod, exit_code = exit.code(), "program exited");
            on_exit(exit);
        });

        Ok(())
    }
}

/// Window size in the form the exec resize channel expects.
fn terminal_size(terminal: &Terminal) -> TerminalSize {
    TerminalSize {
        width: u16::try_from(terminal.columns).unwrap_or(u16::MAX),
        height: u16::try_from(terminal.rows).unwrap_or(u16::MAX),
    }
}

/// Exit status encoded in an exec `Status` object.
fn exit_status(status: Option<&Status>) -> ExitStatus {
    let Some(status) = status else {
        return ExitStatus::FAILURE;
    };
    if status.status.as_deref() == Some("Success") {
        return ExitStatus::SUCCESS;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse::<u32>().ok())
        })
        .map_or(ExitStatus::FAILURE, ExitStatus)
}
