//! Configuration loading and validation.
//!
//! Loads kuberun configuration from `./kuberun.toml` (or `$KUBERUN_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────

/// Top-level kuberun configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KuberunConfig {
    /// Seconds allowed for pod creation plus readiness.
    pub timeout_secs: u64,
    /// Seconds allowed for pod deletion on disconnect.
    pub teardown_timeout_secs: u64,
    /// Cluster connection settings.
    pub connection: ConnectionConfig,
    /// Pod template and session settings.
    pub pod: PodConfig,
}

impl Default for KuberunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            teardown_timeout_secs: 60,
            connection: ConnectionConfig::default(),
            pod: PodConfig::default(),
        }
    }
}

impl KuberunConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// An explicit path takes priority over `$KUBERUN_CONFIG_PATH`. A missing
    /// file yields the defaults. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result is invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// Same as [`KuberunConfig::load`].
    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = Self::config_path_with(explicit, &env);
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(&env);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    fn config_path_with(explicit: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Some(p) = env("KUBERUN_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("kuberun.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("KUBERUN_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "KUBERUN_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("KUBERUN_TEARDOWN_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.teardown_timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "KUBERUN_TEARDOWN_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("KUBERUN_NAMESPACE") {
            self.pod.namespace = v;
        }
        if let Some(v) = env("KUBERUN_HOST") {
            self.connection.host = Some(v);
        }
        if let Some(v) = env("KUBERUN_BEARER_TOKEN_FILE") {
            self.connection.bearer_token_file = Some(v);
        }
    }

    /// Parse a TOML string into config (no env overrides, no validation).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has the wrong shape.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: KuberunConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject settings the session lifecycle cannot work with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than zero");
        }
        if self.teardown_timeout_secs == 0 {
            bail!("teardown_timeout_secs must be greater than zero");
        }
        if self.pod.namespace.trim().is_empty() {
            bail!("pod.namespace must not be empty");
        }
        if self.pod.shell_command.is_empty() {
            bail!("pod.shell_command must not be empty");
        }
        if self.pod.idle_command.is_empty() {
            bail!("pod.idle_command must not be empty");
        }
        if self.pod.attach_container_name().is_none() {
            bail!(
                "pod.console_container {} does not name a container in pod.spec ({} defined)",
                self.pod.console_container,
                self.pod.spec.containers.len()
            );
        }
        Ok(())
    }

    /// Provisioning plus readiness budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Teardown budget.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

// ── Connection config ───────────────────────────────────────────

/// Cluster connection settings.
///
/// Leaving `host` unset infers the connection from `$KUBECONFIG`,
/// `~/.kube/config` or the in-cluster service account.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// API server host, `host:port` or URL.
    pub host: Option<String>,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Bearer token.
    #[serde(skip_serializing)]
    pub bearer_token: Option<String>,
    /// File containing a bearer token.
    pub bearer_token_file: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// TLS server name used for SNI and verification.
    pub server_name: Option<String>,
    /// Client certificate file.
    pub cert_file: Option<String>,
    /// Client key file.
    pub key_file: Option<String>,
    /// CA certificate file.
    pub cacert_file: Option<String>,
    /// PEM-encoded client certificate.
    pub cert: Option<String>,
    /// PEM-encoded client key.
    #[serde(skip_serializing)]
    pub key: Option<String>,
    /// PEM-encoded CA certificates.
    pub cacert: Option<String>,
    /// Connect timeout for API requests, in seconds.
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            username: None,
            password: None,
            bearer_token: None,
            bearer_token_file: None,
            insecure: false,
            server_name: None,
            cert_file: None,
            key_file: None,
            cacert_file: None,
            cert: None,
            key: None,
            cacert: None,
            timeout_secs: 60,
        }
    }
}

// ── Pod config ──────────────────────────────────────────────────

/// Pod template and per-session execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PodConfig {
    /// Namespace pods are created in.
    pub namespace: String,
    /// Index of the container sessions attach to.
    pub console_container: usize,
    /// Command run for shell requests.
    pub shell_command: Vec<String>,
    /// Command the attach container runs while idle.
    pub idle_command: Vec<String>,
    /// Subsystem name to executable.
    pub subsystems: BTreeMap<String, String>,
    /// Pod specification template.
    pub spec: PodSpec,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            console_container: 0,
            shell_command: vec!["/bin/bash".to_owned()],
            idle_command: vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                "sleep infinity & PID=$!; trap \"kill $PID\" INT TERM; wait".to_owned(),
            ],
            subsystems: BTreeMap::from([(
                "sftp".to_owned(),
                "/usr/lib/openssh/sftp-server".to_owned(),
            )]),
            spec: PodSpec {
                containers: vec![Container {
                    name: "shell".to_owned(),
                    image: Some("containerssh/containerssh-guest-image".to_owned()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            },
        }
    }
}

impl PodConfig {
    /// Name of the container sessions attach to, if the index is valid.
    pub fn attach_container_name(&self) -> Option<&str> {
        self.spec
            .containers
            .get(self.console_container)
            .map(|c| c.name.as_str())
    }
}
