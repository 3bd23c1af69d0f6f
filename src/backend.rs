//! Backend factory: one shared cluster client, one session per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cluster::{KubeExecLauncher, KubePodApi, PodApi};
use crate::config::KuberunConfig;
use crate::session::{ConnectionSession, ProcessLauncher};

/// Creates [`ConnectionSession`]s that share configuration and cluster access.
#[derive(Clone)]
pub struct Backend {
    config: Arc<KuberunConfig>,
    api: Arc<dyn PodApi>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Backend {
    /// Backend talking to the cluster described by `config.connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no client can be built.
    pub async fn connect(config: KuberunConfig) -> Result<Self> {
        config.validate()?;
        let api = KubePodApi::connect(&config.connection)
            .await
            .context("failed to create cluster client")?;
        let launcher = KubeExecLauncher::new(api.client());
        Self::new(config, Arc::new(api), Arc::new(launcher))
    }

    /// Backend over explicit control-plane and execution implementations.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: KuberunConfig,
        api: Arc<dyn PodApi>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            api,
            launcher,
        })
    }

    /// Session for a newly accepted network connection.
    pub fn on_network_connection(
        &self,
        connection_id: Vec<u8>,
        remote_addr: SocketAddr,
    ) -> ConnectionSession {
        debug!(connection_id = %hex::encode(&connection_id), remote = %remote_addr, "connection accepted");
        ConnectionSession::new(
            Arc::clone(&self.config),
            Arc::clone(&self.api),
            Arc::clone(&self.launcher),
            connection_id,
            remote_addr,
        )
    }

    /// Effective configuration.
    pub fn config(&self) -> &KuberunConfig {
        &self.config
    }

    /// Shared control-plane access.
    pub fn api(&self) -> Arc<dyn PodApi> {
        Arc::clone(&self.api)
    }
}
