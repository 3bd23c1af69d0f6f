//! kuberun CLI entry point.
//!
//! Provides `probe`, `pods` and `config` subcommands for exercising a
//! session against the configured cluster, inspecting the pods correlated
//! with a connection, and printing the effective configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use kuberun::backend::Backend;
use kuberun::config::KuberunConfig;
use kuberun::logging;
use kuberun::pod::{self, PodPhase, LABEL_USERNAME};

/// kuberun: per-connection Kubernetes pod backend.
#[derive(Parser)]
#[command(name = "kuberun", version, about)]
struct Cli {
    /// Configuration file (defaults to `$KUBERUN_CONFIG_PATH` or `./kuberun.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write JSON logs to this directory in addition to stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a full handshake/disconnect cycle for a synthetic connection.
    Probe {
        /// Username recorded on the pod.
        #[arg(long)]
        username: String,
        /// Client address recorded on the pod.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
        client_ip: IpAddr,
        /// Keep the pod for this many seconds before disconnecting.
        #[arg(long, default_value_t = 0)]
        hold_secs: u64,
    },
    /// List the pods correlated with a connection.
    Pods {
        /// Hex-encoded connection identifier.
        #[arg(long)]
        connection_id: String,
    },
    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _logging_guard = match &cli.log_dir {
        Some(dir) => Some(logging::init_production(dir)?),
        None => {
            logging::init_cli()?;
            None
        }
    };

    let config = KuberunConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Probe {
            username,
            client_ip,
            hold_secs,
        } => handle_probe(config, &username, client_ip, hold_secs).await,
        Command::Pods { connection_id } => handle_pods(config, &connection_id).await,
        Command::Config => handle_config(&config),
    }
}

/// Provision a pod the way a real connection would, then tear it down.
async fn handle_probe(
    config: KuberunConfig,
    username: &str,
    client_ip: IpAddr,
    hold_secs: u64,
) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let connection_id = uuid::Uuid::new_v4().as_bytes().to_vec();
    let session = backend.on_network_connection(connection_id, SocketAddr::new(client_ip, 0));
    info!(connection_id = %session.connection_id(), "probe connection created");

    let outcome = session.on_handshake_success(username).await;
    if let Ok(handle) = &outcome {
        println!("{}", serde_json::to_string_pretty(handle.pod())?);
        if hold_secs > 0 {
            info!(seconds = hold_secs, "holding session pod");
            tokio::time::sleep(Duration::from_secs(hold_secs)).await;
        }
    }

    session.on_disconnect().await;
    outcome.context("handshake failed")?;
    Ok(())
}

/// Print the pods labelled with a connection identifier.
async fn handle_pods(config: KuberunConfig, connection_id: &str) -> anyhow::Result<()> {
    let raw_id = hex::decode(connection_id).context("connection id must be hex-encoded")?;
    let namespace = config.pod.namespace.clone();
    let backend = Backend::connect(config).await?;

    let pods = pod::find_session_pods(backend.api().as_ref(), &namespace, &raw_id).await?;
    if pods.is_empty() {
        println!("no pods for connection {connection_id} in namespace {namespace}");
        return Ok(());
    }
    for found in &pods {
        let name = found.metadata.name.as_deref().unwrap_or("<unnamed>");
        let username = found
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_USERNAME))
            .map_or("-", String::as_str);
        let ready = if pod::is_ready(found) { "ready" } else { "not-ready" };
        println!("{name}\t{}\t{ready}\t{username}", PodPhase::of(found));
    }
    Ok(())
}

/// Print the effective configuration.
fn handle_config(config: &KuberunConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
