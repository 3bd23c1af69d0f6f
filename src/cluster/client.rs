//! [`PodApi`] backed by a `kube` client.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, watcher, Event};
use kube::Client;
use serde_json::{json, Map, Value};
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::config::ConnectionConfig;

use super::{ClusterError, PodApi, PodEvent, PodEventStream};

const CONTEXT_NAME: &str = "kuberun";

/// Pod endpoints of a real cluster.
#[derive(Clone)]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from connection settings.
    ///
    /// Without a configured host the client is inferred from the environment
    /// (`$KUBECONFIG`, `~/.kube/config` or the in-cluster service account).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Transport`] when the settings cannot be turned
    /// into a working client configuration.
    pub async fn connect(connection: &ConnectionConfig) -> Result<Self, ClusterError> {
        let mut config = match connection.host.as_deref() {
            None => {
                debug!("no cluster host configured, inferring client configuration");
                kube::Config::infer()
                    .await
                    .map_err(|e| ClusterError::Transport(e.to_string()))?
            }
            Some(host) => {
                let document = kubeconfig_document(connection, host);
                let kubeconfig: Kubeconfig = serde_json::from_value(document)
                    .map_err(|e| ClusterError::Transport(format!("invalid connection settings: {e}")))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Transport(e.to_string()))?
            }
        };
        config.connect_timeout = Some(Duration::from_secs(connection.timeout_secs));

        info!(cluster = %config.cluster_url, "connecting to cluster");
        let client = Client::try_from(config).map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Underlying client, shared with the exec launcher.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = pod.metadata.generate_name.clone().unwrap_or_default();
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| map_kube_error(e, &name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_error(e, label_selector))?;
        Ok(list.items)
    }

    async fn watch(&self, namespace: &str, name: &str) -> Result<PodEventStream, ClusterError> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(self.pods(namespace), config).filter_map(|event| match event {
            Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => Some(Ok(PodEvent::Applied(pod))),
            Ok(Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod))),
            Ok(Event::Init) | Ok(Event::InitDone) => None,
            Err(e) => Some(Err(ClusterError::Watch(e.to_string()))),
        });
        Ok(Box::pin(stream))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_error(e, name))
    }
}

fn map_kube_error(err: kube::Error, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound(name.to_owned()),
        kube::Error::Api(response) => ClusterError::Api {
            code: response.code,
            message: response.message,
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

/// Render connection settings as a single-context kubeconfig document.
///
/// Inline PEM material is base64-encoded the way kubeconfig `*-data` fields
/// expect it.
fn kubeconfig_document(connection: &ConnectionConfig, host: &str) -> Value {
    let server = if host.contains("://") {
        host.to_owned()
    } else {
        format!("https://{host}")
    };

    let mut cluster = Map::new();
    cluster.insert("server".to_owned(), Value::String(server));
    if connection.insecure {
        cluster.insert("insecure-skip-tls-verify".to_owned(), Value::Bool(true));
    }
    insert_opt(&mut cluster, "tls-server-name", connection.server_name.clone());
    insert_opt(&mut cluster, "certificate-authority", connection.cacert_file.clone());
    insert_opt(
        &mut cluster,
        "certificate-authority-data",
        connection.cacert.as_deref().map(|pem| BASE64.encode(pem)),
    );

    let mut user = Map::new();
    insert_opt(&mut user, "username", connection.username.clone());
    insert_opt(&mut user, "password", connection.password.clone());
    insert_opt(&mut user, "token", connection.bearer_token.clone());
    insert_opt(&mut user, "tokenFile", connection.bearer_token_file.clone());
    insert_opt(&mut user, "client-certificate", connection.cert_file.clone());
    insert_opt(&mut user, "client-key", connection.key_file.clone());
    insert_opt(
        &mut user,
        "client-certificate-data",
        connection.cert.as_deref().map(|pem| BASE64.encode(pem)),
    );
    insert_opt(
        &mut user,
        "client-key-data",
        connection.key.as_deref().map(|pem| BASE64.encode(pem)),
    );

    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": CONTEXT_NAME,
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster }],
        "users": [{ "name": CONTEXT_NAME, "user": user }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME }
        }],
    })
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_owned(), Value::String(value));
    }
}
