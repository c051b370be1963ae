//! Kubernetes client wrapper.
//!
//! [`ClusterClient`] resolves the project's cluster credentials once and
//! exposes the pod operations the `up` workflow needs. The [`Cluster`] and
//! [`PortTunnel`] traits are the seams the release coordinator and the
//! port-forward bootstrap are written against.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ClusterConfig, PortMapping};
use crate::error::{Error, Result};
use crate::kubectl::status::{is_primary_container_ready, pod_status, STATUS_RUNNING};

/// Name of the context in the generated kubeconfig.
const CONTEXT_NAME: &str = "devspace";

/// Pod operations used by the orchestration engine.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// List all pods matching a label selector. An empty list is not an error.
    async fn list_pods(&self, label_selector: &str, namespace: &str) -> Result<Vec<Pod>>;

    /// Fetch a single pod.
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod>;

    /// Make sure a namespace exists, creating it if needed.
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// First pod matching the selector whose derived status is `Running`.
    async fn first_running_pod(&self, label_selector: &str, namespace: &str) -> Result<Option<Pod>> {
        let pods = self.list_pods(label_selector, namespace).await?;
        Ok(pods.into_iter().find(|pod| pod_status(pod) == STATUS_RUNNING))
    }

    /// Poll a pod until its first container reports ready.
    ///
    /// The pod is re-fetched on every poll and fetch errors are returned
    /// immediately. The pod is polled `max_wait / interval` times (rounded
    /// down, at least once) with `interval` of sleep after each unsuccessful
    /// poll.
    async fn wait_for_ready(
        &self,
        pod: &Pod,
        max_wait: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Pod> {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let polls = if interval.is_zero() {
            1
        } else {
            u64::try_from(max_wait.as_nanos() / interval.as_nanos())
                .unwrap_or(u64::MAX)
                .max(1)
        };

        for attempt in 1..=polls {
            let current = self.get_pod(&name, &namespace).await?;
            if is_primary_container_ready(&current) {
                info!(pod = %name, namespace = %namespace, "Pod is ready");
                return Ok(current);
            }

            debug!(
                pod = %name,
                status = %pod_status(&current),
                attempt,
                polls,
                "Pod not ready yet"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }

        Err(Error::Timeout {
            what: format!("pod {name} to become ready"),
            secs: max_wait.as_secs(),
        })
    }
}

/// Opens port tunnels to pods.
#[async_trait]
pub trait PortTunnel: Send + Sync {
    /// Forward local ports to a pod.
    ///
    /// `ready` is signalled once every local port is listening. Runs until
    /// `stop` is cancelled or the tunnel fails.
    async fn forward_ports(
        &self,
        pod: &Pod,
        ports: &[PortMapping],
        stop: CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()>;
}

/// Thin, cloneable wrapper around a Kubernetes client.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Connect using the cluster credentials stored in the project config.
    ///
    /// # Errors
    /// Returns a configuration error if no cluster credentials are present,
    /// or a kubeconfig/client error if they cannot be used.
    pub async fn connect(cluster: Option<&ClusterConfig>) -> Result<Self> {
        let cluster = cluster.ok_or_else(|| {
            Error::config("Couldn't load cluster config, did you run devspace init?")
        })?;

        let kubeconfig = Kubeconfig::from_yaml(&render_kubeconfig(cluster)?)?;
        let options = KubeConfigOptions {
            context: Some(CONTEXT_NAME.to_string()),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        let client = Client::try_from(config)?;

        info!(api_server = %cluster.api_server, user = %cluster.user.username, "Connected to cluster");
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// The underlying Kubernetes client.
    #[must_use]
    pub fn kube_client(&self) -> &Client {
        &self.client
    }

    /// Namespaced pod API.
    #[must_use]
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Cluster for ClusterClient {
    async fn list_pods(&self, label_selector: &str, namespace: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        let pods = self.pods(namespace).list(&lp).await?;
        debug!(
            selector = %label_selector,
            namespace = %namespace,
            count = pods.items.len(),
            "Listed pods"
        );
        Ok(pods.items)
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.get(name).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = %name, "Namespace created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Render a single-context kubeconfig for the stored credentials.
pub(crate) fn render_kubeconfig(cluster: &ClusterConfig) -> Result<String> {
    let encode = |pem: &str| base64::engine::general_purpose::STANDARD.encode(pem.as_bytes());

    let mut cluster_entry = serde_json::json!({ "server": cluster.api_server });
    if let Some(ca) = cluster.ca_cert.as_deref() {
        cluster_entry["certificate-authority-data"] = encode(ca).into();
    }

    let mut user_entry = serde_json::json!({ "username": cluster.user.username });
    if let Some(cert) = cluster.user.client_cert.as_deref() {
        user_entry["client-certificate-data"] = encode(cert).into();
    }
    if let Some(key) = cluster.user.client_key.as_deref() {
        user_entry["client-key-data"] = encode(key).into();
    }

    let kubeconfig = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": CONTEXT_NAME,
        "clusters": [{ "name": CONTEXT_NAME, "cluster": cluster_entry }],
        "users": [{ "name": CONTEXT_NAME, "user": user_entry }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CONTEXT_NAME, "user": CONTEXT_NAME }
        }],
    });

    Ok(serde_yaml::to_string(&kubeconfig)?)
}
