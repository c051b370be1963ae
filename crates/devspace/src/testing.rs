//! In-memory fakes for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::PortMapping;
use crate::error::{Error, Result};
use crate::kubectl::{Cluster, PortTunnel};

/// Build a running pod with one ready container and an optional revision
/// annotation.
pub fn running_pod(name: &str, namespace: &str, revision: Option<&str>) -> Pod {
    let annotations = revision.map(|rev| {
        let mut map = BTreeMap::new();
        map.insert("revision".to_string(), rev.to_string());
        map
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                ready: true,
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Same as [`running_pod`] but with the container not ready yet.
pub fn pending_pod(name: &str, namespace: &str, revision: Option<&str>) -> Pod {
    let mut pod = running_pod(name, namespace, revision);
    let status = pod.status.as_mut().expect("status");
    status.phase = Some("Pending".to_string());
    status.container_statuses = Some(vec![ContainerStatus {
        name: "main".to_string(),
        ready: false,
        ..Default::default()
    }]);
    pod
}

/// How the fake tunnel behaves once started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelBehavior {
    /// Signal ready right away, then run until stopped.
    Ready,
    /// Never signal ready, run until stopped.
    Hang,
    /// Fail before signalling ready.
    Fail,
}

/// Fake cluster that serves scripted pod lists.
pub struct FakeCluster {
    /// Successive `list_pods` responses; the last one repeats.
    lists: Mutex<VecDeque<Vec<Pod>>>,
    /// `get_pod` reports ready starting with this call (1-based).
    ready_on_get: Option<usize>,
    /// `get_pod` fails with a 404.
    fail_get: bool,
    pub tunnel: TunnelBehavior,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub tunnel_calls: AtomicUsize,
    pub namespaces: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new(lists: Vec<Vec<Pod>>) -> Self {
        Self {
            lists: Mutex::new(lists.into()),
            ready_on_get: Some(1),
            fail_get: false,
            tunnel: TunnelBehavior::Ready,
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            tunnel_calls: AtomicUsize::new(0),
            namespaces: Mutex::new(Vec::new()),
        }
    }

    pub fn ready_on_get(mut self, call: Option<usize>) -> Self {
        self.ready_on_get = call;
        self
    }

    pub fn failing_get(mut self) -> Self {
        self.fail_get = true;
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelBehavior) -> Self {
        self.tunnel = tunnel;
        self
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn list_pods(&self, _label_selector: &str, _namespace: &str) -> Result<Vec<Pod>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut lists = self.lists.lock().expect("lists lock");
        let pods = if lists.len() > 1 {
            lists.pop_front().unwrap_or_default()
        } else {
            lists.front().cloned().unwrap_or_default()
        };
        Ok(pods)
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        let call = self.get_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_get {
            return Err(Error::Cluster(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("pods \"{name}\" not found"),
                    reason: "NotFound".to_string(),
                    code: 404,
                },
            )));
        }

        if self.ready_on_get.is_some_and(|n| call >= n) {
            Ok(running_pod(name, namespace, None))
        } else {
            Ok(pending_pod(name, namespace, None))
        }
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.namespaces
            .lock()
            .expect("namespaces lock")
            .push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl PortTunnel for FakeCluster {
    async fn forward_ports(
        &self,
        _pod: &Pod,
        _ports: &[PortMapping],
        stop: CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        self.tunnel_calls.fetch_add(1, Ordering::SeqCst);
        match self.tunnel {
            TunnelBehavior::Ready => {
                let _ = ready.send(());
                stop.cancelled().await;
                Ok(())
            }
            TunnelBehavior::Hang => {
                stop.cancelled().await;
                drop(ready);
                Ok(())
            }
            TunnelBehavior::Fail => Err(Error::Stream("address already in use".to_string())),
        }
    }
}
