//! Port tunnels from local ports to pod ports.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::ResourceExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortMapping;
use crate::error::{Error, Result};
use crate::kubectl::client::{ClusterClient, PortTunnel};

/// Address local listeners bind to.
const LOCAL_ADDRESS: &str = "127.0.0.1";

#[async_trait]
impl PortTunnel for ClusterClient {
    async fn forward_ports(
        &self,
        pod: &Pod,
        ports: &[PortMapping],
        stop: CancellationToken,
        ready: oneshot::Sender<()>,
    ) -> Result<()> {
        let name = pod.name_any();
        let pods = self.pods(&pod.namespace().unwrap_or_default());

        let mut listeners = Vec::with_capacity(ports.len());
        for mapping in ports {
            let listener = TcpListener::bind((LOCAL_ADDRESS, mapping.local_port)).await?;
            listeners.push((listener, mapping.remote_port));
        }

        if ready.send(()).is_err() {
            debug!(pod = %name, "Nobody is waiting for the tunnel to become ready");
        }
        info!(pod = %name, ?ports, "Port forwarding ready");

        let mut accept_loops = JoinSet::new();
        for (listener, remote_port) in listeners {
            accept_loops.spawn(accept_loop(
                pods.clone(),
                name.clone(),
                listener,
                remote_port,
                stop.clone(),
            ));
        }

        while let Some(joined) = accept_loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    accept_loops.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    accept_loops.abort_all();
                    return Err(Error::Stream(format!("port forward task failed: {e}")));
                }
            }
        }

        debug!(pod = %name, "Port forwarding stopped");
        Ok(())
    }
}

/// Accept local connections and forward each one through its own
/// portforward stream until `stop` fires.
async fn accept_loop(
    pods: Api<Pod>,
    pod_name: String,
    listener: TcpListener,
    remote_port: u16,
    stop: CancellationToken,
) -> Result<()> {
    loop {
        let (connection, peer) = tokio::select! {
            () = stop.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        debug!(pod = %pod_name, %peer, remote_port, "Accepted connection");
        let pods = pods.clone();
        let pod_name = pod_name.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop.cancelled() => {}
                result = forward_connection(&pods, &pod_name, connection, remote_port) => {
                    if let Err(e) = result {
                        warn!(pod = %pod_name, remote_port, error = %e, "Port forward connection failed");
                    }
                }
            }
        });
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod_name: &str,
    mut connection: TcpStream,
    remote_port: u16,
) -> Result<()> {
    let mut forwarder = pods.portforward(pod_name, &[remote_port]).await?;
    let mut upstream = forwarder
        .take_stream(remote_port)
        .ok_or_else(|| Error::Stream(format!("no stream for port {remote_port}")))?;

    tokio::io::copy_bidirectional(&mut connection, &mut upstream).await?;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| Error::Stream(e.to_string()))
}
