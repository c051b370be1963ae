//! Port forwarding bootstrap.
//!
//! Every configured mapping is started concurrently. A mapping whose tunnel
//! does not become ready in time is reported, never fatal.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::ResourceExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{label_selector, namespace_or, PortForwardingConfig};
use crate::kubectl::{Cluster, PortTunnel};

/// Resource type that can be forwarded to.
const POD_RESOURCE: &str = "pod";

/// Result of bootstrapping one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardStatus {
    /// All local ports are listening.
    Started,
    /// The tunnel did not report ready in time. It keeps running.
    TimedOut,
    /// No running pod matched the selector.
    NoPod,
    /// Only pods can be forwarded to.
    Unsupported(String),
    /// The pod lookup or the tunnel failed.
    Failed(String),
}

/// Outcome of one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// Ports as `local:remote, ...`.
    pub ports: String,
    pub status: ForwardStatus,
}

/// Start every mapping and wait for each to be ready or to time out.
///
/// Tunnels run in background tasks until `stop` is cancelled. Outcomes are
/// returned in configuration order.
pub async fn start_port_forwarding<C>(
    client: Arc<C>,
    mappings: &[PortForwardingConfig],
    default_namespace: &str,
    ready_timeout: Duration,
    stop: &CancellationToken,
) -> Vec<ForwardOutcome>
where
    C: Cluster + PortTunnel + 'static,
{
    join_all(mappings.iter().map(|mapping| {
        bootstrap(
            Arc::clone(&client),
            mapping,
            default_namespace,
            ready_timeout,
            stop.child_token(),
        )
    }))
    .await
}

async fn bootstrap<C>(
    client: Arc<C>,
    mapping: &PortForwardingConfig,
    default_namespace: &str,
    ready_timeout: Duration,
    stop: CancellationToken,
) -> ForwardOutcome
where
    C: Cluster + PortTunnel + 'static,
{
    let ports = mapping
        .port_mappings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let outcome = |status: ForwardStatus| ForwardOutcome {
        ports: ports.clone(),
        status,
    };

    if mapping.resource_type != POD_RESOURCE {
        warn!(
            resource_type = %mapping.resource_type,
            "Currently only pod resource type is supported for portforwarding"
        );
        return outcome(ForwardStatus::Unsupported(mapping.resource_type.clone()));
    }

    let namespace = namespace_or(mapping.namespace.as_ref(), default_namespace);
    let selector = label_selector(&mapping.label_selector);
    if selector.is_empty() {
        debug!(%ports, "Port mapping without label selector, skipping");
        return outcome(ForwardStatus::NoPod);
    }

    let pod = match client.first_running_pod(&selector, namespace).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            warn!(%selector, namespace, "No running pod for port forwarding");
            return outcome(ForwardStatus::NoPod);
        }
        Err(e) => {
            warn!(%selector, namespace, error = %e, "Unable to list pods for port forwarding");
            return outcome(ForwardStatus::Failed(e.to_string()));
        }
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let pod_name = pod.name_any();
    let port_mappings = mapping.port_mappings.clone();
    let tunnel = tokio::spawn(async move {
        client
            .forward_ports(&pod, &port_mappings, stop, ready_tx)
            .await
    });

    tokio::select! {
        ready = ready_rx => match ready {
            Ok(()) => {
                info!(pod = %pod_name, %ports, "Port forwarding started");
                outcome(ForwardStatus::Started)
            }
            Err(_) => {
                let reason = match tunnel.await {
                    Ok(Err(e)) => e.to_string(),
                    Ok(Ok(())) => "tunnel closed before becoming ready".to_string(),
                    Err(e) => e.to_string(),
                };
                warn!(pod = %pod_name, %ports, %reason, "Port forwarding failed");
                outcome(ForwardStatus::Failed(reason))
            }
        },
        () = tokio::time::sleep(ready_timeout) => {
            warn!(pod = %pod_name, %ports, "Timeout waiting for port forwarding to start");
            outcome(ForwardStatus::TimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortMapping;
    use crate::testing::{running_pod, FakeCluster, TunnelBehavior};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use tokio::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn mapping(resource_type: &str, local: u16) -> PortForwardingConfig {
        PortForwardingConfig {
            resource_type: resource_type.to_string(),
            label_selector: BTreeMap::from([("release".to_string(), "my-app".to_string())]),
            namespace: None,
            port_mappings: vec![PortMapping {
                local_port: local,
                remote_port: 80,
            }],
        }
    }

    fn cluster(tunnel: TunnelBehavior) -> Arc<FakeCluster> {
        Arc::new(
            FakeCluster::new(vec![vec![running_pod("web", "dev", None)]]).with_tunnel(tunnel),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_tunnel_is_started() {
        let client = cluster(TunnelBehavior::Ready);
        let stop = CancellationToken::new();

        let outcomes =
            start_port_forwarding(Arc::clone(&client), &[mapping("pod", 8080)], "dev", TIMEOUT, &stop).await;

        assert_eq!(
            outcomes,
            vec![ForwardOutcome {
                ports: "8080:80".to_string(),
                status: ForwardStatus::Started,
            }]
        );
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_tunnels_time_out_concurrently() {
        let client = cluster(TunnelBehavior::Hang);
        let stop = CancellationToken::new();
        let mappings = [mapping("pod", 8080), mapping("pod", 8081), mapping("pod", 8082)];

        let start = Instant::now();
        let outcomes = start_port_forwarding(Arc::clone(&client), &mappings, "dev", TIMEOUT, &stop).await;
        let elapsed = start.elapsed();

        assert!(outcomes.iter().all(|o| o.status == ForwardStatus::TimedOut));
        assert!(elapsed >= TIMEOUT);
        assert!(elapsed < TIMEOUT * 2);
        assert_eq!(client.tunnel_calls.load(Ordering::SeqCst), 3);
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_tunnel_is_reported() {
        let client = cluster(TunnelBehavior::Fail);
        let stop = CancellationToken::new();

        let outcomes =
            start_port_forwarding(client, &[mapping("pod", 8080)], "dev", TIMEOUT, &stop).await;

        assert!(matches!(
            &outcomes[0].status,
            ForwardStatus::Failed(reason) if reason.contains("address already in use")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_resource_and_missing_pod() {
        let client = Arc::new(FakeCluster::new(vec![vec![]]));
        let stop = CancellationToken::new();
        let mappings = [mapping("service", 8080), mapping("pod", 8081)];

        let outcomes = start_port_forwarding(Arc::clone(&client), &mappings, "dev", TIMEOUT, &stop).await;

        assert_eq!(
            outcomes[0].status,
            ForwardStatus::Unsupported("service".to_string())
        );
        assert_eq!(outcomes[1].status, ForwardStatus::NoPod);
        assert_eq!(client.tunnel_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 1);
    }
}
