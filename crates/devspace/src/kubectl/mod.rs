//! Kubernetes cluster access.

pub mod client;
pub mod exec;
pub mod minikube;
mod portforward;
pub mod status;

pub use client::{Cluster, ClusterClient, PortTunnel};
pub use exec::ExecSession;
pub use status::pod_status;
