//! Minikube detection.

use std::sync::OnceLock;

use kube::config::Kubeconfig;
use tracing::debug;

/// Context name minikube writes into the user's kubeconfig.
const MINIKUBE_CONTEXT: &str = "minikube";

static IS_MINIKUBE: OnceLock<bool> = OnceLock::new();

/// Returns true if the current kubeconfig context is minikube.
///
/// Computed once per process; an unreadable kubeconfig counts as "not
/// minikube".
pub fn is_minikube() -> bool {
    *IS_MINIKUBE.get_or_init(|| {
        let current = Kubeconfig::read()
            .ok()
            .and_then(|config| config.current_context);
        debug!(context = ?current, "Detected kubeconfig context");
        is_minikube_context(current.as_deref())
    })
}

fn is_minikube_context(context: Option<&str>) -> bool {
    context == Some(MINIKUBE_CONTEXT)
}
