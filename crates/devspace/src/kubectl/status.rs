//! Pod status derivation.
//!
//! Computes the same status string `kubectl get pods` prints in its STATUS
//! column. Running-pod discovery keys off this value, not the raw phase.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Pod reason set by the node controller when the node is unreachable.
pub const NODE_UNREACHABLE_POD_REASON: &str = "NodeLost";

/// Status string of a healthy pod.
pub const STATUS_RUNNING: &str = "Running";

/// Derive the display status of a pod.
#[must_use]
pub fn pod_status(pod: &Pod) -> String {
    let status = pod.status.as_ref();

    let mut reason = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    if let Some(pod_reason) = status.and_then(|s| s.reason.as_deref()) {
        if !pod_reason.is_empty() {
            reason = pod_reason.to_string();
        }
    }

    let init_total = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.init_containers.as_ref())
        .map_or(0, Vec::len);
    let init_statuses = status
        .and_then(|s| s.init_container_statuses.as_deref())
        .unwrap_or_default();

    let mut initializing = false;
    for (i, container) in init_statuses.iter().enumerate() {
        if let Some(init_reason) = init_container_reason(container, i, init_total) {
            reason = init_reason;
            initializing = true;
            break;
        }
    }

    if !initializing {
        let container_statuses = status
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        let mut has_running = false;

        for container in container_statuses.iter().rev() {
            let state = container.state.as_ref();
            let waiting = state.and_then(|s| s.waiting.as_ref());
            let terminated = state.and_then(|s| s.terminated.as_ref());

            if let Some(waiting_reason) = waiting
                .and_then(|w| w.reason.as_deref())
                .filter(|r| !r.is_empty())
            {
                reason = waiting_reason.to_string();
            } else if let Some(terminated) = terminated {
                match terminated.reason.as_deref().filter(|r| !r.is_empty()) {
                    Some(terminated_reason) => reason = terminated_reason.to_string(),
                    None => {
                        reason = match terminated.signal.filter(|s| *s != 0) {
                            Some(signal) => format!("Signal:{signal}"),
                            None => format!("ExitCode:{}", terminated.exit_code),
                        };
                    }
                }
            } else if container.ready && state.is_some_and(|s| s.running.is_some()) {
                has_running = true;
            }
        }

        if reason == "Completed" && has_running {
            reason = STATUS_RUNNING.to_string();
        }
    }

    if pod.metadata.deletion_timestamp.is_some() {
        let pod_reason = status.and_then(|s| s.reason.as_deref());
        reason = if pod_reason == Some(NODE_UNREACHABLE_POD_REASON) {
            "Unknown".to_string()
        } else {
            "Terminating".to_string()
        };
    }

    reason
}

/// Reason contributed by an init container, or `None` if it completed cleanly.
fn init_container_reason(container: &ContainerStatus, index: usize, total: usize) -> Option<String> {
    let state = container.state.as_ref();
    let terminated = state.and_then(|s| s.terminated.as_ref());
    let waiting = state.and_then(|s| s.waiting.as_ref());

    match (terminated, waiting) {
        (Some(terminated), _) if terminated.exit_code == 0 => None,
        (Some(terminated), _) => Some(
            match terminated.reason.as_deref().filter(|r| !r.is_empty()) {
                Some(reason) => format!("Init:{reason}"),
                None => match terminated.signal.filter(|s| *s != 0) {
                    Some(signal) => format!("Init:Signal:{signal}"),
                    None => format!("Init:ExitCode:{}", terminated.exit_code),
                },
            },
        ),
        (None, Some(waiting))
            if waiting
                .reason
                .as_deref()
                .is_some_and(|r| !r.is_empty() && r != "PodInitializing") =>
        {
            Some(format!("Init:{}", waiting.reason.as_deref().unwrap_or_default()))
        }
        _ => Some(format!("Init:{index}/{total}")),
    }
}

/// Returns true if the pod's first container reports ready.
#[must_use]
pub fn is_primary_container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .is_some_and(|c| c.ready)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStateWaiting, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn container_status(state: ContainerState, ready: bool) -> ContainerStatus {
        ContainerStatus {
            name: "main".to_string(),
            ready,
            state: Some(state),
            ..Default::default()
        }
    }

    fn running() -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    }

    fn waiting(reason: &str) -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some(reason.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32, signal: Option<i32>, reason: Option<&str>) -> ContainerState {
        ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code,
                signal,
                reason: reason.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn pod_with(phase: &str, containers: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(containers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_pod() {
        let pod = pod_with("Running", vec![container_status(running(), true)]);
        assert_eq!(pod_status(&pod), "Running");
        assert!(is_primary_container_ready(&pod));
    }

    #[test]
    fn test_waiting_reason_overrides_phase() {
        let pod = pod_with(
            "Pending",
            vec![container_status(waiting("ContainerCreating"), false)],
        );
        assert_eq!(pod_status(&pod), "ContainerCreating");
        assert!(!is_primary_container_ready(&pod));
    }

    #[test]
    fn test_terminated_without_reason_renders_signal_or_exit_code() {
        let pod = pod_with(
            "Running",
            vec![container_status(terminated(137, Some(9), None), false)],
        );
        assert_eq!(pod_status(&pod), "Signal:9");

        let pod = pod_with(
            "Running",
            vec![container_status(terminated(3, None, None), false)],
        );
        assert_eq!(pod_status(&pod), "ExitCode:3");
    }

    #[test]
    fn test_containers_scanned_in_reverse() {
        // The first container is scanned last, so its reason wins.
        let pod = pod_with(
            "Running",
            vec![
                container_status(waiting("CrashLoopBackOff"), false),
                container_status(waiting("ImagePullBackOff"), false),
            ],
        );
        assert_eq!(pod_status(&pod), "CrashLoopBackOff");
    }

    #[test]
    fn test_completed_corrected_to_running() {
        let pod = pod_with(
            "Running",
            vec![
                container_status(running(), true),
                container_status(terminated(0, None, Some("Completed")), false),
            ],
        );
        assert_eq!(pod_status(&pod), "Running");
    }

    #[test]
    fn test_init_container_states() {
        let mut pod = pod_with("Pending", vec![container_status(running(), true)]);
        pod.spec = Some(PodSpec {
            init_containers: Some(vec![Container::default(), Container::default()]),
            ..Default::default()
        });

        let status = pod.status.as_mut().unwrap();
        status.init_container_statuses = Some(vec![
            container_status(terminated(0, None, Some("Completed")), false),
            container_status(waiting("PodInitializing"), false),
        ]);
        assert_eq!(pod_status(&pod), "Init:1/2");

        let status = pod.status.as_mut().unwrap();
        status.init_container_statuses = Some(vec![container_status(
            terminated(1, None, Some("Error")),
            false,
        )]);
        assert_eq!(pod_status(&pod), "Init:Error");

        let status = pod.status.as_mut().unwrap();
        status.init_container_statuses = Some(vec![container_status(
            terminated(2, None, None),
            false,
        )]);
        assert_eq!(pod_status(&pod), "Init:ExitCode:2");

        let status = pod.status.as_mut().unwrap();
        status.init_container_statuses =
            Some(vec![container_status(waiting("ErrImagePull"), false)]);
        assert_eq!(pod_status(&pod), "Init:ErrImagePull");
    }

    #[test]
    fn test_deletion_timestamp() {
        let mut pod = pod_with("Running", vec![]);
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(pod_status(&pod), "Terminating");

        pod.status.as_mut().unwrap().reason = Some(NODE_UNREACHABLE_POD_REASON.to_string());
        assert_eq!(pod_status(&pod), "Unknown");
    }
}
