//! Release deployment and pod resolution.
//!
//! After a chart is installed or upgraded, pods of the previous revision can
//! still be around for a while. The coordinator polls the pods labelled with
//! the release name until one of the expected revision shows up, then waits
//! for it to become ready.

use std::path::{Path, PathBuf};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_yaml::{Mapping, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DevspaceConfig, ReleaseConfig};
use crate::deploy::ChartDeployer;
use crate::error::{Error, Result};
use crate::kubectl::Cluster;
use crate::registry::{image_url, pull_secret_name};

/// Annotation carrying the chart revision on release pods.
pub const REVISION_ANNOTATION: &str = "revision";

/// Interval between release pod listings.
pub const RELEASE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for the release pod to appear.
pub const DEFAULT_RELEASE_WAIT: Duration = Duration::from_secs(10 * 60);

/// Readiness budget once a release pod was selected.
pub const POD_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Readiness poll interval.
pub const POD_READY_INTERVAL: Duration = Duration::from_secs(5);

/// A release to install, built fresh on every run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseDescriptor {
    pub name: String,
    pub namespace: String,
    pub chart_path: PathBuf,
    /// Values layered over the chart's own `values.yaml`.
    pub values: Value,
}

impl ReleaseDescriptor {
    /// Build the descriptor and value overrides from the project config.
    ///
    /// Every image is wired in as `containers.<image>.image`. With
    /// `no_sleep`, `command` and `args` are cleared so the image's own
    /// entrypoint runs. `pullSecrets` extends the chart's list with one
    /// secret per registry.
    ///
    /// # Errors
    /// Returns a configuration error if the chart's `values.yaml` cannot be
    /// read, or an image references an unknown registry.
    pub fn from_config(config: &DevspaceConfig, workdir: &Path, no_sleep: bool) -> Result<Self> {
        let release = &config.devspace.release;
        validate_release(release)?;

        let chart_path = workdir.join(config.devspace.chart_path());
        let values_path = chart_path.join("values.yaml");
        let content = std::fs::read_to_string(&values_path).map_err(|e| {
            Error::config(format!(
                "Couldn't deploy chart, error reading from chart values {}: {e}",
                values_path.display()
            ))
        })?;
        let chart_values: Value = serde_yaml::from_str(&content)?;

        let mut containers = Mapping::new();
        for (name, image) in &config.images {
            let mut container = Mapping::new();
            container.insert("image".into(), image_url(config, image)?.into());
            if no_sleep {
                container.insert("command".into(), Value::Sequence(Vec::new()));
                container.insert("args".into(), Value::Sequence(Vec::new()));
            }
            containers.insert(name.as_str().into(), Value::Mapping(container));
        }

        let mut pull_secrets = match chart_values.get("pullSecrets") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(existing)) => existing.clone(),
            Some(other) => {
                return Err(Error::config(format!(
                    "pullSecrets in {} must be a list, found {other:?}",
                    values_path.display()
                )))
            }
        };
        pull_secrets.extend(
            config
                .registries
                .values()
                .filter_map(|registry| registry.url.as_deref())
                .map(|url| Value::from(pull_secret_name(url))),
        );

        let mut values = Mapping::new();
        values.insert("containers".into(), Value::Mapping(containers));
        values.insert("pullSecrets".into(), Value::Sequence(pull_secrets));

        Ok(Self {
            name: release.name.clone(),
            namespace: release.namespace.clone(),
            chart_path,
            values: Value::Mapping(values),
        })
    }

    /// Label selector matching the release's pods.
    #[must_use]
    pub fn selector(&self) -> String {
        release_selector(&self.name)
    }
}

fn validate_release(release: &ReleaseConfig) -> Result<()> {
    if release.name.is_empty() || release.namespace.is_empty() {
        return Err(Error::config("devspace.release needs a name and a namespace"));
    }
    Ok(())
}

/// Label selector matching the pods of a release.
#[must_use]
pub fn release_selector(release: &str) -> String {
    format!("release={release}")
}

fn revision_annotation(pod: &Pod) -> Option<&str> {
    pod.annotations().get(REVISION_ANNOTATION).map(String::as_str)
}

/// Pick the release pod with the highest revision.
///
/// The first pod is the provisional pick regardless of its annotation. A
/// later pod only replaces it with a strictly greater revision, so on ties
/// the first one seen wins. Missing or unparseable revisions count as zero.
#[must_use]
pub fn select_release_pod(pods: &[Pod]) -> Option<&Pod> {
    let (first, rest) = pods.split_first()?;
    let rank = |pod: &Pod| {
        revision_annotation(pod)
            .and_then(|rev| rev.parse::<i64>().ok())
            .unwrap_or(0)
    };

    let mut selected = first;
    let mut highest = rank(first);
    for pod in rest {
        if revision_annotation(pod).is_none() {
            continue;
        }
        let revision = rank(pod);
        if revision > highest {
            selected = pod;
            highest = revision;
        }
    }
    Some(selected)
}

/// Whether a selected pod belongs to the expected revision.
fn accepts(pod: &Pod, expected_revision: i64) -> bool {
    match revision_annotation(pod) {
        None => {
            warn!(
                pod = %pod.name_any(),
                "Found pod without revision. Use annotation 'revision' for your pods to avoid this warning."
            );
            true
        }
        Some(revision) => revision.parse::<i64>().ok() == Some(expected_revision),
    }
}

/// Deploys the release and resolves the session pod.
pub struct ReleaseCoordinator<'a> {
    cluster: &'a dyn Cluster,
    deployer: &'a dyn ChartDeployer,
}

impl<'a> ReleaseCoordinator<'a> {
    #[must_use]
    pub fn new(cluster: &'a dyn Cluster, deployer: &'a dyn ChartDeployer) -> Self {
        Self { cluster, deployer }
    }

    /// Make sure the release namespace exists.
    ///
    /// # Errors
    /// Returns the cluster error if the namespace cannot be created.
    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        self.cluster.ensure_namespace(name).await
    }

    /// Install or upgrade the release and return its revision.
    ///
    /// # Errors
    /// Returns the deployer's error.
    pub async fn deploy(&self, release: &ReleaseDescriptor) -> Result<i64> {
        let revision = self.deployer.install_or_upgrade(release).await?;
        info!(release = %release.name, revision, "Deployed release");
        Ok(revision)
    }

    /// Wait for a pod of `expected_revision` and then for it to be ready.
    ///
    /// Pods labelled `release=<name>` are listed every
    /// [`RELEASE_POLL_INTERVAL`]. A pod without a revision annotation is
    /// accepted right away.
    ///
    /// # Errors
    /// Returns listing errors immediately, [`Error::Timeout`] if no matching
    /// pod shows up within `max_wait` or the pod does not become ready,
    /// and [`Error::Cancelled`] when `cancel` fires.
    pub async fn resolve_ready_pod(
        &self,
        release: &str,
        namespace: &str,
        expected_revision: i64,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Pod> {
        let selector = release_selector(release);
        let deadline = Instant::now() + max_wait;

        loop {
            let pods = self.cluster.list_pods(&selector, namespace).await?;
            match select_release_pod(&pods) {
                Some(pod) if accepts(pod, expected_revision) => {
                    debug!(pod = %pod.name_any(), expected_revision, "Selected release pod");
                    return self
                        .cluster
                        .wait_for_ready(pod, POD_READY_TIMEOUT, POD_READY_INTERVAL, cancel)
                        .await;
                }
                Some(pod) => info!(
                    pod = %pod.name_any(),
                    found = ?revision_annotation(pod),
                    expected_revision,
                    "Waiting for release upgrade to complete"
                ),
                None => info!(release, "Waiting for release to be deployed"),
            }

            if Instant::now() + RELEASE_POLL_INTERVAL > deadline {
                return Err(Error::Timeout {
                    what: format!("a pod of release {release} revision {expected_revision}"),
                    secs: max_wait.as_secs(),
                });
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(RELEASE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Return the session pod, deploying first when needed.
    ///
    /// With `force_deploy` the chart is always deployed. Otherwise a running
    /// pod of the release is reused if there is one. `describe` is only
    /// called when a deploy happens.
    ///
    /// # Errors
    /// Returns descriptor, deploy, listing, timeout and cancellation errors.
    pub async fn ensure_release_pod<F>(
        &self,
        release: &ReleaseConfig,
        force_deploy: bool,
        describe: F,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Pod>
    where
        F: FnOnce() -> Result<ReleaseDescriptor> + Send,
    {
        validate_release(release)?;

        if !force_deploy {
            if let Some(pod) = self
                .cluster
                .first_running_pod(&release_selector(&release.name), &release.namespace)
                .await?
            {
                info!(pod = %pod.name_any(), "Reusing running release pod");
                return Ok(pod);
            }
            debug!(release = %release.name, "No running release pod, deploying");
        }

        let descriptor = describe()?;
        let revision = self.deploy(&descriptor).await?;
        self.resolve_ready_pod(&descriptor.name, &descriptor.namespace, revision, max_wait, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageConfig, RegistryConfig};
    use crate::testing::{pending_pod, running_pod, FakeCluster};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDeployer {
        revision: i64,
        calls: AtomicUsize,
    }

    impl FakeDeployer {
        fn new(revision: i64) -> Self {
            Self {
                revision,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChartDeployer for FakeDeployer {
        async fn install_or_upgrade(&self, _release: &ReleaseDescriptor) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.revision)
        }
    }

    fn descriptor() -> Result<ReleaseDescriptor> {
        Ok(ReleaseDescriptor {
            name: "my-app".to_string(),
            namespace: "dev".to_string(),
            chart_path: PathBuf::from("chart"),
            values: Value::Null,
        })
    }

    fn release_config() -> ReleaseConfig {
        ReleaseConfig {
            name: "my-app".to_string(),
            namespace: "dev".to_string(),
        }
    }

    #[test]
    fn test_tie_break_keeps_first_seen() {
        let pods = vec![
            running_pod("a", "dev", Some("3")),
            running_pod("b", "dev", Some("7")),
            running_pod("c", "dev", Some("7")),
        ];
        assert_eq!(select_release_pod(&pods).unwrap().name_any(), "b");
    }

    #[test]
    fn test_selection_edge_cases() {
        assert!(select_release_pod(&[]).is_none());

        // The first pod is kept even without a revision until a later pod
        // has a positive one.
        let pods = vec![running_pod("a", "dev", None), running_pod("b", "dev", Some("2"))];
        assert_eq!(select_release_pod(&pods).unwrap().name_any(), "b");

        let pods = vec![running_pod("a", "dev", Some("5")), running_pod("b", "dev", None)];
        assert_eq!(select_release_pod(&pods).unwrap().name_any(), "a");

        let pods = vec![running_pod("a", "dev", Some("x")), running_pod("b", "dev", Some("1"))];
        assert_eq!(select_release_pod(&pods).unwrap().name_any(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pod_without_revision_accepted_immediately() {
        let cluster = FakeCluster::new(vec![vec![running_pod("a", "dev", None)]]);
        let deployer = FakeDeployer::new(4);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let pod = coordinator
            .resolve_ready_pod("my-app", "dev", 4, DEFAULT_RELEASE_WAIT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pod.name_any(), "a");
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_expected_revision_appears() {
        let cluster = FakeCluster::new(vec![
            vec![],
            vec![running_pod("old", "dev", Some("1"))],
            vec![
                running_pod("old", "dev", Some("1")),
                pending_pod("new", "dev", Some("2")),
            ],
        ]);
        let deployer = FakeDeployer::new(2);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let start = Instant::now();
        let pod = coordinator
            .resolve_ready_pod("my-app", "dev", 2, DEFAULT_RELEASE_WAIT, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pod.name_any(), "new");
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= RELEASE_POLL_INTERVAL * 2);
        assert!(elapsed < RELEASE_POLL_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_loop_is_bounded() {
        let cluster = FakeCluster::new(vec![vec![running_pod("old", "dev", Some("1"))]]);
        let deployer = FakeDeployer::new(2);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let err = coordinator
            .resolve_ready_pod("my-app", "dev", 2, Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { secs: 10, .. }));
        assert!(cluster.list_calls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let cluster = FakeCluster::new(vec![vec![]]);
        let deployer = FakeDeployer::new(1);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .resolve_ready_pod("my-app", "dev", 1, DEFAULT_RELEASE_WAIT, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_is_fatal() {
        let cluster =
            FakeCluster::new(vec![vec![pending_pod("a", "dev", Some("1"))]]).ready_on_get(None);
        let deployer = FakeDeployer::new(1);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let err = coordinator
            .resolve_ready_pod("my-app", "dev", 1, DEFAULT_RELEASE_WAIT, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { secs: 120, .. }));
        assert_eq!(cluster.get_calls.load(Ordering::SeqCst), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_propagates() {
        let cluster = FakeCluster::new(vec![vec![running_pod("a", "dev", None)]]).failing_get();
        let deployer = FakeDeployer::new(1);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let err = coordinator
            .resolve_ready_pod("my-app", "dev", 1, DEFAULT_RELEASE_WAIT, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_api_status(404));
        assert_eq!(cluster.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_pod_is_reused_without_deploy() {
        let cluster = FakeCluster::new(vec![vec![running_pod("a", "dev", Some("1"))]]);
        let deployer = FakeDeployer::new(2);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let pod = coordinator
            .ensure_release_pod(
                &release_config(),
                false,
                descriptor,
                DEFAULT_RELEASE_WAIT,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(pod.name_any(), "a");
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_deploy_waits_for_new_revision() {
        let cluster = FakeCluster::new(vec![
            vec![running_pod("a", "dev", Some("1"))],
            vec![running_pod("a", "dev", Some("1")), running_pod("b", "dev", Some("2"))],
        ]);
        let deployer = FakeDeployer::new(2);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let pod = coordinator
            .ensure_release_pod(
                &release_config(),
                true,
                descriptor,
                DEFAULT_RELEASE_WAIT,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(pod.name_any(), "b");
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_running_pod_falls_back_to_deploy() {
        let cluster = FakeCluster::new(vec![
            vec![pending_pod("a", "dev", None)],
            vec![running_pod("a", "dev", None)],
        ]);
        let deployer = FakeDeployer::new(1);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        coordinator
            .ensure_release_pod(
                &release_config(),
                false,
                descriptor,
                DEFAULT_RELEASE_WAIT,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reuse_does_not_read_chart_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DevspaceConfig::default();
        config.devspace.release = release_config();

        let cluster = FakeCluster::new(vec![vec![running_pod("a", "dev", Some("1"))]]);
        let deployer = FakeDeployer::new(2);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        let pod = coordinator
            .ensure_release_pod(
                &config.devspace.release,
                false,
                || ReleaseDescriptor::from_config(&config, dir.path(), false),
                DEFAULT_RELEASE_WAIT,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(pod.name_any(), "a");
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 0);

        let err = coordinator
            .ensure_release_pod(
                &config.devspace.release,
                true,
                || ReleaseDescriptor::from_config(&config, dir.path(), false),
                DEFAULT_RELEASE_WAIT,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_namespace_delegates_to_cluster() {
        let cluster = FakeCluster::new(vec![]);
        let deployer = FakeDeployer::new(1);
        let coordinator = ReleaseCoordinator::new(&cluster, &deployer);

        coordinator.ensure_namespace("dev").await.unwrap();
        coordinator.ensure_namespace("tools").await.unwrap();
        assert_eq!(*cluster.namespaces.lock().unwrap(), vec!["dev", "tools"]);
    }

    #[test]
    fn test_value_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("chart")).unwrap();
        std::fs::write(
            dir.path().join("chart/values.yaml"),
            "pullSecrets:\n  - existing-secret\nreplicas: 1\n",
        )
        .unwrap();

        let mut config = DevspaceConfig::default();
        config.devspace.release.name = "my-app".to_string();
        config.devspace.release.namespace = "dev".to_string();
        config.images.insert(
            "default".to_string(),
            ImageConfig {
                name: "team/app".to_string(),
                tag: Some("abc1234".to_string()),
                registry: Some("internal".to_string()),
                ..Default::default()
            },
        );
        config.registries.insert(
            "internal".to_string(),
            RegistryConfig {
                url: Some("registry.example.com".to_string()),
                ..Default::default()
            },
        );

        let release = ReleaseDescriptor::from_config(&config, dir.path(), true).unwrap();
        assert_eq!(release.chart_path, dir.path().join("chart/"));
        assert_eq!(release.selector(), "release=my-app");

        let expected: Value = serde_yaml::from_str(
            r"
containers:
  default:
    image: registry.example.com/team/app:abc1234
    command: []
    args: []
pullSecrets:
  - existing-secret
  - devspace-auth-registry-example-com
",
        )
        .unwrap();
        assert_eq!(release.values, expected);
    }

    #[test]
    fn test_missing_chart_values_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DevspaceConfig::default();
        config.devspace.release.name = "my-app".to_string();
        config.devspace.release.namespace = "dev".to_string();

        let err = ReleaseDescriptor::from_config(&config, dir.path(), false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
