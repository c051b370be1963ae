//! In-cluster build engine using kaniko.
//!
//! A short-lived build pod is created, the registry credentials and the
//! build context are uploaded through exec, and the kaniko executor builds
//! and pushes the image from inside the cluster. The pod is always deleted
//! afterwards.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BuildOptions, ImageBuilder, ImageTarget};
use crate::archive::{self, ExcludeMatcher};
use crate::error::{Error, Result};
use crate::kubectl::{Cluster, ClusterClient};
use crate::registry::{auth_token, docker_config_json};

/// Executor image; the debug variant ships a busybox shell for uploads.
const KANIKO_IMAGE: &str = "gcr.io/kaniko-project/executor:debug";

const KANIKO_CONTAINER: &str = "kaniko";

/// Where the build context is unpacked inside the pod.
const WORKSPACE: &str = "/workspace";

/// Archive path the Dockerfile is shipped under, so it may live outside
/// the context directory.
const DOCKERFILE_ENTRY: &str = ".devspace-build/Dockerfile";

const POD_READY_TIMEOUT: Duration = Duration::from_secs(120);
const POD_READY_INTERVAL: Duration = Duration::from_secs(2);

/// Kaniko build driver.
pub struct KanikoBuilder {
    client: ClusterClient,
    target: ImageTarget,
    namespace: String,
    credentials: Option<(String, String)>,
    cancel: CancellationToken,
}

impl KanikoBuilder {
    /// Create a builder. Cancelling `cancel` aborts a running build and
    /// removes its pod.
    #[must_use]
    pub fn new(
        client: ClusterClient,
        target: ImageTarget,
        namespace: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            target,
            namespace,
            credentials: None,
            cancel,
        }
    }

    fn pod_name(&self) -> String {
        format!("devspace-build-{}", self.target.tag.to_lowercase())
    }

    fn build_pod(&self) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("devspace-build".to_string(), "true".to_string());

        Pod {
            metadata: ObjectMeta {
                name: Some(self.pod_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: KANIKO_CONTAINER.to_string(),
                    image: Some(KANIKO_IMAGE.to_string()),
                    command: Some(vec!["/busybox/sleep".to_string(), "36000".to_string()]),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn upload(&self, pod: &Pod, script: &str, data: Vec<u8>) -> Result<()> {
        let command = vec!["/busybox/sh".to_string(), "-c".to_string(), script.to_string()];
        self.client
            .exec_buffered(pod, KANIKO_CONTAINER, &command, Some(data))
            .await
            .map_err(|e| Error::Build(format!("upload to build pod failed: {e}")))?;
        Ok(())
    }

    async fn run_build(&self, pod: &Pod, context: &Path, dockerfile: &Path, options: &BuildOptions) -> Result<()> {
        if let Some((username, password)) = &self.credentials {
            let config = docker_config_json(self.target.auth_registry(), username, password)?;
            self.upload(
                pod,
                "mkdir -p /kaniko/.docker && cat > /kaniko/.docker/config.json",
                config,
            )
            .await?;
        }

        let files = archive::collect_files(context, &ExcludeMatcher::default())?;
        let dockerfile_content = std::fs::read(dockerfile)?;
        let context_archive = archive::pack(
            context,
            &files,
            &[(DOCKERFILE_ENTRY.to_string(), dockerfile_content)],
        )?;
        debug!(files = files.len(), bytes = context_archive.len(), "Uploading build context");
        self.upload(
            pod,
            &format!("mkdir -p {WORKSPACE} && tar -xf - -C {WORKSPACE}"),
            context_archive,
        )
        .await?;

        let command = executor_command(&self.target, options);
        let mut session = self
            .client
            .exec_stream(pod, KANIKO_CONTAINER, &command)
            .await?;
        session.stdin.shutdown().await.ok();
        tokio::join!(
            log_lines(&mut session.stdout),
            log_lines(&mut session.stderr)
        );

        session
            .wait()
            .await
            .map_err(|e| Error::Build(format!("kaniko executor failed: {e}")))
    }

    async fn delete_pod(&self, name: &str) {
        match self
            .client
            .pods(&self.namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => debug!(pod = name, "Deleted build pod"),
            Err(e) => warn!(pod = name, error = %e, "Failed to delete build pod"),
        }
    }
}

#[async_trait]
impl ImageBuilder for KanikoBuilder {
    async fn authenticate(&mut self, username: &str, password: &str, anonymous: bool) -> Result<String> {
        if anonymous && username.is_empty() {
            self.credentials = None;
            return Ok(String::new());
        }

        self.credentials = Some((username.to_string(), password.to_string()));
        Ok(auth_token(username, password))
    }

    async fn build_image(&mut self, context: &Path, dockerfile: &Path, options: &BuildOptions) -> Result<()> {
        self.client.ensure_namespace(&self.namespace).await?;

        let pods = self.client.pods(&self.namespace);
        let pod = pods.create(&PostParams::default(), &self.build_pod()).await?;
        let name = self.pod_name();
        info!(pod = %name, namespace = %self.namespace, "Created build pod");

        let build = async {
            let pod = self
                .client
                .wait_for_ready(&pod, POD_READY_TIMEOUT, POD_READY_INTERVAL, &self.cancel)
                .await?;
            self.run_build(&pod, context, dockerfile, options).await
        };
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                warn!(pod = %name, "Build cancelled");
                Err(Error::Cancelled)
            }
            result = build => result,
        };

        self.delete_pod(&name).await;
        result?;

        info!(image = %self.target.reference(), "Built and pushed image");
        Ok(())
    }

    async fn push_image(&mut self) -> Result<()> {
        debug!(image = %self.target.reference(), "Pushed by the kaniko executor");
        Ok(())
    }
}

fn executor_command(target: &ImageTarget, options: &BuildOptions) -> Vec<String> {
    let mut command = vec![
        "/kaniko/executor".to_string(),
        format!("--dockerfile={WORKSPACE}/{DOCKERFILE_ENTRY}"),
        format!("--context=dir://{WORKSPACE}"),
        format!("--destination={}", target.reference()),
    ];
    if target.insecure {
        command.push("--insecure".to_string());
        command.push("--skip-tls-verify".to_string());
    }
    for (key, value) in &options.build_args {
        command.push(format!("--build-arg={key}={value}"));
    }
    command
}

/// Log every line of the executor output until EOF. Lines need not be UTF-8.
async fn log_lines<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => info!(engine = "kaniko", "{}", String::from_utf8_lossy(&line).trim_end()),
            Err(e) => {
                debug!(error = %e, "Executor output closed");
                break;
            }
        }
    }
}
