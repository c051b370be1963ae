//! Chart deployment through the helm v3 CLI.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use super::ChartDeployer;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::kubectl::client::render_kubeconfig;
use crate::release::ReleaseDescriptor;

/// Runs `helm upgrade --install` against the project's cluster.
pub struct HelmCli {
    helm: PathBuf,
    /// Kubeconfig rendered from the project credentials, removed on drop.
    kubeconfig: Option<NamedTempFile>,
}

impl HelmCli {
    /// Locate helm and prepare a kubeconfig for the project cluster.
    ///
    /// Without cluster credentials helm falls back to the user's kubeconfig.
    ///
    /// # Errors
    /// Returns a deploy error if helm is not installed, or an I/O error if
    /// the kubeconfig cannot be written.
    pub fn new(cluster: Option<&ClusterConfig>) -> Result<Self> {
        let helm = which::which("helm")
            .map_err(|e| Error::Deploy(format!("helm not found in PATH: {e}")))?;

        let kubeconfig = match cluster {
            Some(cluster) => {
                let mut file = tempfile::Builder::new()
                    .prefix("devspace-kubeconfig-")
                    .suffix(".yaml")
                    .tempfile()?;
                file.write_all(render_kubeconfig(cluster)?.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };

        debug!(helm = %helm.display(), "Using helm CLI");
        Ok(Self { helm, kubeconfig })
    }

    async fn helm(&self, mut args: Vec<String>) -> Result<Vec<u8>> {
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.path().display().to_string());
        }

        debug!(?args, "Running helm");
        let output = Command::new(&self.helm)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Deploy(format!("failed to run helm: {e}")))?;

        if !output.status.success() {
            return Err(Error::Deploy(format!(
                "helm {} failed: {}",
                args.first().map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ChartDeployer for HelmCli {
    async fn install_or_upgrade(&self, release: &ReleaseDescriptor) -> Result<i64> {
        let mut values = tempfile::Builder::new()
            .prefix("devspace-values-")
            .suffix(".yaml")
            .tempfile()?;
        values.write_all(serde_yaml::to_string(&release.values)?.as_bytes())?;
        values.flush()?;

        self.helm(vec![
            "upgrade".to_string(),
            "--install".to_string(),
            release.name.clone(),
            release.chart_path.display().to_string(),
            "--namespace".to_string(),
            release.namespace.clone(),
            "--values".to_string(),
            values.path().display().to_string(),
        ])
        .await?;

        let status = self
            .helm(vec![
                "status".to_string(),
                release.name.clone(),
                "--namespace".to_string(),
                release.namespace.clone(),
                "--output".to_string(),
                "json".to_string(),
            ])
            .await?;

        let revision = parse_revision(&status)?;
        info!(release = %release.name, namespace = %release.namespace, revision, "Deployed chart");
        Ok(revision)
    }
}

/// Extract the revision from `helm status -o json`.
fn parse_revision(status: &[u8]) -> Result<i64> {
    let status: serde_json::Value = serde_json::from_slice(status)?;
    status
        .get("version")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| Error::Deploy("helm status did not report a release version".to_string()))
}
