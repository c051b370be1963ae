//! Build engine backed by the local docker CLI.
//!
//! When the current kube context is minikube and the image allows it, the
//! docker daemon inside minikube is used instead. Images built there are
//! visible to the cluster directly and are never pushed.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BuildOptions, ImageBuilder, ImageTarget};
use crate::error::{Error, Result};
use crate::kubectl::minikube::is_minikube;
use crate::registry::auth_token;

/// Docker CLI driver.
pub struct DockerBuilder {
    target: ImageTarget,
    docker: PathBuf,
    use_minikube: bool,
    /// Environment from `minikube docker-env`, resolved on first use.
    env: Option<Vec<(String, String)>>,
}

impl DockerBuilder {
    /// Create a builder for `target`.
    ///
    /// # Errors
    /// Returns a build error if no `docker` binary is on the PATH.
    pub fn new(target: ImageTarget, prefer_minikube: bool) -> Result<Self> {
        let docker = which::which("docker")
            .map_err(|e| Error::Build(format!("docker not found in PATH: {e}")))?;
        let use_minikube = prefer_minikube && is_minikube();
        debug!(docker = %docker.display(), use_minikube, "Using docker CLI");

        Ok(Self {
            target,
            docker,
            use_minikube,
            env: None,
        })
    }

    async fn docker_env(&mut self) -> Result<Vec<(String, String)>> {
        if let Some(env) = &self.env {
            return Ok(env.clone());
        }

        let env = if self.use_minikube {
            let output = Command::new("minikube")
                .args(["docker-env", "--shell", "none"])
                .output()
                .await
                .map_err(|e| Error::Build(format!("failed to run minikube docker-env: {e}")))?;
            if !output.status.success() {
                return Err(Error::Build(format!(
                    "minikube docker-env failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            parse_docker_env(&String::from_utf8_lossy(&output.stdout))
        } else {
            Vec::new()
        };

        self.env = Some(env.clone());
        Ok(env)
    }

    /// Run docker with the resolved environment, optionally feeding stdin.
    /// Output is captured unless `inherit` is set.
    async fn docker(&mut self, args: &[String], stdin: Option<&[u8]>, inherit: bool) -> Result<Output> {
        let env = self.docker_env().await?;
        let mut command = Command::new(&self.docker);
        command.args(args).envs(env);

        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        if inherit {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        debug!(?args, "Running docker");
        let mut child = command
            .spawn()
            .map_err(|e| Error::Build(format!("failed to spawn docker: {e}")))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Build(format!(
                "docker {} failed ({}): {}",
                args.first().map_or("", String::as_str),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    async fn authenticate(&mut self, username: &str, password: &str, anonymous: bool) -> Result<String> {
        if anonymous && username.is_empty() {
            debug!("Anonymous registry access, skipping docker login");
            return Ok(String::new());
        }

        let mut args = vec![
            "login".to_string(),
            "--username".to_string(),
            username.to_string(),
            "--password-stdin".to_string(),
        ];
        if !self.target.registry_url.is_empty() {
            args.push(self.target.registry_url.clone());
        }
        self.docker(&args, Some(password.as_bytes()), false).await?;

        info!(registry = %self.target.auth_registry(), username, "Logged in to registry");
        Ok(auth_token(username, password))
    }

    async fn build_image(&mut self, context: &Path, dockerfile: &Path, options: &BuildOptions) -> Result<()> {
        let args = build_args(&self.target, context, dockerfile, options);
        self.docker(&args, None, true).await?;
        info!(image = %self.target.reference(), "Built image");
        Ok(())
    }

    async fn push_image(&mut self) -> Result<()> {
        if self.use_minikube {
            info!(image = %self.target.reference(), "Built inside minikube, skipping push");
            return Ok(());
        }

        let args = vec!["push".to_string(), self.target.reference()];
        self.docker(&args, None, true).await?;
        Ok(())
    }
}

fn build_args(target: &ImageTarget, context: &Path, dockerfile: &Path, options: &BuildOptions) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--file".to_string(),
        dockerfile.display().to_string(),
        "--tag".to_string(),
        target.reference(),
    ];
    for (key, value) in &options.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(context.display().to_string());
    args
}

/// Parse `KEY=VALUE` lines as printed by `minikube docker-env`. `export`
/// prefixes, quotes and comments are tolerated.
fn parse_docker_env(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}
