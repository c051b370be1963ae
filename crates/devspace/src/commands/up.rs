//! `devspace up`: build, deploy and attach to the development environment.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use k8s_openapi::api::core::v1::Pod;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::build::{BuildDispatcher, EngineFactory};
use crate::config::{ConfigFile, DevspaceConfig};
use crate::deploy::HelmCli;
use crate::error::Error;
use crate::forward::{start_port_forwarding, ForwardStatus};
use crate::kubectl::ClusterClient;
use crate::registry::{create_pull_secret, credentials};
use crate::release::{ReleaseCoordinator, ReleaseDescriptor, DEFAULT_RELEASE_WAIT};
use crate::sync::{start_sync, SyncSession, UploadSync};
use crate::ui;

/// How long a tunnel may take to start listening.
const PORT_FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code after a second interrupt.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Shell started when no `--shell` is given.
const DEFAULT_SHELL: &str = "command -v bash >/dev/null 2>&1 && exec bash || exec sh";

/// Build, deploy and attach to the devspace
#[derive(Args, Debug, Clone)]
pub struct UpCommand {
    /// Build images before deploying; passing the flag forces a rebuild
    #[arg(short, long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    build: Option<bool>,

    /// Deploy the chart even if a release pod is running
    #[arg(short, long)]
    deploy: bool,

    /// Start file synchronization
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    sync: Option<bool>,

    /// Start port forwarding
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    portforwarding: Option<bool>,

    /// Create image pull secrets for registries with credentials
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    init_registries: Option<bool>,

    /// Command to run instead of the default shell
    #[arg(short, long, value_name = "COMMAND")]
    shell: Option<String>,

    /// Keep the image's own command and args instead of the chart's
    #[arg(long)]
    no_sleep: bool,
}

impl UpCommand {
    fn build_enabled(&self) -> bool {
        self.build.unwrap_or(true)
    }

    /// A rebuild is forced only when `--build` was given explicitly.
    fn force_build(&self) -> bool {
        self.build == Some(true)
    }

    fn shell_command(&self) -> Vec<String> {
        match &self.shell {
            Some(shell) if !shell.is_empty() => vec![shell.clone()],
            _ => vec!["sh".to_string(), "-c".to_string(), DEFAULT_SHELL.to_string()],
        }
    }

    pub async fn run(&self, workdir: &Path) -> Result<()> {
        ui::print_section("devspace up");

        let mut file = ConfigFile::load(workdir).context("Failed to load devspace config")?;
        let client = ClusterClient::connect(file.config.cluster.as_ref())
            .await
            .context("Failed to connect to cluster")?;
        let namespace = file.config.devspace.release.namespace.clone();

        let cancel = CancellationToken::new();
        tokio::spawn(watch_interrupts(cancel.clone()));

        let deployer = HelmCli::new(file.config.cluster.as_ref()).context("Failed to set up helm")?;
        let coordinator = ReleaseCoordinator::new(&client, &deployer);
        coordinator
            .ensure_namespace(&namespace)
            .await
            .with_context(|| format!("Unable to create namespace {namespace}"))?;

        if self.init_registries.unwrap_or(true) {
            init_registries(&client, &file.config, &namespace).await?;
        }

        let rebuilt = if self.build_enabled() {
            let factory = EngineFactory::new(client.clone(), cancel.clone());
            BuildDispatcher::new(&factory, workdir)
                .with_cancel(cancel.clone())
                .build_images(&mut file, self.force_build())
                .await
                .context("Image building failed")?
        } else {
            false
        };

        let spinner = ui::Spinner::start("Waiting for release pod to become ready");
        let pod = coordinator
            .ensure_release_pod(
                &file.config.devspace.release,
                rebuilt || self.deploy,
                || ReleaseDescriptor::from_config(&file.config, workdir, self.no_sleep),
                DEFAULT_RELEASE_WAIT,
                &cancel,
            )
            .await
            .context("Unable to resolve release pod")?;
        spinner.done(&format!("Release pod {} is ready", pod_name(&pod)));

        let stop = CancellationToken::new();
        if self.portforwarding.unwrap_or(true) {
            self.start_port_forwarding(&client, &file.config, &stop).await;
        }

        let sessions = if self.sync.unwrap_or(true) {
            let engine = UploadSync::new(client.clone());
            start_sync(&client, &engine, &file.config.devspace.sync, &namespace, workdir)
                .await
                .context("Sync error")?
        } else {
            Vec::new()
        };
        if cancel.is_cancelled() {
            stop_sessions(sessions).await;
            stop.cancel();
            return Err(Error::Cancelled).context("Sync error");
        }
        for session in &sessions {
            ui::print_success(&format!(
                "Sync started on {} <-> {}",
                session.local_path.display(),
                session.container_path
            ));
        }

        let result = self.enter_terminal(&client, &pod).await;

        stop_sessions(sessions).await;
        stop.cancel();
        result
    }

    async fn start_port_forwarding(
        &self,
        client: &ClusterClient,
        config: &DevspaceConfig,
        stop: &CancellationToken,
    ) {
        let outcomes = start_port_forwarding(
            Arc::new(client.clone()),
            &config.devspace.port_forwarding,
            &config.devspace.release.namespace,
            PORT_FORWARD_READY_TIMEOUT,
            stop,
        )
        .await;

        for outcome in outcomes {
            match outcome.status {
                ForwardStatus::Started => {
                    ui::print_success(&format!("Port forwarding started on {}", outcome.ports));
                }
                ForwardStatus::TimedOut => {
                    ui::print_error("Timeout waiting for port forwarding to start");
                }
                ForwardStatus::Unsupported(_) => {
                    ui::print_warning("Currently only pod resource type is supported for portforwarding");
                }
                ForwardStatus::NoPod => {
                    debug!(ports = %outcome.ports, "No pod for port forwarding");
                }
                ForwardStatus::Failed(reason) => {
                    ui::print_error(&format!("Port forwarding on {} failed: {reason}", outcome.ports));
                }
            }
        }
    }

    async fn enter_terminal(&self, client: &ClusterClient, pod: &Pod) -> Result<()> {
        let container = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|c| c.name.clone())
            .context("Release pod has no containers")?;

        client
            .exec_interactive(pod, &container, &self.shell_command())
            .await
            .context("Unable to start terminal session")
    }
}

/// Cancel on the first Ctrl-C, exit on the second.
async fn watch_interrupts(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("Interrupted");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Interrupted twice, exiting");
        ui::print_warning("Interrupted twice, exiting");
        std::process::exit(INTERRUPTED_EXIT_CODE);
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

async fn init_registries(client: &ClusterClient, config: &DevspaceConfig, namespace: &str) -> Result<()> {
    for (name, registry) in &config.registries {
        let has_password = registry
            .auth
            .as_ref()
            .is_some_and(|auth| auth.password.is_some());
        if !has_password {
            continue;
        }

        let (username, password) = credentials(registry);
        let url = registry.url.clone().unwrap_or_default();
        let spinner = ui::Spinner::start(format!("Creating image pull secret for registry: {name}"));
        let secret = create_pull_secret(client, namespace, &url, &username, &password)
            .await
            .context("Failed to create pull secret for registry")?;
        spinner.done(&format!("Created image pull secret {secret}"));
    }
    Ok(())
}

async fn stop_sessions(sessions: Vec<SyncSession>) {
    for session in sessions {
        session.stop().await;
    }
}
