//! Image builds.
//!
//! A build engine turns a build context into a pushed image. Engines are
//! interchangeable behind [`ImageBuilder`] and selected per image through
//! [`BuildEngine`].

pub mod decision;
pub mod dispatcher;
pub mod docker;
pub mod kaniko;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::BuildEngineConfig;
use crate::error::Result;
use crate::kubectl::ClusterClient;

pub use decision::should_rebuild;
pub use dispatcher::BuildDispatcher;

/// Registry host that means "Docker Hub", which takes no image prefix.
pub const DOCKER_HUB: &str = "hub.docker.com";

/// Options passed through to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// `--build-arg` values.
    pub build_args: BTreeMap<String, String>,
}

/// The image an engine produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTarget {
    /// Registry host, empty for Docker Hub.
    pub registry_url: String,
    /// Repository name.
    pub image_name: String,
    /// Tag to produce.
    pub tag: String,
    /// Allow insecure pushes.
    pub insecure: bool,
}

impl ImageTarget {
    /// Full image reference, `registry/name:tag`.
    #[must_use]
    pub fn reference(&self) -> String {
        if self.registry_url.is_empty() {
            format!("{}:{}", self.image_name, self.tag)
        } else {
            format!("{}/{}:{}", self.registry_url, self.image_name, self.tag)
        }
    }

    /// Registry used for authentication, Docker Hub when empty.
    #[must_use]
    pub fn auth_registry(&self) -> &str {
        if self.registry_url.is_empty() {
            "https://index.docker.io/v1/"
        } else {
            &self.registry_url
        }
    }
}

/// Build engine contract.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Log in to the target registry and return the auth token used.
    ///
    /// With `anonymous` set and no username, no login is attempted.
    async fn authenticate(&mut self, username: &str, password: &str, anonymous: bool) -> Result<String>;

    /// Build the image from a context directory and Dockerfile.
    async fn build_image(&mut self, context: &Path, dockerfile: &Path, options: &BuildOptions) -> Result<()>;

    /// Push the built image.
    async fn push_image(&mut self) -> Result<()>;
}

/// Engine selected for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEngine {
    /// Local docker daemon.
    Docker {
        /// Use the minikube daemon when the current context is minikube.
        prefer_minikube: bool,
    },
    /// In-cluster kaniko pod.
    Kaniko {
        /// Namespace to run the build pod in.
        namespace: String,
    },
}

impl BuildEngine {
    /// Resolve the engine from configuration. Kaniko wins when configured.
    #[must_use]
    pub fn from_config(engine: &BuildEngineConfig, release_namespace: &str) -> Self {
        if let Some(kaniko) = &engine.kaniko {
            return Self::Kaniko {
                namespace: kaniko
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| release_namespace.to_string()),
            };
        }

        Self::Docker {
            prefer_minikube: engine
                .docker
                .as_ref()
                .and_then(|d| d.prefer_minikube)
                .unwrap_or(true),
        }
    }

    /// Engine name for log output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker { .. } => "docker",
            Self::Kaniko { .. } => "kaniko",
        }
    }
}

/// Creates builders for an engine and target.
pub trait BuilderFactory: Send + Sync {
    /// Create a builder.
    ///
    /// # Errors
    /// Returns an error if the engine is unavailable.
    fn create(&self, engine: &BuildEngine, target: ImageTarget) -> Result<Box<dyn ImageBuilder>>;
}

/// Factory for the engines shipped with devspace.
pub struct EngineFactory {
    client: ClusterClient,
    cancel: CancellationToken,
}

impl EngineFactory {
    /// In-cluster builds stop when `cancel` fires.
    #[must_use]
    pub fn new(client: ClusterClient, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }
}

impl BuilderFactory for EngineFactory {
    fn create(&self, engine: &BuildEngine, target: ImageTarget) -> Result<Box<dyn ImageBuilder>> {
        match engine {
            BuildEngine::Docker { prefer_minikube } => Ok(Box::new(docker::DockerBuilder::new(
                target,
                *prefer_minikube,
            )?)),
            BuildEngine::Kaniko { namespace } => Ok(Box::new(kaniko::KanikoBuilder::new(
                self.client.clone(),
                target,
                namespace.clone(),
                self.cancel.clone(),
            ))),
        }
    }
}
