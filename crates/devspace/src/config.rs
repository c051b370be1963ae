//! Project configuration types and persistence.
//!
//! The configuration lives in `.devspace/config.yaml` inside the project.
//! Besides user settings it carries state written back by `up`: the last
//! image tag and the Dockerfile timestamp of the last build.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Directory holding the project configuration.
pub const CONFIG_DIR: &str = ".devspace";

/// Configuration file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.yaml";

/// Default chart location relative to the workdir.
pub const DEFAULT_CHART_PATH: &str = "chart/";

/// Default Dockerfile location relative to the workdir.
pub const DEFAULT_DOCKERFILE_PATH: &str = "./Dockerfile";

/// Default build context relative to the workdir.
pub const DEFAULT_CONTEXT_PATH: &str = "./";

/// Full project configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevspaceConfig {
    /// Config schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Release, sync and port forwarding settings.
    pub devspace: DevspaceSection,
    /// Images to build, keyed by the name used in chart values.
    #[serde(default)]
    pub images: BTreeMap<String, ImageConfig>,
    /// Registries images are pushed to.
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryConfig>,
    /// Cluster credentials written by `devspace init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,
}

/// The `devspace` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevspaceSection {
    /// Helm release to deploy.
    pub release: ReleaseConfig,
    /// Chart directory, defaults to [`DEFAULT_CHART_PATH`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_path: Option<String>,
    /// Paths to keep in sync with pods.
    #[serde(default)]
    pub sync: Vec<SyncPathConfig>,
    /// Port tunnels to open.
    #[serde(default)]
    pub port_forwarding: Vec<PortForwardingConfig>,
}

impl DevspaceSection {
    /// Chart directory to deploy.
    #[must_use]
    pub fn chart_path(&self) -> &str {
        self.chart_path.as_deref().unwrap_or(DEFAULT_CHART_PATH)
    }
}

/// Release identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseConfig {
    /// Release name, also used as the `release=` pod label.
    pub name: String,
    /// Namespace the release is installed into.
    pub namespace: String,
}

/// An image and its build state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Image repository name (without registry and tag).
    pub name: String,
    /// Tag of the last pushed build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Key into the `registries` map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Build settings and state.
    #[serde(default)]
    pub build: BuildConfig,
}

/// Build settings of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    /// Dockerfile path relative to the workdir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    /// Build context relative to the workdir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_path: Option<String>,
    /// Dockerfile modification time seen on the last run (RFC 3339, nanoseconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<String>,
    /// Engine selection.
    #[serde(default)]
    pub engine: BuildEngineConfig,
    /// Extra build options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BuildOptionsConfig>,
}

impl BuildConfig {
    /// Dockerfile path as configured, or the default.
    #[must_use]
    pub fn dockerfile_path(&self) -> &str {
        self.dockerfile_path
            .as_deref()
            .unwrap_or(DEFAULT_DOCKERFILE_PATH)
    }

    /// Context path as configured, or the default.
    #[must_use]
    pub fn context_path(&self) -> &str {
        self.context_path.as_deref().unwrap_or(DEFAULT_CONTEXT_PATH)
    }
}

/// Engine selector. Kaniko wins when both are set; docker is the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEngineConfig {
    /// Build with the local docker daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerEngineConfig>,
    /// Build in-cluster with kaniko.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kaniko: Option<KanikoEngineConfig>,
}

/// Docker engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerEngineConfig {
    /// Use the minikube docker daemon when the current context is minikube.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_minikube: Option<bool>,
}

/// Kaniko engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanikoEngineConfig {
    /// Namespace for build pods, defaults to the release namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Extra build options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptionsConfig {
    /// `--build-arg` values.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

/// A container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry host, e.g. `registry.example.com` or `hub.docker.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegistryAuth>,
    /// Allow plain HTTP / unverified TLS pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

/// Registry credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Cluster credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// API server URL.
    pub api_server: String,
    /// CA certificate (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// Client identity.
    pub user: ClusterUser,
}

/// Client identity used to talk to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUser {
    pub username: String,
    /// Client certificate (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    /// Client key (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

/// A local path kept in sync with a container path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPathConfig {
    pub local_sub_path: String,
    pub container_path: String,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_exclude_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_exclude_paths: Vec<String>,
}

/// Port tunnels to one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardingConfig {
    /// Only `pod` is supported.
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

fn default_resource_type() -> String {
    "pod".to_string()
}

/// A `local:remote` port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}

/// Render a label map as a selector string (`a=b, c=d`).
#[must_use]
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pick the override namespace if set and non-empty, else the default.
#[must_use]
pub fn namespace_or<'a>(namespace: Option<&'a String>, default: &'a str) -> &'a str {
    match namespace {
        Some(ns) if !ns.is_empty() => ns,
        _ => default,
    }
}

/// A configuration bound to the file it was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    /// The loaded configuration.
    pub config: DevspaceConfig,
}

impl ConfigFile {
    /// Path of the config file for a workdir.
    #[must_use]
    pub fn path_for(workdir: &Path) -> PathBuf {
        workdir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Wrap an in-memory configuration that will be saved to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: DevspaceConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Load the configuration of a workdir.
    ///
    /// # Errors
    /// Returns a configuration error if the file is missing, or a YAML error
    /// if it cannot be parsed.
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = Self::path_for(workdir);
        if !path.exists() {
            return Err(Error::config(format!(
                "{} not found, did you run devspace init?",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(&path)?;
        let config: DevspaceConfig = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), images = config.images.len(), "Loaded config");

        Ok(Self { path, config })
    }

    /// File this configuration is saved to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the configuration back to disk.
    ///
    /// The new content goes to a temporary file next to the config which is
    /// then renamed over it, so an interrupted save leaves the old file intact.
    ///
    /// # Errors
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&dir)?;

        let content = serde_yaml::to_string(&self.config)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        debug!(path = %self.path.display(), "Saved config");
        Ok(())
    }
}
