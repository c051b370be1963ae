//! Error type shared by the orchestration engine.

use thiserror::Error;

/// Errors that can occur while bringing up a devspace.
#[derive(Error, Debug)]
pub enum Error {
    /// The project or cluster configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A Kubernetes API call failed.
    #[error("Kubernetes API error: {0}")]
    Cluster(#[from] kube::Error),

    /// The cluster credentials could not be turned into a client config.
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// A bounded wait expired.
    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    /// A remote exec or port-forward transport failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The remote command ran but exited with a non-zero code.
    #[error("Remote command exited with code {code}")]
    NonZeroExit { code: i32 },

    /// Building or pushing an image failed.
    #[error("Build error: {0}")]
    Build(String),

    /// Deploying the chart failed.
    #[error("Deploy error: {0}")]
    Deploy(String),

    /// Starting or running a sync session failed.
    #[error("Sync error: {0}")]
    Sync(String),

    /// The operation was interrupted by the user.
    #[error("Operation cancelled")]
    Cancelled,

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns true if this is a Kubernetes API error with the given HTTP status.
    #[must_use]
    pub fn is_api_status(&self, code: u16) -> bool {
        matches!(self, Self::Cluster(kube::Error::Api(ae)) if ae.code == code)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
