//! Chart deployment.

pub mod helm;

use async_trait::async_trait;

use crate::error::Result;
use crate::release::ReleaseDescriptor;

pub use helm::HelmCli;

/// Installs or upgrades a chart release.
#[async_trait]
pub trait ChartDeployer: Send + Sync {
    /// Install or upgrade the release and return its new revision.
    async fn install_or_upgrade(&self, release: &ReleaseDescriptor) -> Result<i64>;
}
