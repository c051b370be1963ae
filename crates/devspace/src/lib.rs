//! devspace orchestration engine.
//!
//! Brings up a disposable development environment in Kubernetes: rebuilds
//! images whose Dockerfile changed, deploys the project's Helm chart, waits
//! for the release pod of the new revision, then opens port tunnels, file
//! sync and a terminal session into it.
//!
//! # Example
//!
//! ```ignore
//! use devspace::{ClusterClient, ConfigFile};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let file = ConfigFile::load(std::path::Path::new("."))?;
//!     let client = ClusterClient::connect(file.config.cluster.as_ref()).await?;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod archive;
pub mod build;
pub mod commands;
pub mod config;
pub mod deploy;
pub mod error;
pub mod forward;
pub mod kubectl;
pub mod logging;
pub mod registry;
pub mod release;
pub mod sync;
pub mod ui;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use config::{ConfigFile, DevspaceConfig};
pub use error::{Error, Result};
pub use kubectl::{Cluster, ClusterClient, ExecSession, PortTunnel};
pub use release::{ReleaseCoordinator, ReleaseDescriptor};
