//! Rebuild decision.
//!
//! An image is rebuilt when its Dockerfile's modification time differs from
//! the one recorded on the previous run, or when a build was explicitly
//! requested.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::config::BuildConfig;
use crate::error::{Error, Result};

/// Format a file time the way it is stored in the config.
#[must_use]
pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Exact comparison of two stored timestamps. Unparseable values never match.
fn same_instant(stored: &str, current: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(stored),
        DateTime::parse_from_rfc3339(current),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Decide whether an image must be rebuilt.
///
/// Records the Dockerfile's current modification time in `build` whether or
/// not a rebuild is needed. `force` is true only when the user explicitly
/// asked for a build.
///
/// # Errors
/// Returns a configuration error if the Dockerfile is missing and the image
/// has never been built.
pub fn should_rebuild(build: &mut BuildConfig, dockerfile: &Path, force: bool) -> Result<bool> {
    let modified = match std::fs::metadata(dockerfile).and_then(|meta| meta.modified()) {
        Ok(modified) => format_timestamp(modified),
        Err(e) => {
            if build.latest_timestamp.is_none() {
                return Err(Error::config(format!(
                    "Dockerfile missing at {}: {e}",
                    dockerfile.display()
                )));
            }
            debug!(
                dockerfile = %dockerfile.display(),
                "Dockerfile missing, reusing previously built image"
            );
            return Ok(false);
        }
    };

    let rebuild = match build.latest_timestamp.as_deref() {
        Some(latest) if !force => !same_instant(latest, &modified),
        _ => true,
    };

    debug!(
        dockerfile = %dockerfile.display(),
        previous = ?build.latest_timestamp,
        current = %modified,
        force,
        rebuild,
        "Rebuild decision"
    );
    build.latest_timestamp = Some(modified);

    Ok(rebuild)
}
