//! Log setup.
//!
//! Console output follows `--verbose`. Besides that, every run appends to
//! log files under `.devspace/logs`: `default.log` receives everything the
//! crate logs, `portforwarding.log` only the tunnel components.

use std::path::Path;

use tracing::{warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::error::Result;

/// Log directory, relative to the project directory.
pub const LOG_DIR: &str = ".devspace/logs";

pub const DEFAULT_LOG: &str = "default.log";

pub const PORT_FORWARDING_LOG: &str = "portforwarding.log";

/// Modules whose events go to the port forwarding log.
const PORT_FORWARDING_TARGETS: [&str; 2] = ["devspace::forward", "devspace::kubectl::portforward"];

pub type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writers alive; buffered lines are flushed on drop.
#[must_use = "dropping the guards stops file logging"]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

fn console_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("info,devspace=debug")
    } else {
        EnvFilter::new("warn,devspace=info")
    }
}

fn file_targets(log: &str) -> Targets {
    if log == PORT_FORWARDING_LOG {
        PORT_FORWARDING_TARGETS
            .iter()
            .fold(Targets::new(), |targets, target| targets.with_target(*target, Level::DEBUG))
    } else {
        Targets::new().with_target("devspace", Level::DEBUG)
    }
}

/// One non-blocking file layer per log file in `log_dir`.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn file_layers(log_dir: &Path) -> Result<(Vec<BoxedLayer>, Vec<WorkerGuard>)> {
    std::fs::create_dir_all(log_dir)?;

    let mut layers = Vec::new();
    let mut guards = Vec::new();
    for log in [DEFAULT_LOG, PORT_FORWARDING_LOG] {
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, log));
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_targets(log))
                .boxed(),
        );
        guards.push(guard);
    }
    Ok((layers, guards))
}

/// Install the global subscriber.
///
/// Falls back to console-only logging when the log directory is not
/// writable.
pub fn init(workdir: &Path, verbose: bool) -> LogGuards {
    let log_dir = workdir.join(LOG_DIR);
    let (files, guards, failure) = match file_layers(&log_dir) {
        Ok((layers, guards)) => (layers, guards, None),
        Err(e) => (Vec::new(), Vec::new(), Some(e)),
    };

    let console = fmt::layer()
        .with_target(false)
        .with_filter(console_filter(verbose));

    tracing_subscriber::registry().with(files).with(console).init();

    if let Some(e) = failure {
        warn!(dir = %log_dir.display(), error = %e, "File logging disabled");
    }
    LogGuards { _guards: guards }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_forwarding_events_get_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join(LOG_DIR);
        let (layers, guards) = file_layers(&log_dir).unwrap();

        let subscriber = tracing_subscriber::registry().with(layers);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "devspace::forward", "tunnel on 8080:80 started");
            tracing::debug!(target: "devspace::kubectl::portforward", "accepted connection");
            tracing::info!(target: "devspace::sync", "uploaded 3 files");
            tracing::info!(target: "hyper::client", "connection reused");
        });
        drop(guards);

        let forwarding = std::fs::read_to_string(log_dir.join(PORT_FORWARDING_LOG)).unwrap();
        assert!(forwarding.contains("tunnel on 8080:80 started"));
        assert!(forwarding.contains("accepted connection"));
        assert!(!forwarding.contains("uploaded 3 files"));

        let default = std::fs::read_to_string(log_dir.join(DEFAULT_LOG)).unwrap();
        assert!(default.contains("tunnel on 8080:80 started"));
        assert!(default.contains("uploaded 3 files"));
        assert!(!default.contains("connection reused"));
    }

    #[test]
    fn test_unwritable_log_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "not a directory").unwrap();

        assert!(file_layers(&blocker).is_err());
    }
}
