//! File synchronization into pods.
//!
//! [`start_sync`] resolves the pod for every configured sync path and hands
//! it to a [`SyncEngine`]. The shipped engine, [`UploadSync`], uploads the
//! local tree once and then follows filesystem notifications: changed files
//! are uploaded again and deleted paths are removed in the container.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{self, ExcludeMatcher};
use crate::config::{label_selector, namespace_or, SyncPathConfig};
use crate::error::{Error, Result};
use crate::kubectl::{Cluster, ClusterClient};

/// Quiet period that folds a burst of filesystem events into one change set.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

const EVENT_BUFFER: usize = 256;

/// A resolved sync path.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub pod: Pod,
    pub container: String,
    pub local_path: PathBuf,
    pub container_path: String,
    pub exclude_paths: Vec<String>,
    pub upload_exclude_paths: Vec<String>,
    pub download_exclude_paths: Vec<String>,
}

/// A running sync session.
pub struct SyncSession {
    pub local_path: PathBuf,
    pub container_path: String,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncSession {
    /// Wrap a background task that runs until `stop` is cancelled.
    #[must_use]
    pub fn new(
        local_path: PathBuf,
        container_path: String,
        stop: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            local_path,
            container_path,
            stop,
            task,
        }
    }

    /// Stop the session and wait for its task to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
        debug!(local = %self.local_path.display(), "Sync stopped");
    }
}

/// Starts sync sessions.
#[async_trait]
pub trait SyncEngine: Send + Sync {
    /// Start syncing a target.
    async fn start(&self, target: SyncTarget) -> Result<SyncSession>;
}

/// Local changes to apply in a container, relative to the sync root.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub upload: BTreeSet<PathBuf>,
    pub remove: BTreeSet<PathBuf>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upload.is_empty() && self.remove.is_empty()
    }

    /// Classify touched paths by what is on disk now.
    ///
    /// Files are uploaded, a directory contributes every file below it and
    /// a path that no longer exists is removed. Excluded paths and paths
    /// outside `root` are dropped.
    pub fn from_paths<I>(root: &Path, matcher: &ExcludeMatcher, paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut changes = Self::default();

        for path in paths {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }
            let relative = relative.to_path_buf();

            match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    if matcher.is_excluded(&relative, true) {
                        continue;
                    }
                    match archive::collect_files_in(root, &relative, matcher) {
                        Ok(files) => changes.upload.extend(files),
                        Err(e) => debug!(path = %path.display(), error = %e, "Directory changed while scanning"),
                    }
                }
                Ok(meta) if meta.is_file() => {
                    if !matcher.is_excluded(&relative, false) {
                        changes.upload.insert(relative);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if !matcher.is_excluded(&relative, false) && !matcher.is_excluded(&relative, true) {
                        changes.remove.insert(relative);
                    }
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable path"),
            }
        }

        changes
    }
}

/// Watches a directory tree and yields debounced change sets.
pub struct ChangeWatcher {
    root: PathBuf,
    matcher: ExcludeMatcher,
    events: mpsc::Receiver<Event>,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    /// Start watching `root` recursively.
    ///
    /// # Errors
    /// Returns a sync error if the platform watcher cannot be set up.
    pub fn new(root: &Path, matcher: ExcludeMatcher) -> Result<Self> {
        let root = root.canonicalize()?;
        let (tx, events) = mpsc::channel(EVENT_BUFFER);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })
        .map_err(|e| Error::Sync(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Sync(format!("failed to watch {}: {e}", root.display())))?;

        Ok(Self {
            root,
            matcher,
            events,
            _watcher: watcher,
        })
    }

    /// Wait for the next non-empty change set.
    ///
    /// Events arriving within [`DEBOUNCE`] of the first one are folded into
    /// the same set. Returns `None` once the watcher has shut down.
    pub async fn next(&mut self) -> Option<ChangeSet> {
        loop {
            let first = self.events.recv().await?;
            let mut paths = Vec::new();
            touched_paths(first, &mut paths);

            tokio::time::sleep(DEBOUNCE).await;
            while let Ok(event) = self.events.try_recv() {
                touched_paths(event, &mut paths);
            }

            let changes = ChangeSet::from_paths(&self.root, &self.matcher, paths);
            if !changes.is_empty() {
                return Some(changes);
            }
        }
    }
}

fn touched_paths(event: Event, paths: &mut Vec<PathBuf>) {
    if matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        paths.extend(event.paths);
    }
}

/// Upload-only sync over exec and tar.
///
/// Download exclude patterns are accepted for config compatibility but
/// there is no download direction.
pub struct UploadSync {
    client: ClusterClient,
}

impl UploadSync {
    #[must_use]
    pub fn new(client: ClusterClient) -> Self {
        Self { client }
    }
}

/// Shell-quote a path for `sh -c`.
fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

async fn upload(
    client: &ClusterClient,
    target: &SyncTarget,
    root: &Path,
    files: &[PathBuf],
) -> Result<()> {
    let archive = archive::pack(root, files, &[])?;
    let dest = quote(&target.container_path);
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("mkdir -p {dest} && tar -xf - -C {dest}"),
    ];
    client
        .exec_buffered(&target.pod, &target.container, &command, Some(archive))
        .await
        .map_err(|e| Error::Sync(format!("upload to {} failed: {e}", target.pod.name_any())))?;
    debug!(files = files.len(), dest = %target.container_path, "Uploaded files");
    Ok(())
}

/// Shell command removing `paths` below the container path.
fn remove_command(container_path: &str, paths: &BTreeSet<PathBuf>) -> Vec<String> {
    let quoted: Vec<String> = paths
        .iter()
        .map(|path| quote(&archive::to_slash(path)))
        .collect();
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("cd {} && rm -rf -- {}", quote(container_path), quoted.join(" ")),
    ]
}

async fn remove(client: &ClusterClient, target: &SyncTarget, paths: &BTreeSet<PathBuf>) -> Result<()> {
    let command = remove_command(&target.container_path, paths);
    client
        .exec_buffered(&target.pod, &target.container, &command, None)
        .await
        .map_err(|e| Error::Sync(format!("remove in {} failed: {e}", target.pod.name_any())))?;
    debug!(paths = paths.len(), dest = %target.container_path, "Removed paths");
    Ok(())
}

async fn apply(client: &ClusterClient, target: &SyncTarget, root: &Path, changes: ChangeSet) {
    if !changes.remove.is_empty() {
        if let Err(e) = remove(client, target, &changes.remove).await {
            warn!(error = %e, "Sync remove failed");
        }
    }

    // Files can vanish between the event and the upload.
    let files: Vec<PathBuf> = changes
        .upload
        .into_iter()
        .filter(|file| root.join(file).is_file())
        .collect();
    if files.is_empty() {
        return;
    }
    if let Err(e) = upload(client, target, root, &files).await {
        warn!(error = %e, "Sync upload failed");
    }
}

#[async_trait]
impl SyncEngine for UploadSync {
    async fn start(&self, target: SyncTarget) -> Result<SyncSession> {
        if !target.local_path.is_dir() {
            return Err(Error::Sync(format!(
                "{} is not a directory",
                target.local_path.display()
            )));
        }
        if !target.download_exclude_paths.is_empty() {
            debug!(
                patterns = ?target.download_exclude_paths,
                "Download exclude paths have no effect on upload sync"
            );
        }

        let root = target.local_path.canonicalize()?;
        let patterns: Vec<&String> = target
            .exclude_paths
            .iter()
            .chain(&target.upload_exclude_paths)
            .collect();
        let matcher = ExcludeMatcher::new(&root, &patterns)?;

        // Watch before the initial upload so no change falls in between.
        let mut watcher = ChangeWatcher::new(&root, matcher.clone())?;
        let files = archive::collect_files(&root, &matcher)?;
        upload(&self.client, &target, &root, &files).await?;

        let stop = CancellationToken::new();
        let token = stop.clone();
        let client = self.client.clone();
        let local_path = target.local_path.clone();
        let container_path = target.container_path.clone();

        let task = tokio::spawn(async move {
            loop {
                let changes = tokio::select! {
                    () = token.cancelled() => break,
                    changes = watcher.next() => match changes {
                        Some(changes) => changes,
                        None => {
                            warn!(local = %root.display(), "File watcher stopped");
                            break;
                        }
                    },
                };

                debug!(
                    upload = changes.upload.len(),
                    remove = changes.remove.len(),
                    "Applying local changes"
                );
                apply(&client, &target, &root, changes).await;
            }
        });

        Ok(SyncSession::new(local_path, container_path, stop, Some(task)))
    }
}

/// Start a sync session for every configured path that has a running pod.
///
/// Paths whose selector matches no running pod are skipped with a warning.
///
/// # Errors
/// Returns pod listing errors and the first session that fails to start.
pub async fn start_sync(
    cluster: &dyn Cluster,
    engine: &dyn SyncEngine,
    paths: &[SyncPathConfig],
    default_namespace: &str,
    workdir: &Path,
) -> Result<Vec<SyncSession>> {
    let mut sessions = Vec::with_capacity(paths.len());

    for path in paths {
        let local_path = workdir.join(&path.local_sub_path);
        let namespace = namespace_or(path.namespace.as_ref(), default_namespace);
        let selector = label_selector(&path.label_selector);

        let Some(pod) = cluster.first_running_pod(&selector, namespace).await? else {
            warn!(%selector, namespace, "No running pod to sync with");
            continue;
        };
        let Some(container) = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .map(|c| c.name.clone())
        else {
            warn!(pod = %pod.name_any(), "Pod has no containers, skipping sync");
            continue;
        };

        let session = engine
            .start(SyncTarget {
                pod,
                container,
                local_path: local_path.clone(),
                container_path: path.container_path.clone(),
                exclude_paths: path.exclude_paths.clone(),
                upload_exclude_paths: path.upload_exclude_paths.clone(),
                download_exclude_paths: path.download_exclude_paths.clone(),
            })
            .await?;

        info!(
            local = %local_path.display(),
            container = %path.container_path,
            "Sync started"
        );
        sessions.push(session);
    }

    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{running_pod, FakeCluster};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        targets: Mutex<Vec<SyncTarget>>,
        fail: bool,
    }

    #[async_trait]
    impl SyncEngine for RecordingEngine {
        async fn start(&self, target: SyncTarget) -> Result<SyncSession> {
            if self.fail {
                return Err(Error::Sync("cannot start".to_string()));
            }
            let session = SyncSession::new(
                target.local_path.clone(),
                target.container_path.clone(),
                CancellationToken::new(),
                None,
            );
            self.targets.lock().unwrap().push(target);
            Ok(session)
        }
    }

    fn sync_path(namespace: Option<&str>) -> SyncPathConfig {
        SyncPathConfig {
            local_sub_path: "./src".to_string(),
            container_path: "/app/src".to_string(),
            label_selector: BTreeMap::from([("release".to_string(), "my-app".to_string())]),
            namespace: namespace.map(ToString::to_string),
            exclude_paths: vec!["node_modules/".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sessions_started_for_running_pods() {
        let cluster = FakeCluster::new(vec![vec![running_pod("web", "dev", None)]]);
        let engine = RecordingEngine::default();

        let sessions = start_sync(
            &cluster,
            &engine,
            &[sync_path(None), sync_path(Some("other"))],
            "dev",
            Path::new("/project"),
        )
        .await
        .unwrap();

        assert_eq!(sessions.len(), 2);
        let targets = engine.targets.lock().unwrap();
        assert_eq!(targets[0].container, "main");
        assert_eq!(targets[0].local_path, Path::new("/project/./src"));
        assert_eq!(targets[0].container_path, "/app/src");
        assert_eq!(targets[0].exclude_paths, vec!["node_modules/".to_string()]);
        drop(targets);

        for session in sessions {
            session.stop().await;
        }
    }

    #[tokio::test]
    async fn test_missing_pod_is_skipped() {
        let cluster = FakeCluster::new(vec![vec![]]);
        let engine = RecordingEngine::default();

        let sessions = start_sync(&cluster, &engine, &[sync_path(None)], "dev", Path::new("."))
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_engine_failure_is_fatal() {
        let cluster = FakeCluster::new(vec![vec![running_pod("web", "dev", None)]]);
        let engine = RecordingEngine {
            fail: true,
            ..Default::default()
        };

        let err = start_sync(&cluster, &engine, &[sync_path(None)], "dev", Path::new("."))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Sync(_)));
    }

    #[tokio::test]
    async fn test_stop_waits_for_task() {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move { token.cancelled().await });
        let session = SyncSession::new(PathBuf::from("src"), "/app".to_string(), stop, Some(task));

        session.stop().await;
    }

    #[test]
    fn test_change_set_follows_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("lib/cache")).unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::write(root.join("lib/one.rs"), "1").unwrap();
        std::fs::write(root.join("lib/cache/blob"), "x").unwrap();
        std::fs::write(root.join("debug.log"), "log").unwrap();
        let matcher = ExcludeMatcher::new(root, &["*.log", "cache/"]).unwrap();

        let changes = ChangeSet::from_paths(
            root,
            &matcher,
            [
                root.join("a.txt"),
                root.join("lib"),
                root.join("debug.log"),
                root.join("gone.txt"),
                root.join("old.log"),
                PathBuf::from("/elsewhere/file"),
            ],
        );

        assert_eq!(
            changes.upload,
            BTreeSet::from([PathBuf::from("a.txt"), PathBuf::from("lib/one.rs")])
        );
        assert_eq!(changes.remove, BTreeSet::from([PathBuf::from("gone.txt")]));
    }

    async fn next_matching(
        watcher: &mut ChangeWatcher,
        wanted: impl Fn(&ChangeSet) -> bool,
    ) -> ChangeSet {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let changes = watcher.next().await.unwrap();
                if wanted(&changes) {
                    return changes;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_watcher_reports_old_mtimes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let matcher = ExcludeMatcher::new(&root, &["*.tmp"]).unwrap();
        let mut watcher = ChangeWatcher::new(&root, matcher).unwrap();

        // A copy that keeps an old modification time is still a change.
        let copied = root.join("copied.txt");
        std::fs::write(&copied, "restored").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&copied)
            .unwrap()
            .set_modified(std::time::UNIX_EPOCH + Duration::from_secs(86_400))
            .unwrap();
        std::fs::write(root.join("scratch.tmp"), "x").unwrap();

        let changes = next_matching(&mut watcher, |c| c.upload.contains(Path::new("copied.txt"))).await;
        assert!(!changes.upload.contains(Path::new("scratch.tmp")));

        std::fs::remove_file(&copied).unwrap();
        let changes = next_matching(&mut watcher, |c| c.remove.contains(Path::new("copied.txt"))).await;
        assert!(!changes.upload.contains(Path::new("copied.txt")));
    }

    #[test]
    fn test_remove_command() {
        let paths = BTreeSet::from([PathBuf::from("src/old.rs"), PathBuf::from("it's")]);
        assert_eq!(
            remove_command("/app", &paths),
            vec!["sh", "-c", r"cd '/app' && rm -rf -- 'it'\''s' 'src/old.rs'"]
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/app/src"), "'/app/src'");
        assert_eq!(quote("/it's"), r"'/it'\''s'");
    }
}
