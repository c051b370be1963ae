//! Tar archives of local directories.
//!
//! Used to ship a build context into a kaniko pod and to upload synced
//! files into a container.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Matches paths relative to a root against gitignore patterns.
///
/// Patterns follow `.gitignore` rules: a leading `/` or an inner slash
/// anchors a pattern to the root, a trailing `/` only matches directories,
/// `!` re-includes a path. A match on a directory also excludes everything
/// below it.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    ignore: Gitignore,
}

impl Default for ExcludeMatcher {
    fn default() -> Self {
        Self {
            ignore: Gitignore::empty(),
        }
    }
}

impl ExcludeMatcher {
    /// Compile a set of patterns rooted at `root`. Blank patterns are ignored.
    ///
    /// # Errors
    /// Returns a configuration error for a pattern that does not compile.
    pub fn new<S: AsRef<str>>(root: &Path, patterns: &[S]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns.iter().map(|p| p.as_ref().trim()) {
            if pattern.is_empty() {
                continue;
            }
            builder
                .add_line(None, pattern)
                .map_err(|e| Error::config(format!("invalid exclude pattern '{pattern}': {e}")))?;
        }
        let ignore = builder
            .build()
            .map_err(|e| Error::config(format!("invalid exclude patterns: {e}")))?;

        Ok(Self { ignore })
    }

    /// True if the path, relative to the root, or one of its parents is
    /// excluded.
    #[must_use]
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        if self.ignore.is_empty() || relative.as_os_str().is_empty() {
            return false;
        }
        self.ignore
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

/// Render a relative path with `/` separators.
pub(crate) fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// List regular files below `root` as paths relative to it.
///
/// Excluded directories are not descended into.
///
/// # Errors
/// Returns an I/O error if the root cannot be read.
pub fn collect_files(root: &Path, matcher: &ExcludeMatcher) -> Result<Vec<PathBuf>> {
    collect_files_in(root, Path::new(""), matcher)
}

/// Same as [`collect_files`], limited to the subdirectory `dir` of `root`.
///
/// Returned paths and exclude matching stay relative to `root`.
///
/// # Errors
/// Returns an I/O error if the directory cannot be read.
pub fn collect_files_in(root: &Path, dir: &Path, matcher: &ExcludeMatcher) -> Result<Vec<PathBuf>> {
    let start = if dir.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(dir)
    };

    let mut files = Vec::new();
    let walker = WalkDir::new(&start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || entry.path().strip_prefix(root).map_or(true, |rel| {
                    !matcher.is_excluded(rel, entry.file_type().is_dir())
                })
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            Error::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop detected")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }

    debug!(root = %start.display(), count = files.len(), "Collected files");
    Ok(files)
}

/// Pack files (relative to `root`) plus in-memory entries into a tar archive.
///
/// # Errors
/// Returns an I/O error if a file cannot be read.
pub fn pack(root: &Path, files: &[PathBuf], extras: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);

    for file in files {
        builder.append_path_with_name(root.join(file), to_slash(file))?;
    }

    for (name, data) in extras {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_slice())?;
    }

    Ok(builder.into_inner()?)
}
