use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;

use crate::error::{Error, Result};

/// A discovered document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the repository root.
    pub relative_path: PathBuf,
}

/// Find the working directory of the git repository containing `start`.
///
/// Walks up the ancestors of `start` until one holds a `.git` entry
/// (directory or worktree file).
pub fn working_path(start: &Path) -> Result<PathBuf> {
    let start = start.canonicalize()?;
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
        .ok_or(Error::NotInRepository(start))
}

/// Render a repository-relative path with `/` separators.
pub fn relative_source(relative_path: &Path) -> String {
    relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))
}

/// List files under `root` whose relative path matches `pattern`.
///
/// Respects `.gitignore`, `.git/info/exclude` and the global git excludes
/// even outside a git checkout. Hidden files are considered; the `.git`
/// directory itself never is. Results are sorted by relative path.
pub fn discover_files(root: &Path, pattern: &str) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let matcher = compile_glob(pattern)?;

    let walker = WalkBuilder::new(&canonical_root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(true)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    let mut results = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::Config(e.to_string()))?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let Ok(relative_path) = entry.path().strip_prefix(&canonical_root)
        else {
            continue;
        };

        if matcher.is_match(relative_path) {
            results.push(DiscoveredFile {
                relative_path: relative_path.to_path_buf(),
            });
        }
    }

    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    tracing::debug!(
        root = %canonical_root.display(),
        pattern,
        count = results.len(),
        "discovered files"
    );
    Ok(results)
}
