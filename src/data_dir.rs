use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "ASK_DATA_DIR";

const APP_PREFIX: &str = "ask";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
    config_home: PathBuf,
    cache_home: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The ASK_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/ask/)
    ///
    /// With an explicit root, settings and cache live inside it; otherwise
    /// they follow the XDG config and cache homes.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(DATA_DIR_ENV_VAR).map(PathBuf::from));

        let dir = match explicit {
            Some(root) => Self::at(root),
            None => {
                let xdg = xdg::BaseDirectories::with_prefix(APP_PREFIX);
                let missing = |what: &str| {
                    Error::Config(format!(
                        "could not determine XDG {what} home directory"
                    ))
                };
                Self {
                    root: xdg.get_data_home().ok_or_else(|| missing("data"))?,
                    config_home: xdg
                        .get_config_home()
                        .ok_or_else(|| missing("config"))?,
                    cache_home: xdg
                        .get_cache_home()
                        .ok_or_else(|| missing("cache"))?,
                }
            }
        };

        std::fs::create_dir_all(&dir.root)
            .map_err(|_| Error::DataDir(dir.root.clone()))?;

        Ok(dir)
    }

    /// Self-contained layout rooted at `root`.
    pub fn at(root: PathBuf) -> Self {
        Self {
            config_home: root.clone(),
            cache_home: root.join("cache"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_home.join("settings.toml")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_home
    }

    /// Directory of the embedded store, created on demand.
    pub fn store_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("store");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }

    /// Remove the data and cache directories. Settings are left alone.
    pub fn clean(&self) -> Result<()> {
        for dir in [&self.cache_home, &self.root] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => tracing::info!(path = %dir.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(dir.settings_file(), tmp.path().join("settings.toml"));
        assert_eq!(dir.cache_dir(), tmp.path().join("cache"));
    }

    #[test]
    fn store_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let store = dir.store_dir().unwrap();

        assert!(store.exists());
        assert_eq!(store, tmp.path().join("store"));
    }

    #[test]
    fn clean_removes_data_and_tolerates_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ask");
        let dir = DataDir::resolve(Some(&root)).unwrap();
        dir.store_dir().unwrap();

        dir.clean().unwrap();
        assert!(!root.exists());

        // Second run finds nothing to remove.
        dir.clean().unwrap();
    }
}
