//! Working-directory scaffolding.
//!
//! Everything KuiX touches on disk lives under `<root>/kuiX/`: log files in
//! `Logs/`, user strategy code in `Strategies/`, user component code in
//! `Components/`. The latter two are conventions for user code; the core
//! never reads them.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    /// Create the directory tree under `root`, idempotently.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref().join("kuiX");
        for dir in [&root, &root.join("Logs"), &root.join("Strategies"), &root.join("Components")] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Setup {
                path: dir.clone(),
                source,
            })?;
        }
        debug!(root = %root.display(), "working directories ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("Logs")
    }

    pub fn strategies_dir(&self) -> PathBuf {
        self.root.join("Strategies")
    }

    pub fn components_dir(&self) -> PathBuf {
        self.root.join("Components")
    }

    /// Path for a log file named `<route>_<level>.log`.
    pub fn log_file(&self, route: &str, level: &str) -> PathBuf {
        self.logs_dir().join(format!("{route}_{level}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_the_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(dir.path()).unwrap();

        assert!(workdir.logs_dir().is_dir());
        assert!(workdir.strategies_dir().is_dir());
        assert!(workdir.components_dir().is_dir());
        assert!(workdir.root().ends_with("kuiX"));
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = Workdir::create(dir.path()).unwrap();
        let second = Workdir::create(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn log_file_naming() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::create(dir.path()).unwrap();
        assert!(workdir
            .log_file("core", "error")
            .ends_with("kuiX/Logs/core_error.log"));
    }
}
