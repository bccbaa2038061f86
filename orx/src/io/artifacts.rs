//! Run-scoped artifacts with a fixed key → file mapping.
//!
//! Reads are lazy and cached; writes go to disk first (atomically) and then
//! refresh the cache, so the store never holds content the disk does not.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

use crate::io::paths::RunPaths;
use crate::io::run_state::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKey {
    Task,
    Plan,
    Spec,
    Backlog,
    PatchDiff,
    Review,
    PrBody,
    Knowledge,
    Evidence,
}

impl ArtifactKey {
    /// Location relative to the run directory.
    pub fn relative_path(self) -> &'static str {
        match self {
            ArtifactKey::Task => "context/task.md",
            ArtifactKey::Plan => "context/plan.md",
            ArtifactKey::Spec => "context/spec.md",
            ArtifactKey::Backlog => "context/backlog.yaml",
            ArtifactKey::PatchDiff => "artifacts/patch.diff",
            ArtifactKey::Review => "artifacts/review.md",
            ArtifactKey::PrBody => "artifacts/pr_body.md",
            ArtifactKey::Knowledge => "artifacts/knowledge.md",
            ArtifactKey::Evidence => "artifacts/evidence.json",
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative_path())
    }
}

/// Thread-safe artifact access for one run.
#[derive(Debug)]
pub struct ArtifactStore {
    run_dir: PathBuf,
    cache: Mutex<HashMap<ArtifactKey, String>>,
}

impl ArtifactStore {
    pub fn new(paths: &RunPaths) -> Self {
        Self::at(&paths.run_dir)
    }

    pub fn at(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self, key: ArtifactKey) -> PathBuf {
        self.run_dir.join(key.relative_path())
    }

    /// True when the artifact exists on disk with non-whitespace content.
    pub fn is_present(&self, key: ArtifactKey) -> Result<bool> {
        Ok(self
            .read(key)?
            .is_some_and(|contents| !contents.trim().is_empty()))
    }

    /// Contents of `key`, or `None` if it has never been written.
    pub fn read(&self, key: ArtifactKey) -> Result<Option<String>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("artifact cache lock poisoned"))?;
        if let Some(contents) = cache.get(&key) {
            return Ok(Some(contents.clone()));
        }
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        debug!(artifact = %key, bytes = contents.len(), "artifact loaded");
        cache.insert(key, contents.clone());
        Ok(Some(contents))
    }

    /// Like [`read`](Self::read) but missing artifacts are an error.
    pub fn require(&self, key: ArtifactKey) -> Result<String> {
        self.read(key)?
            .ok_or_else(|| anyhow!("missing artifact {}", self.path(key).display()))
    }

    pub fn write(&self, key: ArtifactKey, contents: &str) -> Result<PathBuf> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("artifact cache lock poisoned"))?;
        let path = self.path(key);
        write_atomic(&path, contents)?;
        debug!(artifact = %key, bytes = contents.len(), "artifact written");
        cache.insert(key, contents.to_string());
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, key: ArtifactKey, value: &T) -> Result<PathBuf> {
        let mut buf = serde_json::to_string_pretty(value)
            .with_context(|| format!("serialize {key}"))?;
        buf.push('\n');
        self.write(key, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_uses_fixed_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::at(temp.path());
        assert_eq!(store.read(ArtifactKey::Plan).expect("read"), None);
        assert!(!store.is_present(ArtifactKey::Plan).expect("present"));

        let path = store.write(ArtifactKey::Plan, "# Plan\n").expect("write");
        assert_eq!(path, temp.path().join("context/plan.md"));
        assert_eq!(fs::read_to_string(&path).expect("disk"), "# Plan\n");
        assert_eq!(
            store.read(ArtifactKey::Plan).expect("read").as_deref(),
            Some("# Plan\n")
        );
        assert!(store.is_present(ArtifactKey::Plan).expect("present"));
    }

    #[test]
    fn lazily_loads_existing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("artifacts")).expect("mkdir");
        fs::write(temp.path().join("artifacts/review.md"), "LGTM").expect("seed");
        let store = ArtifactStore::at(temp.path());
        assert_eq!(store.require(ArtifactKey::Review).expect("require"), "LGTM");
        assert!(store.require(ArtifactKey::Spec).is_err());
    }

    #[test]
    fn whitespace_only_artifact_is_not_present() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::at(temp.path());
        store.write(ArtifactKey::Spec, "  \n").expect("write");
        assert!(!store.is_present(ArtifactKey::Spec).expect("present"));
    }
}
