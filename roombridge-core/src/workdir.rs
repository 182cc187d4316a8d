// ABOUTME: WorkingDirectory - the canonical filesystem path every record is keyed by.
// ABOUTME: Two paths are the same directory iff their canonical forms are byte-equal.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkingDirectory {
    path: PathBuf,
    key: String,
}

impl WorkingDirectory {
    /// Canonicalize `path`. The directory must exist and its path must be UTF-8.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path)
            .with_context(|| format!("Working directory {} is not accessible", path.display()))?;
        if !canonical.is_dir() {
            anyhow::bail!("{} is not a directory", canonical.display());
        }
        let key = canonical
            .to_str()
            .ok_or_else(|| anyhow!("Working directory {} is not valid UTF-8", canonical.display()))?
            .to_string();
        Ok(Self {
            path: canonical,
            key,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Storage key: the canonical path as text
    pub fn as_key(&self) -> &str {
        &self.key
    }

    /// Last path segment, used for human-readable room names
    pub fn display_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.key)
    }
}

impl fmt::Display for WorkingDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
