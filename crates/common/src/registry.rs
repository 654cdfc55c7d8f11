//! JSON-backed registry file.
//!
//! Layout on disk:
//!
//! ```text
//! ~/.portkeeper/
//!   registry.json        (the document)
//!   registry.json.lock   (advisory lock, never holds data)
//!   registry.json.tmp    (transient, renamed over registry.json on save)
//! ```
//!
//! Mutations go through [`RegistryStore::update`], which holds an exclusive
//! lock across load, mutate and save so two processes cannot both write back
//! a snapshot taken before the other's change.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::Registry;

#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry.json".to_string());
        self.path.with_file_name(format!("{name}.{suffix}"))
    }

    /// Read the document. A missing or unreadable file yields an empty registry.
    pub fn load(&self) -> Registry {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", self.path.display());
                return Registry::default();
            }
            Err(e) => {
                warn!("Failed to read registry {}: {}; starting empty", self.path.display(), e);
                return Registry::default();
            }
        };

        let mut registry: Registry = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(e) => {
                warn!("Registry {} is corrupt ({}); starting empty", self.path.display(), e);
                return Registry::default();
            }
        };

        if registry.allocations.remove(&0).is_some() {
            warn!("Dropped invalid port 0 entry from {}", self.path.display());
        }
        registry
    }

    /// Serialize the full document and replace the file via a sibling temp file.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        self.ensure_parent()?;

        let tmp_path = self.sibling("tmp");
        let json = serde_json::to_string_pretty(registry)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            "Saved {} allocation(s) to {}",
            registry.allocations.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load under a shared lock.
    pub fn snapshot(&self) -> Result<Registry> {
        let _lock = RegistryLock::shared(self)?;
        Ok(self.load())
    }

    /// Locked read-modify-write.
    ///
    /// `f` works on an in-memory copy. The file is rewritten only when `f`
    /// succeeds and actually changed something; on error the file is untouched.
    pub fn update<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let _lock = RegistryLock::exclusive(self)?;

        let before = self.load();
        let mut working = before.clone();
        let value = f(&mut working)?;

        if working != before {
            self.save(&working)?;
        }
        Ok(value)
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Advisory lock on `<registry>.lock`, released on drop.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn open(store: &RegistryStore) -> Result<File> {
        store.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(store.sibling("lock"))?;
        Ok(file)
    }

    fn exclusive(store: &RegistryStore) -> Result<Self> {
        let file = Self::open(store)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn shared(store: &RegistryStore) -> Result<Self> {
        let file = Self::open(store)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release registry lock: {}", e);
        }
    }
}
