//! Key/value stores backing the token and login-session records.
//!
//! Two scopes are used: a durable store that survives restarts
//! ([`FileStore`]) and a session store that lives for the process
//! ([`MemoryStore`]). Both sit behind [`KeyValueStore`] so tests can swap
//! either one for an in-memory fake.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::Error;

/// Minimal string key/value store.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backing medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write cannot be committed.
    fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Remove a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the removal cannot be committed.
    fn remove(&self, key: &str) -> Result<(), Error>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    mutex
        .lock()
        .map_err(|_| Error::Storage("store lock poisoned".into()))
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        lock(&self.entries)?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }
}

/// Durable store kept as a flat JSON object on disk.
///
/// The whole file is rewritten on every mutation; writes go to a sibling
/// temp file first and are renamed into place.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but is unreadable or not
    /// a JSON object of strings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Storage(format!("{}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Storage(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)
                .map_err(|e| Error::Storage(format!("{}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("tmp");
        write_private(&tmp, json.as_bytes())
            .map_err(|e| Error::Storage(format!("{}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Storage(format!("{}: {e}", self.path.display()))
        })
    }
}

/// Owner read/write for the token file (Unix only).
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Owner-only directories (Unix only).
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(dir)
}

/// Write `contents` to a file that is never readable by group or others,
/// including when it already existed with wider permissions.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(FILE_MODE))?;
    }
    file.write_all(contents)?;
    file.sync_all()
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut entries = lock(&self.entries)?;
        entries.insert(key.to_owned(), value.to_owned());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        let mut entries = lock(&self.entries)?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}
