//! Filestore - the encrypted file on disk
//!
//! One invocation is one pass through `ensure_exists -> load -> (mutation) ->
//! save`. Read-only commands stop after `load`. Writes replace the whole file
//! atomically (temp file, fsync, rename) so a failed save never truncates the
//! previous contents.
//!
//! Concurrent invocations are serialized with an advisory `flock` on a
//! sibling `.lock` file. Anything that edits the filestore without taking the
//! lock can still lose updates.

use crate::cipher::Cipher;
use crate::error::{Error, Result};
use crate::store::SecretStore;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroize;

/// The encrypted filestore and the cipher that protects it
pub struct Filestore {
    path: PathBuf,
    cipher: Cipher,
}

/// Exclusive advisory lock, released on drop
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(Error::io("opening lock file", &path))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::io("locking", &path)(std::io::Error::last_os_error()));
        }

        debug!(lock = %path.display(), "acquired filestore lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl Filestore {
    pub fn new(path: impl Into<PathBuf>, cipher: Cipher) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create an encrypted empty store if the file is missing.
    ///
    /// Returns true when a file was written.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.exists() {
            return Ok(false);
        }

        debug!(path = %self.path.display(), "initializing empty filestore");
        self.save(&SecretStore::new())?;
        Ok(true)
    }

    /// Read, decrypt and parse the whole store
    pub fn load(&self) -> Result<SecretStore> {
        let stored = fs::read(&self.path).map_err(Error::io("reading secrets file", &self.path))?;

        let mut plaintext = self.cipher.decrypt(&stored)?;
        let parsed = serde_json::from_slice::<SecretStore>(&plaintext);
        plaintext.zeroize();
        let store = parsed?;

        debug!(path = %self.path.display(), secrets = store.len(), "loaded filestore");
        Ok(store)
    }

    /// Serialize, encrypt and atomically replace the file
    pub fn save(&self, store: &SecretStore) -> Result<()> {
        let mut plaintext = serde_json::to_vec(store)?;
        let encrypted = self.cipher.encrypt(&plaintext);
        plaintext.zeroize();
        let encrypted = encrypted?;

        self.write_atomic(&encrypted)?;
        debug!(path = %self.path.display(), secrets = store.len(), "saved filestore");
        Ok(())
    }

    /// Take the advisory lock guarding load-mutate-save
    pub fn lock(&self) -> Result<FileLock> {
        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent).map_err(Error::io("creating directory", parent))?;
        }
        FileLock::acquire(sibling(&self.path, ".lock"))
    }

    /// Run a read-only command against the loaded store. Never saves.
    pub fn read<T>(&self, f: impl FnOnce(&SecretStore) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        self.ensure_exists()?;
        let store = self.load()?;
        f(&store)
    }

    /// Run one mutation against the loaded store and persist the result.
    ///
    /// Nothing is written if the mutation fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut SecretStore) -> Result<T>) -> Result<T> {
        let _lock = self.lock()?;
        self.ensure_exists()?;
        let mut store = self.load()?;
        let out = f(&mut store)?;
        self.save(&store)?;
        Ok(out)
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    /// Where writes actually land.
    ///
    /// A symlinked filestore is followed so the rename replaces the link
    /// target and the link itself survives. A dangling link resolves to the
    /// path it points at.
    fn target(&self) -> Result<PathBuf> {
        let is_link = fs::symlink_metadata(&self.path)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            return Ok(self.path.clone());
        }

        match fs::canonicalize(&self.path) {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let link = fs::read_link(&self.path)
                    .map_err(Error::io("reading symlink", &self.path))?;
                Ok(match self.parent_dir() {
                    Some(parent) if link.is_relative() => parent.join(link),
                    _ => link,
                })
            }
            Err(e) => Err(Error::io("resolving secrets file", &self.path)(e)),
        }
    }

    fn write_atomic(&self, contents: &[u8]) -> Result<()> {
        let target = self.target()?;
        let dir = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(Error::io("creating directory", dir))?;

        let tmp = sibling(&target, &format!(".tmp-{}", std::process::id()));
        let result = write_synced(&tmp, contents).and_then(|()| {
            fs::rename(&tmp, &target).map_err(Error::io("replacing secrets file", &target))
        });

        if let Err(err) = result {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(tmp = %tmp.display(), error = %cleanup, "failed to remove temporary file");
                }
            }
            return Err(err);
        }

        // The new contents are in place; a failed directory sync only
        // weakens durability across a crash
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "failed to sync directory after save");
        }
        Ok(())
    }
}

/// `<file><suffix>` next to `path`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)
        .map_err(Error::io("creating secrets file", path))?;
    file.write_all(contents)
        .map_err(Error::io("writing secrets file", path))?;
    file.sync_all()
        .map_err(Error::io("syncing secrets file", path))
}
