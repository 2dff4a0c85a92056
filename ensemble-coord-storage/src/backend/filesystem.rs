//! Directory-tree backend shared by independent agent processes
//!
//! Every mutation of a key runs while holding an exclusive advisory lock
//! (`flock`) on one of a fixed set of guard files under `.guards/`. The
//! guard is chosen by hashing the key, so all handles in all processes
//! agree on it. Under the guard:
//!
//! - `create_exclusive` writes a hidden temp file and `hard_link`s it into
//!   place, so the record is complete the moment it becomes visible.
//! - `put` writes a temp file and `rename`s it over the target.
//! - `move_atomic` holds the guards of both keys, checks the destination
//!   is free and issues a single `rename`.
//! - `compare_and_delete` reads the record and removes it only on a match.
//!   A mismatched record is never touched.
//! - `delete` removes the file.
//!
//! `get`, `list` and `read_from` take no guard: records only ever appear or
//! disappear through `link`, `rename` and `unlink`. `append` issues one
//! `write_all` on an `O_APPEND` handle.
//!
//! All of this assumes a local filesystem. Network filesystems with weaker
//! `flock`/`link`/`rename` guarantees are not supported.

use super::{validate_key, StorageBackend};
use async_trait::async_trait;
use ensemble_coord_core::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory under the store root holding the guard files
const GUARD_DIR: &str = ".guards";

/// Number of guard files keys are hashed onto
const GUARD_STRIPES: u64 = 64;

/// Store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    root: PathBuf,
}

impl FileSystemBackend {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let guards = root.join(GUARD_DIR);
        fs::create_dir_all(&guards)
            .await
            .map_err(|e| Error::storage(format!("create store root {}", root.display()), e))?;
        debug!("Opened filesystem store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    /// Guard file serialising mutations of `key`
    fn guard_path(&self, key: &str) -> PathBuf {
        self.root
            .join(GUARD_DIR)
            .join(format!("{:02}.guard", guard_stripe(key)))
    }

    /// Run `work` on the blocking pool while holding the guards of `keys`
    ///
    /// Guards are taken in path order so two multi-key operations can never
    /// deadlock. They are released when the handles drop.
    async fn guarded<T, F>(&self, keys: &[&str], operation: String, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        let mut guards: Vec<PathBuf> = keys.iter().map(|key| self.guard_path(key)).collect();
        guards.sort();
        guards.dedup();

        let joined = tokio::task::spawn_blocking(move || -> io::Result<T> {
            let mut held: Vec<File> = Vec::with_capacity(guards.len());
            for path in &guards {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                file.lock_exclusive()?;
                held.push(file);
            }
            let outcome = work();
            drop(held);
            outcome
        })
        .await
        .map_err(|e| Error::storage(operation.clone(), e))?;
        joined.map_err(|e| Error::storage(operation, e))
    }

    fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => std::fs::create_dir_all(parent),
            None => Ok(()),
        }
    }

    /// Hidden sibling path used for temp files
    fn scratch_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }

    fn write_temp(path: &Path, value: &[u8]) -> io::Result<PathBuf> {
        let temp = Self::scratch_path(path);
        std::fs::write(&temp, value)?;
        Ok(temp)
    }

    fn discard(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove scratch file {}: {}", path.display(), e);
            }
        }
    }
}

/// FNV-1a over the key, stable across processes and builds
fn guard_stripe(key: &str) -> u64 {
    let hash = key.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    });
    hash % GUARD_STRIPES
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("read {}", key), e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let value = value.to_vec();
        self.guarded(&[key], format!("replace {}", key), move || {
            Self::ensure_parent(&path)?;
            let temp = Self::write_temp(&path, &value)?;
            if let Err(e) = std::fs::rename(&temp, &path) {
                Self::discard(&temp);
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    async fn create_exclusive(&self, key: &str, value: &[u8]) -> Result<bool> {
        let path = self.path_for(key)?;
        let value = value.to_vec();
        self.guarded(&[key], format!("create {}", key), move || {
            Self::ensure_parent(&path)?;
            let temp = Self::write_temp(&path, &value)?;
            let linked = std::fs::hard_link(&temp, &path);
            Self::discard(&temp);
            match linked {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn move_atomic(&self, from: &str, to: &str) -> Result<bool> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        self.guarded(&[from, to], format!("move {} -> {}", from, to), move || {
            match std::fs::symlink_metadata(&source) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            }
            match std::fs::symlink_metadata(&target) {
                Ok(_) => {
                    return Err(io::Error::new(
                        ErrorKind::AlreadyExists,
                        "destination already exists",
                    ))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Self::ensure_parent(&target)?;
            match std::fs::rename(&source, &target) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let path = self.path_for(key)?;
        let expected = expected.to_vec();
        let key_owned = key.to_string();
        self.guarded(&[key], format!("compare and delete {}", key), move || {
            let current = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            };
            if current != expected {
                debug!("{} no longer holds the expected record", key_owned);
                return Ok(false);
            }
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        self.guarded(&[key], format!("delete {}", key), move || {
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_end_matches('/');
        let dir = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(format!("list {}", prefix), e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage(format!("list {}", prefix), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_file())
                .unwrap_or(false);
            if is_file {
                keys.push(format!("{}/{}", prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn append(&self, key: &str, record: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let record = record.to_vec();
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            Self::ensure_parent(&path)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(&record)?;
            file.flush()
        })
        .await
        .map_err(|e| Error::storage(format!("append {}", key_owned), e))?
        .map_err(|e| Error::storage(format!("append {}", key), e))
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let len = file.metadata()?.len();
            if offset >= len {
                return Ok(Vec::new());
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut bytes = Vec::with_capacity((len - offset) as usize);
            file.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
        .await
        .map_err(|e| Error::storage(format!("read {}", key_owned), e))?
        .map_err(|e| Error::storage(format!("read {}", key), e))
    }
}
