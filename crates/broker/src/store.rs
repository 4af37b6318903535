//! Storage seam between the broker and the shared directory.
//!
//! [`FsStore`] is the real thing. [`MemoryStore`] keeps artifacts in memory
//! so the processing state machine can be exercised without a filesystem,
//! and can inject transient read and write failures.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: Option<SystemTime>,
    pub len: u64,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write `bytes` so that readers observe either the old content or the
    /// complete new content, never a prefix.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Regular files directly inside `dir`.
    async fn list(&self, dir: &Path) -> io::Result<Vec<StoreEntry>>;

    async fn is_dir(&self, path: &Path) -> bool;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Sibling path used for in-flight writes; its `.tmp` extension never
/// matches an artifact name.
#[must_use]
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsStore;

#[async_trait]
impl ArtifactStore for FsStore {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let tmp = tmp_path_for(path);
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<StoreEntry>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            // Entries can disappear between readdir and stat.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            out.push(StoreEntry {
                path: entry.path(),
                file_name,
                modified: meta.modified().ok(),
                len: meta.len(),
            });
        }
        Ok(out)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    bytes: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<PathBuf, MemFile>,
    dirs: Vec<PathBuf>,
    read_failures: HashMap<PathBuf, usize>,
    write_failures: HashMap<PathBuf, usize>,
    reads: usize,
}

/// In-memory [`ArtifactStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.insert_with_mtime(path, bytes, SystemTime::now());
    }

    pub fn insert_with_mtime(
        &self,
        path: impl Into<PathBuf>,
        bytes: impl Into<Vec<u8>>,
        modified: SystemTime,
    ) {
        let mut state = self.lock();
        state.files.insert(
            path.into(),
            MemFile {
                bytes: bytes.into(),
                modified,
            },
        );
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.bytes.clone())
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }

    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    /// Make the next `count` reads of `path` fail with a permission error.
    pub fn fail_reads(&self, path: impl Into<PathBuf>, count: usize) {
        self.lock().read_failures.insert(path.into(), count);
    }

    /// Make the next `count` atomic writes to `path` fail.
    pub fn fail_writes(&self, path: impl Into<PathBuf>, count: usize) {
        self.lock().write_failures.insert(path.into(), count);
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        // A panic while holding this lock can only come from a failing test.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut state = self.lock();
        state.reads += 1;
        if let Some(remaining) = state.read_failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is locked", path.display()),
                ));
            }
        }
        state
            .files
            .get(path)
            .map(|f| f.bytes.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        if let Some(remaining) = state.write_failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::other(format!(
                    "no space left for {}",
                    path.display()
                )));
            }
        }
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                bytes: bytes.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.lock();
        let file = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    async fn list(&self, dir: &Path) -> io::Result<Vec<StoreEntry>> {
        let state = self.lock();
        let known_dir = state.dirs.iter().any(|d| d == dir)
            || state.files.keys().any(|p| p.parent() == Some(dir));
        if !known_dir {
            return Err(not_found(dir));
        }
        Ok(state
            .files
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter_map(|(path, file)| {
                let file_name = path.file_name()?.to_str()?.to_string();
                Some(StoreEntry {
                    path: path.clone(),
                    file_name,
                    modified: Some(file.modified),
                    len: file.bytes.len() as u64,
                })
            })
            .collect())
    }

    async fn is_dir(&self, path: &Path) -> bool {
        let state = self.lock();
        state.dirs.iter().any(|d| d == path)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if !state.dirs.iter().any(|d| d == ancestor) {
                state.dirs.push(ancestor.to_path_buf());
            }
        }
        Ok(())
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn tmp_path_keeps_directory() {
        let tmp = tmp_path_for(Path::new("/spool/spool-response-a.json"));
        assert_eq!(tmp, Path::new("/spool/spool-response-a.json.tmp"));
    }

    #[tokio::test]
    async fn fs_store_writes_atomically_and_lists_files_only() {
        let temp = tempdir().unwrap();
        let store = FsStore;
        let path = temp.path().join("a.json");
        store.write_atomic(&path, b"{}").await.unwrap();
        tokio::fs::create_dir(temp.path().join("sub")).await.unwrap();

        let entries = store.list(temp.path()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name, "a.json");
        assert_eq!(entries[0].len, 2);
        assert!(!tmp_path_for(&path).exists());
        assert!(store.is_dir(temp.path()).await);
        assert!(!store.is_dir(&path).await);
    }

    #[tokio::test]
    async fn memory_store_injects_read_failures() {
        let store = MemoryStore::new();
        let path = PathBuf::from("/spool/x");
        store.insert(&path, "hello");
        store.fail_reads(&path, 1);

        let err = store.read(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(store.read(&path).await.unwrap(), b"hello");
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn memory_store_injects_write_failures() {
        let store = MemoryStore::new();
        let path = PathBuf::from("/spool/out.json");
        store.fail_writes(&path, 1);

        assert!(store.write_atomic(&path, b"{}").await.is_err());
        assert!(!store.contains(&path));
        store.write_atomic(&path, b"{}").await.unwrap();
        assert_eq!(store.get(&path).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn memory_store_rename_moves_between_dirs() {
        let store = MemoryStore::new();
        store.create_dir_all(Path::new("/spool/processed")).await.unwrap();
        store.insert("/spool/req", "x");
        store
            .rename(Path::new("/spool/req"), Path::new("/spool/processed/req"))
            .await
            .unwrap();

        assert!(store.list(Path::new("/spool")).await.unwrap().is_empty());
        assert_eq!(store.list(Path::new("/spool/processed")).await.unwrap().len(), 1);
        let err = store
            .rename(Path::new("/spool/req"), Path::new("/spool/other"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
