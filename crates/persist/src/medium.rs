//! Backing storage media.
//!
//! Paths handed to a medium are relative, `/`-separated and never escape the
//! medium's root. The store only ever uses the primitives on [`StorageMedium`],
//! so a different medium (object store, in-memory fake) can be swapped in.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A hierarchical byte-addressable store.
pub trait StorageMedium: Send + Sync {
    fn read_string(&self, path: &str) -> io::Result<String>;
    fn write_string(&self, path: &str, contents: &str) -> io::Result<()>;
    fn exists(&self, path: &str) -> bool;
    /// Delete a file. Returns whether anything was removed.
    fn delete(&self, path: &str) -> io::Result<bool>;
    /// Move `from` over `to`, replacing `to` if it exists.
    fn move_file(&self, from: &str, to: &str) -> io::Result<()>;
    fn copy_file(&self, from: &str, to: &str) -> io::Result<()>;
    /// Names of the direct children of a directory, sorted. Missing directory lists as empty.
    fn list(&self, dir: &str) -> io::Result<Vec<String>>;
    fn create_dir(&self, dir: &str) -> io::Result<()>;
}

/// Parent directory of a medium path, if it has one.
pub fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Local file system medium rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsMedium {
    root: PathBuf,
}

impl FsMedium {
    /// Create a medium rooted at `root`, creating the directory if needed.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            full.push(part);
        }
        full
    }
}

impl StorageMedium for FsMedium {
    fn read_string(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.resolve(path))
    }

    fn write_string(&self, path: &str, contents: &str) -> io::Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&full)?;
        file.write_all(contents.as_bytes())?;
        // Data must be on disk before a later rename can expose it.
        file.sync_all()
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn delete(&self, path: &str) -> io::Result<bool> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn move_file(&self, from: &str, to: &str) -> io::Result<()> {
        // rename(2) replaces the destination atomically on the same file system.
        let dest = self.resolve(to);
        fs::rename(self.resolve(from), &dest)?;
        if let Some(parent) = dest.parent() {
            fsync_directory(parent);
        }
        Ok(())
    }

    fn copy_file(&self, from: &str, to: &str) -> io::Result<()> {
        let dest = self.resolve(to);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(self.resolve(from), dest).map(|_| ())
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.resolve(dir)) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create_dir(&self, dir: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(dir))
    }
}

/// Persist a directory entry change. Best effort: not every platform can
/// open a directory for syncing.
fn fsync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}

/// In-memory medium with operation counters and fault injection.
///
/// Used by tests to observe whether the store touched storage and to simulate
/// a crash between writing the temporary file and replacing the live one.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    files: Mutex<BTreeMap<String, String>>,
    dirs: Mutex<BTreeSet<String>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_moves: AtomicBool,
    torn_writes: AtomicBool,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read_string` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_string` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every `move_file` fail, as if the process died before the rename.
    pub fn set_fail_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }

    /// Make every `write_string` persist only half of its contents and then fail.
    pub fn set_torn_writes(&self, torn: bool) {
        self.torn_writes.store(torn, Ordering::SeqCst);
    }

    /// Raw contents of a file, bypassing the counters.
    pub fn peek(&self, path: &str) -> Option<String> {
        lock(&self.files).get(path).cloned()
    }

    /// Overwrite a file directly, bypassing the counters.
    pub fn poke(&self, path: &str, contents: &str) {
        lock(&self.files).insert(path.to_string(), contents.to_string());
    }

    pub fn file_paths(&self) -> Vec<String> {
        lock(&self.files).keys().cloned().collect()
    }
}

impl StorageMedium for MemoryMedium {
    fn read_string(&self, path: &str) -> io::Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn write_string(&self, path: &str, contents: &str) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.torn_writes.load(Ordering::SeqCst) {
            let cut = contents.len() / 2;
            let partial: String = contents.chars().take(cut).collect();
            lock(&self.files).insert(path.to_string(), partial);
            return Err(io::Error::other("torn write"));
        }
        lock(&self.files).insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        lock(&self.files).contains_key(path) || lock(&self.dirs).contains(path)
    }

    fn delete(&self, path: &str) -> io::Result<bool> {
        Ok(lock(&self.files).remove(path).is_some())
    }

    fn move_file(&self, from: &str, to: &str) -> io::Result<()> {
        if self.fail_moves.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected move failure"));
        }
        let mut files = lock(&self.files);
        let contents = files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.to_string()))?;
        files.insert(to.to_string(), contents);
        Ok(())
    }

    fn copy_file(&self, from: &str, to: &str) -> io::Result<()> {
        let mut files = lock(&self.files);
        let contents = files
            .get(from)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.to_string()))?;
        files.insert(to.to_string(), contents);
        Ok(())
    }

    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names = BTreeSet::new();
        let files = lock(&self.files);
        let dirs = lock(&self.dirs);
        for path in files.keys().chain(dirs.iter()) {
            if let Some(rest) = path.strip_prefix(&prefix) {
                if let Some(first) = rest.split('/').next().filter(|s| !s.is_empty()) {
                    names.insert(first.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn create_dir(&self, dir: &str) -> io::Result<()> {
        let mut dirs = lock(&self.dirs);
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            dirs.insert(current.clone());
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
