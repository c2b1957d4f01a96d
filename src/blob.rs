//! Named-blob persistence consumed by the cache and the compositor.
//!
//! Blob contents are opaque bytes here; tiles happen to be PNG-encoded by
//! [`crate::io`]. Three stores are provided:
//!
//! * [`MemoryBlobStore`]: a map in RAM (tests, default spill target).
//! * [`DirBlobStore`]: one loose file per blob under a root directory.
//! * [`crate::io::PackBlobStore`]: a single pack file, the level archive.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::grid::DEFAULT_MAX_NAME_LEN;

/// Named-blob container.
pub trait BlobStore {
    fn contains(&self, name: &str) -> bool;

    /// Stream a blob's bytes. Fails with [`CacheError::NotFound`] if absent.
    fn read(&self, name: &str) -> Result<Box<dyn Read + '_>>;

    /// Create or replace a blob of `byte_len` bytes and stream its contents in.
    fn write(&mut self, name: &str, byte_len: usize) -> Result<Box<dyn Write + '_>>;

    /// Remove a blob. Absent blobs are not an error.
    fn delete(&mut self, name: &str) -> Result<()>;

    /// Names of all stored blobs, sorted.
    fn names(&self) -> Vec<String>;

    /// Longest identifier the store accepts.
    fn max_name_len(&self) -> usize {
        DEFAULT_MAX_NAME_LEN
    }

    /// Make previous writes durable.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read a whole blob into memory.
pub fn read_blob(store: &dyn BlobStore, name: &str) -> Result<Vec<u8>> {
    let mut reader = store.read(name)?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Write a whole blob, flushing the stream before returning.
pub fn write_blob(store: &mut dyn BlobStore, name: &str, bytes: &[u8]) -> Result<()> {
    let mut writer = store.write(name, bytes.len())?;
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct MemoryBlobStore {
    blobs: BTreeMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub(crate) fn into_blobs(self) -> BTreeMap<String, Vec<u8>> {
        self.blobs
    }

    pub(crate) fn from_blobs(blobs: BTreeMap<String, Vec<u8>>) -> Self {
        Self { blobs }
    }
}

impl BlobStore for MemoryBlobStore {
    fn contains(&self, name: &str) -> bool {
        self.blobs.contains_key(name)
    }

    fn read(&self, name: &str) -> Result<Box<dyn Read + '_>> {
        match self.blobs.get(name) {
            Some(bytes) => Ok(Box::new(bytes.as_slice())),
            None => Err(CacheError::NotFound(name.to_string())),
        }
    }

    fn write(&mut self, name: &str, byte_len: usize) -> Result<Box<dyn Write + '_>> {
        if name.len() > self.max_name_len() {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        let buf = self.blobs.entry(name.to_string()).or_default();
        buf.clear();
        buf.reserve(byte_len);
        Ok(Box::new(buf))
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        self.blobs.remove(name);
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.blobs.keys().cloned().collect()
    }
}

// ============================================================================
// Loose-file directory store
// ============================================================================

/// One file per blob under `root`.
#[derive(Debug)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    /// Open (creating if needed) a directory store.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BlobStore for DirBlobStore {
    fn contains(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    fn read(&self, name: &str) -> Result<Box<dyn Read + '_>> {
        match File::open(self.path_of(name)) {
            Ok(f) => Ok(Box::new(BufReader::new(f))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CacheError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, name: &str, _byte_len: usize) -> Result<Box<dyn Write + '_>> {
        if name.len() > self.max_name_len() {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        let file = File::create(self.path_of(name))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &mut dyn BlobStore) {
        assert!(!store.contains("1.png"));
        assert!(matches!(store.read("1.png"), Err(CacheError::NotFound(_))));

        write_blob(store, "1.png", b"hello").unwrap();
        assert!(store.contains("1.png"));
        assert_eq!(read_blob(store, "1.png").unwrap(), b"hello");

        write_blob(store, "1.png", b"bye").unwrap();
        assert_eq!(read_blob(store, "1.png").unwrap(), b"bye");

        write_blob(store, "2.png", b"two").unwrap();
        assert_eq!(store.names(), vec!["1.png".to_string(), "2.png".to_string()]);

        store.delete("1.png").unwrap();
        store.delete("1.png").unwrap();
        assert!(!store.contains("1.png"));
    }

    #[test]
    fn memory_store_semantics() {
        let mut store = MemoryBlobStore::new();
        exercise(&mut store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn dir_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirBlobStore::open(dir.path().join("loose")).unwrap();
        exercise(&mut store);
        assert!(dir.path().join("loose").join("2.png").is_file());
    }

    #[test]
    fn overlong_names_are_rejected() {
        let mut store = MemoryBlobStore::new();
        let name = "n".repeat(300);
        assert!(matches!(store.write(&name, 0), Err(CacheError::InvalidName(_))));
    }
}
