use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;

use uuid::Uuid;

use crate::blob::{BlobStore, DirBlobStore, MemoryBlobStore};
use crate::coords::{BLOCK_HEIGHT, BLOCK_WIDTH};
use crate::error::Result;
use crate::grid::TileName;

/// Bytes held by one resident tile image.
pub const TILE_BYTES: usize = BLOCK_WIDTH as usize * BLOCK_HEIGHT as usize * 4;

// ============================================================================
// CACHE CONFIG – explicit values threaded into each layer
// ============================================================================

/// Settings fixed for the lifetime of a layer's cache. Changing them means
/// building a new cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on decoded images held in memory.
    pub max_resident_images: usize,
    /// Root for loose spill files. `None` keeps spilled tiles in memory.
    pub base_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_resident_images: 256,
            base_path: None,
        }
    }
}

impl CacheConfig {
    /// Derive the image bound from a memory budget in bytes.
    pub fn from_memory_budget(bytes: usize) -> Self {
        Self {
            max_resident_images: (bytes / TILE_BYTES).max(1),
            ..Self::default()
        }
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Open the spill store this config describes.
    pub fn spill_store(&self) -> Result<Box<dyn BlobStore>> {
        Ok(match &self.base_path {
            Some(path) => Box::new(DirBlobStore::open(path)?),
            None => Box::new(MemoryBlobStore::new()),
        })
    }
}

/// A fresh, unique scratch directory path under the system temp dir.
pub fn session_scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("layercache-{}", Uuid::new_v4()))
}

// ============================================================================
// TILE ID GENERATOR
// ============================================================================

/// Monotonically increasing tile id source.
///
/// Clones share the same counter so every layer of a level draws names from
/// one sequence and names never collide inside the archive.
#[derive(Clone, Debug, Default)]
pub struct TileIdGen {
    next: Rc<Cell<u64>>,
}

impl TileIdGen {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Rc::new(Cell::new(first)),
        }
    }

    pub fn next_id(&self) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }

    pub fn next_name(&self) -> TileName {
        TileName::from_id(self.next_id())
    }

    /// Make sure future ids are greater than `id`.
    pub fn ensure_above(&self, id: u64) {
        if self.next.get() <= id {
            self.next.set(id + 1);
        }
    }

    /// The id the next call will hand out.
    pub fn peek(&self) -> u64 {
        self.next.get()
    }
}

// ============================================================================
// SETTINGS FILE
// ============================================================================

/// User-editable settings, stored as `key = value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    /// Memory budget for decoded tiles, in megabytes.
    pub memory_budget_mb: usize,
    /// Where spilled tiles go. Empty means a per-session temp directory.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_budget_mb: 64,
            scratch_dir: None,
        }
    }
}

impl CacheSettings {
    pub fn settings_path() -> Option<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
            .or_else(|_| std::env::var("APPDATA").map(PathBuf::from))
            .ok()?;
        Some(config_dir.join("layercache").join("layercache.cfg"))
    }

    /// Load from the settings file, falling back to defaults.
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        let Ok(content) = std::fs::read_to_string(&path) else { return Self::default() };
        Self::parse(&content)
    }

    /// Parse `key = value` lines; unknown keys and bad values are ignored.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "memory_budget_mb" => {
                    if let Ok(v) = val.parse::<usize>() {
                        s.memory_budget_mb = v.max(1);
                    } else {
                        log::warn!("Ignoring bad memory_budget_mb '{}'", val);
                    }
                }
                "scratch_dir" => {
                    s.scratch_dir = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
                }
                _ => {}
            }
        }
        s
    }

    pub fn to_file_string(&self) -> String {
        format!(
            "memory_budget_mb = {}\nscratch_dir = {}\n",
            self.memory_budget_mb,
            self.scratch_dir.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
        )
    }

    /// Turn the settings into a cache config. Without a configured scratch
    /// directory each session spills into its own temp directory.
    pub fn to_config(&self) -> CacheConfig {
        let base = self.scratch_dir.clone().unwrap_or_else(session_scratch_dir);
        CacheConfig::from_memory_budget(self.memory_budget_mb * 1024 * 1024).with_base_path(base)
    }
}
