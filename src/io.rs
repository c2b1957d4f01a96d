use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::blob::{BlobStore, MemoryBlobStore, read_blob, write_blob};
use crate::coords::{BLOCK_HEIGHT, BLOCK_WIDTH};
use crate::error::{CacheError, Result};
use crate::record::LayerManifest;

// ============================================================================
// TILE BLOB CODEC
// ============================================================================

/// Encode a tile image as PNG bytes.
pub fn encode_tile(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(4096);
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)
        .map_err(|e| CacheError::Persistence(format!("PNG encode failed: {}", e)))?;
    Ok(bytes)
}

/// Decode PNG bytes into a block-sized tile image.
pub fn decode_tile(name: &str, bytes: &[u8]) -> Result<RgbaImage> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map_err(|e| CacheError::image_load(name, e))?
        .into_rgba8();
    if image.dimensions() != (BLOCK_WIDTH, BLOCK_HEIGHT) {
        return Err(CacheError::ImageLoad {
            name: name.to_string(),
            msg: format!(
                "tile is {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                BLOCK_WIDTH,
                BLOCK_HEIGHT
            ),
        });
    }
    Ok(image)
}

/// Read and decode a tile blob.
///
/// A missing blob is [`CacheError::NotFound`]; anything that exists but
/// cannot be read or decoded is [`CacheError::ImageLoad`].
pub fn load_tile(store: &dyn BlobStore, name: &str) -> Result<RgbaImage> {
    let bytes = read_blob(store, name).map_err(|e| match e {
        CacheError::NotFound(n) => CacheError::NotFound(n),
        other => CacheError::ImageLoad {
            name: name.to_string(),
            msg: other.to_string(),
        },
    })?;
    decode_tile(name, &bytes)
}

/// Encode and write a tile blob.
pub fn store_tile(store: &mut dyn BlobStore, name: &str, image: &RgbaImage) -> Result<()> {
    let bytes = encode_tile(image)?;
    write_blob(store, name, &bytes).map_err(|e| match e {
        CacheError::InvalidName(n) => CacheError::InvalidName(n),
        CacheError::Persistence(msg) => CacheError::Persistence(format!("writing '{}': {}", name, msg)),
        other => CacheError::Persistence(format!("writing '{}': {}", name, other)),
    })
}

// ============================================================================
// LAYER MANIFEST BLOB
// ============================================================================

/// Reserved blob name holding the layer manifest inside a pack.
pub const MANIFEST_BLOB: &str = "layer.manifest";

/// Serialize the manifest into `store` under [`MANIFEST_BLOB`].
pub fn write_manifest(store: &mut dyn BlobStore, manifest: &LayerManifest) -> Result<()> {
    let bytes = bincode::serialize(manifest)
        .map_err(|e| CacheError::Persistence(format!("manifest encode failed: {}", e)))?;
    write_blob(store, MANIFEST_BLOB, &bytes)
}

/// Load the manifest from `store`, or `None` for a fresh store.
pub fn read_manifest(store: &dyn BlobStore) -> Result<Option<LayerManifest>> {
    if !store.contains(MANIFEST_BLOB) {
        return Ok(None);
    }
    let bytes = read_blob(store, MANIFEST_BLOB)?;
    let manifest: LayerManifest = bincode::deserialize(&bytes)?;
    manifest.validate()?;
    Ok(Some(manifest))
}

/// Delete every blob in `store` that neither `manifest` nor the manifest blob
/// itself refers to. Returns how many went.
pub fn prune_unreferenced(store: &mut dyn BlobStore, manifest: &LayerManifest) -> Result<usize> {
    let referenced: std::collections::HashSet<&str> =
        manifest.tiles.iter().filter_map(|t| t.name.as_deref()).collect();
    let mut removed = 0;
    for name in store.names() {
        if name != MANIFEST_BLOB && !referenced.contains(name.as_str()) {
            store.delete(&name)?;
            removed += 1;
        }
    }
    if removed > 0 {
        log::debug!("Pruned {} unreferenced blobs", removed);
    }
    Ok(removed)
}

// ============================================================================
// PACK FILE – the level archive as a single bincode file
// ============================================================================

/// Magic header for pack files.
const PACK_MAGIC: &str = "LCP1";

/// Maximum number of blobs accepted from a pack file.
/// Prevents memory exhaustion from crafted files.
const MAX_PACK_BLOBS: usize = 1 << 20;

#[derive(Serialize, Deserialize)]
struct PackFile {
    magic: String,
    blobs: BTreeMap<String, Vec<u8>>,
}

/// Blob store persisted as one pack file.
///
/// Blobs live in memory while open; [`BlobStore::flush`] rewrites the file
/// through a temporary sibling and renames it into place.
pub struct PackBlobStore {
    path: PathBuf,
    inner: MemoryBlobStore,
    modified: bool,
}

impl PackBlobStore {
    /// Open an existing pack or start an empty one at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            read_pack(&path)?
        } else {
            MemoryBlobStore::new()
        };
        Ok(Self {
            path,
            inner,
            modified: false,
        })
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

fn read_pack(path: &Path) -> Result<MemoryBlobStore> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if raw.len() < 12 {
        return Err(CacheError::InvalidFormat("Pack file too small".into()));
    }

    // bincode encodes a String as an 8-byte length prefix + UTF-8 data,
    // so bytes 8..12 hold the magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PACK_MAGIC {
        return Err(CacheError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }

    let pack: PackFile = bincode::deserialize(&raw)?;
    if pack.blobs.len() > MAX_PACK_BLOBS {
        return Err(CacheError::InvalidFormat(format!(
            "Pack holds {} blobs, which exceeds the maximum of {}",
            pack.blobs.len(),
            MAX_PACK_BLOBS
        )));
    }
    Ok(MemoryBlobStore::from_blobs(pack.blobs))
}

impl BlobStore for PackBlobStore {
    fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    fn read(&self, name: &str) -> Result<Box<dyn Read + '_>> {
        self.inner.read(name)
    }

    fn write(&mut self, name: &str, byte_len: usize) -> Result<Box<dyn Write + '_>> {
        self.modified = true;
        self.inner.write(name, byte_len)
    }

    fn delete(&mut self, name: &str) -> Result<()> {
        if self.inner.contains(name) {
            self.modified = true;
        }
        self.inner.delete(name)
    }

    fn names(&self) -> Vec<String> {
        self.inner.names()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.modified && self.path.exists() {
            return Ok(());
        }
        let pack = PackFile {
            magic: PACK_MAGIC.to_string(),
            blobs: std::mem::take(&mut self.inner).into_blobs(),
        };

        let tmp = self.path.with_extension("tmp");
        let written = (|| -> Result<()> {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(&mut writer, &pack)
                .map_err(|e| CacheError::Persistence(e.to_string()))?;
            writer.flush()?;
            fs::rename(&tmp, &self.path)?;
            Ok(())
        })();

        self.inner = MemoryBlobStore::from_blobs(pack.blobs);
        written?;
        self.modified = false;
        log::debug!("Flushed pack {} ({} blobs)", self.path.display(), self.inner.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient_tile() -> RgbaImage {
        RgbaImage::from_fn(BLOCK_WIDTH, BLOCK_HEIGHT, |x, y| {
            Rgba([x as u8, y as u8, (x ^ y) as u8, 200])
        })
    }

    #[test]
    fn tiles_survive_the_codec() {
        let mut store = MemoryBlobStore::new();
        let tile = gradient_tile();
        store_tile(&mut store, "7.png", &tile).unwrap();
        assert_eq!(load_tile(&store, "7.png").unwrap(), tile);
    }

    #[test]
    fn corrupt_blobs_are_image_load_errors() {
        let mut store = MemoryBlobStore::new();
        write_blob(&mut store, "bad.png", b"not a png at all").unwrap();
        assert!(matches!(load_tile(&store, "bad.png"), Err(CacheError::ImageLoad { .. })));
        assert!(matches!(load_tile(&store, "missing.png"), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn wrong_sized_tiles_are_rejected() {
        let mut store = MemoryBlobStore::new();
        let small = RgbaImage::new(4, 4);
        store_tile(&mut store, "s.png", &small).unwrap();
        assert!(matches!(load_tile(&store, "s.png"), Err(CacheError::ImageLoad { .. })));
    }

    #[test]
    fn pack_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("level.pack");

        let mut pack = PackBlobStore::open(&path).unwrap();
        store_tile(&mut pack, "1.png", &gradient_tile()).unwrap();
        write_blob(&mut pack, "notes", b"abc").unwrap();
        assert!(pack.is_modified());
        pack.flush().unwrap();
        assert!(!pack.is_modified());

        let reopened = PackBlobStore::open(&path).unwrap();
        assert_eq!(reopened.names(), vec!["1.png".to_string(), "notes".to_string()]);
        assert_eq!(load_tile(&reopened, "1.png").unwrap(), gradient_tile());
    }

    #[test]
    fn foreign_files_are_not_packs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pack");
        fs::write(&path, b"0123456789abcdefgh").unwrap();
        assert!(matches!(PackBlobStore::open(&path), Err(CacheError::InvalidFormat(_))));
    }
}
