//! Persisted shape of a layer: one record per non-empty tile plus the opaque
//! placed-object list.
//!
//! The level-file parser lives outside this crate; the `Display` impls render
//! the same list syntax the level files use so records can be dropped in
//! verbatim.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coords::{BLOCK_HEIGHT, BLOCK_WIDTH, ZoomLevel};
use crate::error::{CacheError, Result};

pub const MANIFEST_VERSION: u32 = 1;

/// One non-empty tile. Exactly one of `name` / `color` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRecord {
    pub name: Option<String>,
    pub color: Option<[u8; 4]>,
    /// Block origin in pixels of the tile's own level.
    pub x: i64,
    pub y: i64,
    /// Zoom factor (1, 4 or 16).
    pub zoom: i64,
}

impl TileRecord {
    pub fn zoom_level(&self) -> Option<ZoomLevel> {
        ZoomLevel::from_factor(self.zoom)
    }

    /// Block `(col, row)` this record describes.
    pub fn block(&self) -> (i64, i64) {
        (self.x / BLOCK_WIDTH as i64, self.y / BLOCK_HEIGHT as i64)
    }
}

impl fmt::Display for TileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(tile")?;
        if let Some(name) = &self.name {
            write!(f, " \"{}\"", name)?;
        }
        if let Some([r, g, b, a]) = self.color {
            write!(f, " (color {} {} {} {})", r, g, b, a)?;
        }
        write!(f, " (pos {} {}) (zoom {}))", self.x, self.y, self.zoom)
    }
}

/// Something placed on the layer. Opaque to the tile cache; only moved by shifts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedObject {
    pub kind: String,
    pub x: i64,
    pub y: i64,
}

impl fmt::Display for PlacedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(object \"{}\" (pos {} {}))", self.kind, self.x, self.y)
    }
}

/// Everything needed to rebuild a layer's grids from its archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerManifest {
    pub version: u32,
    pub tiles: Vec<TileRecord>,
    pub objects: Vec<PlacedObject>,
}

impl Default for LayerManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            tiles: Vec::new(),
            objects: Vec::new(),
        }
    }
}

impl LayerManifest {
    /// Structural checks; names are validated against the store on load.
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(CacheError::InvalidFormat(format!(
                "Unsupported manifest version {}",
                self.version
            )));
        }
        for rec in &self.tiles {
            if rec.zoom_level().is_none() {
                return Err(CacheError::InvalidFormat(format!("Bad zoom in {}", rec)));
            }
            if rec.name.is_some() == rec.color.is_some() {
                return Err(CacheError::InvalidFormat(format!(
                    "Tile needs exactly one of name or color: {}",
                    rec
                )));
            }
            if rec.x < 0
                || rec.y < 0
                || rec.x % BLOCK_WIDTH as i64 != 0
                || rec.y % BLOCK_HEIGHT as i64 != 0
            {
                return Err(CacheError::InvalidFormat(format!("Unaligned position in {}", rec)));
            }
        }
        Ok(())
    }

    /// Largest numeric tile id referenced, for seeding the id generator.
    pub fn max_tile_id(&self) -> Option<u64> {
        self.tiles
            .iter()
            .filter_map(|r| r.name.as_deref())
            .filter_map(|n| n.strip_suffix(".png")?.parse().ok())
            .max()
    }

    pub fn records_at(&self, zoom: ZoomLevel) -> impl Iterator<Item = &TileRecord> + '_ {
        self.tiles.iter().filter(move |r| r.zoom == zoom.factor())
    }
}

impl fmt::Display for LayerManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(layer")?;
        writeln!(f, "  (tiles")?;
        for rec in &self.tiles {
            writeln!(f, "    {}", rec)?;
        }
        write!(f, "  )")?;
        if !self.objects.is_empty() {
            writeln!(f)?;
            writeln!(f, "  (objects")?;
            for obj in &self.objects {
                writeln!(f, "    {}", obj)?;
            }
            write!(f, "  )")?;
        }
        write!(f, ")")
    }
}
