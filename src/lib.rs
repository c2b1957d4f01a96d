//! Tile image cache and multi-resolution compositor for 2-D level layers.
//!
//! A [`Layer`] keeps three sparse grids of fixed-size blocks (Full, Normal and
//! Tiny zoom). Full-level content is authoritative; coarser tiles are built
//! from it on demand. Blocks that are one flat color never allocate a bitmap,
//! and bitmaps live in a bounded most-recently-used cache that spills to a
//! [`BlobStore`] when it runs over budget.

#![allow(clippy::too_many_arguments)]

pub mod blob;
pub mod cache;
pub mod config;
pub mod coords;
pub mod downsample;
pub mod error;
pub mod grid;
pub mod io;
pub mod layer;
pub mod pixels;
pub mod record;

pub use blob::{BlobStore, DirBlobStore, MemoryBlobStore};
pub use cache::{CachedImage, MruImageCache};
pub use config::{CacheConfig, CacheSettings, TileIdGen};
pub use coords::{BLOCK_HEIGHT, BLOCK_WIDTH, PixelRect, WorldRect, ZoomLevel};
pub use error::{CacheError, Result};
pub use grid::{SparseTileGrid, Tile, TileName};
pub use io::PackBlobStore;
pub use layer::{Layer, SaveMode};
pub use record::{LayerManifest, PlacedObject, TileRecord};
