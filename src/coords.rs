//! Coordinate math shared by every zoom level.
//!
//! World coordinates are Full-level pixels. A block is always
//! `BLOCK_WIDTH × BLOCK_HEIGHT` pixels of its own level, so the world area a
//! block covers grows by the level's zoom factor. All divisions are floor
//! divisions: world `-1` lives in block `-1`, not block `0`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

pub const BLOCK_WIDTH: u32 = 128;
pub const BLOCK_HEIGHT: u32 = 64;

/// Number of finer blocks per coarser block along each axis.
pub const ZOOM_STEP: i64 = 4;

/// One of the three fixed cache resolutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ZoomLevel {
    Full,
    Normal,
    Tiny,
}

impl ZoomLevel {
    pub const ALL: [ZoomLevel; 3] = [ZoomLevel::Full, ZoomLevel::Normal, ZoomLevel::Tiny];

    /// World pixels per pixel at this level.
    pub fn factor(self) -> i64 {
        match self {
            ZoomLevel::Full => 1,
            ZoomLevel::Normal => 4,
            ZoomLevel::Tiny => 16,
        }
    }

    pub fn from_factor(factor: i64) -> Option<Self> {
        match factor {
            1 => Some(ZoomLevel::Full),
            4 => Some(ZoomLevel::Normal),
            16 => Some(ZoomLevel::Tiny),
            _ => None,
        }
    }

    /// The level this one is synthesised from.
    pub fn finer(self) -> Option<Self> {
        match self {
            ZoomLevel::Full => None,
            ZoomLevel::Normal => Some(ZoomLevel::Full),
            ZoomLevel::Tiny => Some(ZoomLevel::Normal),
        }
    }

    pub fn index(self) -> usize {
        match self {
            ZoomLevel::Full => 0,
            ZoomLevel::Normal => 1,
            ZoomLevel::Tiny => 2,
        }
    }

    /// World extent `(w, h)` of a single block at this level.
    pub fn world_span(self) -> (i64, i64) {
        (
            BLOCK_WIDTH as i64 * self.factor(),
            BLOCK_HEIGHT as i64 * self.factor(),
        )
    }
}

impl std::fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ZoomLevel::Full => "full",
            ZoomLevel::Normal => "normal",
            ZoomLevel::Tiny => "tiny",
        };
        f.write_str(s)
    }
}

/// Floor division for a positive denominator.
#[inline]
pub fn floor_div(num: i64, den: i64) -> i64 {
    num.div_euclid(den)
}

/// A block coordinate plus the pixel offset inside that block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub col: i64,
    pub row: i64,
    pub off_x: u32,
    pub off_y: u32,
}

/// Split a zoomed-pixel coordinate (pixels of the level itself) into block + offset.
pub fn split_zoomed(zx: i64, zy: i64) -> BlockIndex {
    let bw = BLOCK_WIDTH as i64;
    let bh = BLOCK_HEIGHT as i64;
    BlockIndex {
        col: floor_div(zx, bw),
        row: floor_div(zy, bh),
        off_x: zx.rem_euclid(bw) as u32,
        off_y: zy.rem_euclid(bh) as u32,
    }
}

/// Map a world point to its block and in-block offset at `zoom`.
pub fn block_index(world_x: i64, world_y: i64, zoom: ZoomLevel) -> BlockIndex {
    let f = zoom.factor();
    split_zoomed(floor_div(world_x, f), floor_div(world_y, f))
}

/// World coordinate of a block's top-left corner. Inverse of [`block_index`]
/// up to the offset.
pub fn block_origin(col: i64, row: i64, zoom: ZoomLevel) -> (i64, i64) {
    let (sw, sh) = zoom.world_span();
    (col * sw, row * sh)
}

/// Axis-aligned rectangle in world (Full-level pixel) coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorldRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl WorldRect {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i64 {
        self.y + self.height
    }
}

/// Rectangle in destination-surface pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersect with a `width × height` surface anchored at the origin.
    pub fn clip_to(&self, width: u32, height: u32) -> PixelRect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        PixelRect {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// Half-open block ranges along both axes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub cols: Range<i64>,
    pub rows: Range<i64>,
}

impl BlockRange {
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty() || self.rows.is_empty()
    }

    /// Drop the part of the range below the grid origin.
    pub fn non_negative(&self) -> BlockRange {
        BlockRange {
            cols: self.cols.start.max(0)..self.cols.end.max(0),
            rows: self.rows.start.max(0)..self.rows.end.max(0),
        }
    }

    /// The range at the next coarser level covering the same blocks.
    pub fn coarser(&self) -> BlockRange {
        BlockRange {
            cols: floor_div(self.cols.start, ZOOM_STEP)..floor_div(self.cols.end - 1, ZOOM_STEP) + 1,
            rows: floor_div(self.rows.start, ZOOM_STEP)..floor_div(self.rows.end - 1, ZOOM_STEP) + 1,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.rows
            .clone()
            .flat_map(move |row| self.cols.clone().map(move |col| (col, row)))
    }
}

/// Blocks at `zoom` that intersect `rect`. Empty rects give an empty range.
pub fn blocks_overlapping(rect: &WorldRect, zoom: ZoomLevel) -> BlockRange {
    if rect.is_empty() {
        return BlockRange { cols: 0..0, rows: 0..0 };
    }
    let (sw, sh) = zoom.world_span();
    BlockRange {
        cols: floor_div(rect.x, sw)..floor_div(rect.right() - 1, sw) + 1,
        rows: floor_div(rect.y, sh)..floor_div(rect.bottom() - 1, sh) + 1,
    }
}

/// Number of blocks at `zoom` needed to cover `full_blocks` Full-level blocks.
pub fn level_extent(full_blocks: usize, zoom: ZoomLevel) -> usize {
    let f = zoom.factor() as usize;
    full_blocks.div_ceil(f)
}
