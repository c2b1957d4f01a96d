// ============================================================================
// SPARSE TILE GRID – growable 2-D array of tile descriptors for one zoom level
// ============================================================================

use image::Rgba;

use crate::error::{CacheError, Result};

/// Longest identifier accepted when no store says otherwise.
pub const DEFAULT_MAX_NAME_LEN: usize = 255;

/// Validated tile image identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileName(String);

impl TileName {
    /// Validate `name` against a store's maximum identifier length.
    pub fn new(name: impl Into<String>, max_len: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || name.len() > max_len
            || name.contains(['/', '\\'])
            || name.chars().any(|c| c.is_control())
        {
            return Err(CacheError::InvalidName(name));
        }
        Ok(Self(name))
    }

    /// Name for the tile with numeric id `id`.
    pub fn from_id(id: u64) -> Self {
        Self(format!("{}.png", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric id of a generated name (`"17.png"` → 17).
    pub fn numeric_id(&self) -> Option<u64> {
        self.0.strip_suffix(".png")?.parse().ok()
    }
}

impl std::fmt::Display for TileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content of one grid cell.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Tile {
    #[default]
    Empty,
    /// Uniformly colored block; no pixel buffer exists for it anywhere.
    Solid(Rgba<u8>),
    /// Block backed by a named image. `solid_hint` is the color the bitmap was
    /// flooded with when it was expanded from a solid tile.
    Named {
        name: TileName,
        solid_hint: Option<Rgba<u8>>,
    },
}

impl Tile {
    pub fn named(name: TileName) -> Self {
        Tile::Named { name, solid_hint: None }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Tile::Empty)
    }

    pub fn name(&self) -> Option<&TileName> {
        match self {
            Tile::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn solid_color(&self) -> Option<Rgba<u8>> {
        match self {
            Tile::Solid(c) => Some(*c),
            _ => None,
        }
    }
}

/// Returned by reference for cells outside the allocated array.
static EMPTY_TILE: Tile = Tile::Empty;

/// Sparse grid of tiles, addressed `(col, row)`, stored row-major in a flat
/// `Vec` that grows by doubling.
///
/// The logical `width`/`height` track the furthest populated block + 1 and can
/// be smaller than the allocation.
#[derive(Clone, Debug, Default)]
pub struct SparseTileGrid {
    cols: usize,
    rows: usize,
    cells: Vec<Tile>,
    width: usize,
    height: usize,
}

impl SparseTileGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical width in blocks.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Logical height in blocks.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Physical allocation `(cols, rows)`.
    pub fn allocated(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Extend the logical size without populating anything.
    pub fn extend_logical(&mut self, width: usize, height: usize) {
        self.width = self.width.max(width);
        self.height = self.height.max(height);
    }

    pub fn get(&self, col: i64, row: i64) -> &Tile {
        match self.flat_index(col, row) {
            Some(i) => &self.cells[i],
            None => &EMPTY_TILE,
        }
    }

    /// Grow the allocation to at least `min_cols × min_rows`, doubling each
    /// dimension that is too small. Existing cells keep their `(col, row)`.
    pub fn ensure_size(&mut self, min_cols: usize, min_rows: usize) {
        if min_cols <= self.cols && min_rows <= self.rows {
            return;
        }
        let new_cols = if min_cols > self.cols {
            min_cols.max(self.cols * 2)
        } else {
            self.cols
        };
        let new_rows = if min_rows > self.rows {
            min_rows.max(self.rows * 2)
        } else {
            self.rows
        };

        let mut cells = vec![Tile::Empty; new_cols * new_rows];
        for row in 0..self.rows {
            for col in 0..self.cols {
                cells[row * new_cols + col] = std::mem::take(&mut self.cells[row * self.cols + col]);
            }
        }
        self.cells = cells;
        self.cols = new_cols;
        self.rows = new_rows;
    }

    /// Store `tile` at `(col, row)`, growing as needed.
    pub fn set(&mut self, col: usize, row: usize, tile: Tile) {
        self.ensure_size(col + 1, row + 1);
        if !tile.is_empty() {
            self.extend_logical(col + 1, row + 1);
        }
        let i = row * self.cols + col;
        self.cells[i] = tile;
    }

    /// Empty a cell, returning what it held.
    pub fn clear_cell(&mut self, col: i64, row: i64) -> Tile {
        match self.flat_index(col, row) {
            Some(i) => std::mem::take(&mut self.cells[i]),
            None => Tile::Empty,
        }
    }

    /// Move every populated cell by `(dx, dy)` blocks. An empty grid stays
    /// empty, with a logical size of zero.
    ///
    /// Callers must make sure no populated cell lands on a negative index
    /// (see [`SparseTileGrid::min_populated`]).
    pub fn shift(&mut self, dx: i64, dy: i64) {
        if dx == 0 && dy == 0 {
            return;
        }
        let cols = self.cols;
        let mut moved: Vec<(i64, i64, Tile)> = Vec::new();
        for (i, cell) in self.cells.iter_mut().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let col = (i % cols) as i64;
            let row = (i / cols) as i64;
            moved.push((col + dx, row + dy, std::mem::take(cell)));
        }
        if moved.is_empty() {
            return;
        }

        for (col, row, tile) in moved {
            debug_assert!(col >= 0 && row >= 0, "shift moved a tile below the origin");
            if col < 0 || row < 0 {
                continue;
            }
            self.set(col as usize, row as usize, tile);
        }
        self.width = (self.width as i64 + dx).max(0) as usize;
        self.height = (self.height as i64 + dy).max(0) as usize;
    }

    /// Smallest populated `(col, row)` along each axis independently.
    pub fn min_populated(&self) -> Option<(usize, usize)> {
        self.populated().fold(None, |acc, (col, row, _)| match acc {
            None => Some((col, row)),
            Some((c, r)) => Some((c.min(col), r.min(row))),
        })
    }

    /// Iterator over non-empty cells as `(col, row, tile)`, row-major.
    pub fn populated(&self) -> impl Iterator<Item = (usize, usize, &Tile)> + '_ {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_empty())
            .map(move |(i, t)| (i % cols, i / cols, t))
    }

    /// Number of populated cells.
    pub fn tile_count(&self) -> usize {
        self.cells.iter().filter(|t| !t.is_empty()).count()
    }

    /// Drop every cell and the allocation itself.
    pub fn clear_all(&mut self) {
        *self = Self::default();
    }

    fn flat_index(&self, col: i64, row: i64) -> Option<usize> {
        if col < 0 || row < 0 || col as usize >= self.cols || row as usize >= self.rows {
            return None;
        }
        Some(row as usize * self.cols + col as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(v: u8) -> Tile {
        Tile::Solid(Rgba([v, v, v, 255]))
    }

    #[test]
    fn out_of_range_reads_are_empty() {
        let grid = SparseTileGrid::new();
        assert_eq!(grid.get(0, 0), &Tile::Empty);
        assert_eq!(grid.get(-3, 2), &Tile::Empty);
        assert_eq!(grid.get(1000, 1000), &Tile::Empty);
    }

    #[test]
    fn growth_doubles_and_preserves_cells() {
        let mut grid = SparseTileGrid::new();
        grid.set(1, 1, solid(1));
        assert_eq!(grid.allocated(), (2, 2));

        grid.set(2, 0, solid(2));
        assert_eq!(grid.allocated(), (4, 2));
        assert_eq!(grid.get(1, 1), &solid(1));
        assert_eq!(grid.get(2, 0), &solid(2));

        grid.ensure_size(1, 1);
        assert_eq!(grid.allocated(), (4, 2), "never shrinks");
    }

    #[test]
    fn logical_size_follows_writes_not_reservations() {
        let mut grid = SparseTileGrid::new();
        grid.ensure_size(10, 10);
        assert_eq!((grid.width(), grid.height()), (0, 0));

        grid.set(3, 5, solid(9));
        assert_eq!((grid.width(), grid.height()), (4, 6));

        grid.set(7, 7, Tile::Empty);
        assert_eq!((grid.width(), grid.height()), (4, 6));
    }

    #[test]
    fn clear_cell_returns_previous_content() {
        let mut grid = SparseTileGrid::new();
        grid.set(0, 0, solid(4));
        assert_eq!(grid.clear_cell(0, 0), solid(4));
        assert_eq!(grid.get(0, 0), &Tile::Empty);
        assert_eq!(grid.clear_cell(-1, 0), Tile::Empty);
    }

    #[test]
    fn shift_reindexes_populated_cells() {
        let mut grid = SparseTileGrid::new();
        grid.set(0, 0, solid(1));
        grid.set(1, 2, solid(2));

        grid.shift(3, 1);
        assert_eq!(grid.get(0, 0), &Tile::Empty);
        assert_eq!(grid.get(3, 1), &solid(1));
        assert_eq!(grid.get(4, 3), &solid(2));
        assert_eq!(grid.tile_count(), 2);
        assert_eq!(grid.min_populated(), Some((3, 1)));

        grid.shift(-3, -1);
        assert_eq!(grid.get(0, 0), &solid(1));
        assert_eq!(grid.get(1, 2), &solid(2));
    }

    #[test]
    fn shifting_an_empty_grid_keeps_zero_size() {
        let mut grid = SparseTileGrid::new();
        grid.shift(10, 10);
        assert_eq!((grid.width(), grid.height()), (0, 0));
        assert_eq!(grid.tile_count(), 0);

        grid.set(0, 1, solid(3));
        grid.shift(2, 0);
        assert_eq!((grid.width(), grid.height()), (3, 2));
    }

    #[test]
    fn names_are_validated() {
        assert!(TileName::new("12.png", DEFAULT_MAX_NAME_LEN).is_ok());
        assert!(matches!(TileName::new("", 255), Err(CacheError::InvalidName(_))));
        assert!(matches!(TileName::new("a/b.png", 255), Err(CacheError::InvalidName(_))));
        let long = "x".repeat(256);
        assert!(matches!(TileName::new(long, 255), Err(CacheError::InvalidName(_))));
        assert_eq!(TileName::from_id(17).numeric_id(), Some(17));
    }
}
