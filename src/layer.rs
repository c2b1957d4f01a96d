// ============================================================================
// LAYER – three zoom-level grids over one image cache
// ============================================================================
//
// The Full grid is authoritative. Normal and Tiny tiles are derived data:
// every write to the Full level clears the coarser blocks above it, and they
// are rebuilt from their 4×4 finer children the next time something renders
// or saves them.

use image::{Rgba, RgbaImage};

use crate::blob::BlobStore;
use crate::cache::{CachedImage, MruImageCache};
use crate::config::{CacheConfig, TileIdGen};
use crate::coords::{
    BLOCK_HEIGHT, BLOCK_WIDTH, BlockRange, PixelRect, WorldRect, ZOOM_STEP, ZoomLevel, block_index,
    block_origin, blocks_overlapping, floor_div, level_extent,
};
use crate::downsample::downsample;
use crate::error::{CacheError, Result};
use crate::grid::{SparseTileGrid, Tile, TileName};
use crate::io::{load_tile, store_tile};
use crate::pixels::{
    blend_region, copy_region, fill_region, is_fully_transparent, region_is, region_is_transparent,
    region_uniform_color, uniform_color,
};
use crate::record::{LayerManifest, PlacedObject, TileRecord};

const BW: i64 = BLOCK_WIDTH as i64;
const BH: i64 = BLOCK_HEIGHT as i64;

/// Which tiles a save emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Every non-empty tile of every level.
    #[default]
    Editable,
    /// Only the Normal level, with every block in the layer's extent
    /// synthesised first.
    Compiled,
}

/// Outcome of re-examining a bitmap tile after its pixels changed.
enum Collapse {
    Keep,
    Empty,
    Solid(Rgba<u8>),
}

/// A drawable layer: Full/Normal/Tiny tile grids, the image cache backing
/// them, the archive the images persist to, and the placed objects.
pub struct Layer {
    grids: [SparseTileGrid; 3],
    cache: MruImageCache,
    archive: Box<dyn BlobStore>,
    /// Archive being moved away from during [`Layer::save_as`]; tiles the new
    /// archive does not hold yet are read from here.
    previous: Option<Box<dyn BlobStore>>,
    ids: TileIdGen,
    objects: Vec<PlacedObject>,
}

impl Layer {
    /// An empty layer persisting into `archive`.
    pub fn new(config: &CacheConfig, archive: Box<dyn BlobStore>, ids: TileIdGen) -> Result<Self> {
        Ok(Self {
            grids: Default::default(),
            cache: MruImageCache::new(config.max_resident_images, config.spill_store()?),
            archive,
            previous: None,
            ids,
            objects: Vec::new(),
        })
    }

    /// Rebuild a layer from its manifest. No images are read until used.
    ///
    /// Every record is checked before anything is built, so a bad name fails
    /// with [`CacheError::InvalidName`] and leaves nothing half-loaded.
    pub fn load(
        config: &CacheConfig,
        archive: Box<dyn BlobStore>,
        ids: TileIdGen,
        manifest: &LayerManifest,
    ) -> Result<Self> {
        manifest.validate()?;
        let max_len = archive.max_name_len();

        let mut placed = Vec::with_capacity(manifest.tiles.len());
        for rec in &manifest.tiles {
            let zoom = rec
                .zoom_level()
                .ok_or_else(|| CacheError::InvalidFormat(format!("Bad zoom in {}", rec)))?;
            let tile = match (&rec.name, rec.color) {
                (Some(name), None) => Tile::named(TileName::new(name.clone(), max_len)?),
                (None, Some(c)) => Tile::Solid(Rgba(c)),
                _ => return Err(CacheError::InvalidFormat(format!("Ambiguous tile {}", rec))),
            };
            let (col, row) = rec.block();
            placed.push((zoom, col as usize, row as usize, tile));
        }
        if let Some(id) = manifest.max_tile_id() {
            ids.ensure_above(id);
        }

        let mut layer = Self::new(config, archive, ids)?;
        for (zoom, col, row, tile) in placed {
            layer.grids[zoom.index()].set(col, row, tile);
        }
        layer.objects = manifest.objects.clone();
        log::debug!(
            "Loaded layer with {} tiles and {} objects",
            manifest.tiles.len(),
            manifest.objects.len()
        );
        Ok(layer)
    }

    // ---- accessors ------------------------------------------------------------

    pub fn grid(&self, zoom: ZoomLevel) -> &SparseTileGrid {
        &self.grids[zoom.index()]
    }

    pub fn tile(&self, zoom: ZoomLevel, col: i64, row: i64) -> &Tile {
        self.grids[zoom.index()].get(col, row)
    }

    /// Tile containing a world point at `zoom`.
    pub fn tile_at(&self, world_x: i64, world_y: i64, zoom: ZoomLevel) -> &Tile {
        let idx = block_index(world_x, world_y, zoom);
        self.tile(zoom, idx.col, idx.row)
    }

    /// Width of the layer in Full-level blocks.
    pub fn width(&self) -> usize {
        self.grids[0].width()
    }

    /// Height of the layer in Full-level blocks.
    pub fn height(&self) -> usize {
        self.grids[0].height()
    }

    /// Blocks `(cols, rows)` a level spans: the Full extent scaled down,
    /// or more if that level holds tiles further out.
    pub fn extent(&self, zoom: ZoomLevel) -> (usize, usize) {
        let grid = &self.grids[zoom.index()];
        (
            level_extent(self.width(), zoom).max(grid.width()),
            level_extent(self.height(), zoom).max(grid.height()),
        )
    }

    pub fn cache(&self) -> &MruImageCache {
        &self.cache
    }

    pub fn archive(&self) -> &dyn BlobStore {
        self.archive.as_ref()
    }

    pub fn archive_mut(&mut self) -> &mut dyn BlobStore {
        self.archive.as_mut()
    }

    /// Give up the layer and keep its archive.
    pub fn into_archive(self) -> Box<dyn BlobStore> {
        self.archive
    }

    pub fn ids(&self) -> &TileIdGen {
        &self.ids
    }

    pub fn objects(&self) -> &[PlacedObject] {
        &self.objects
    }

    pub fn add_object(&mut self, object: PlacedObject) {
        self.objects.push(object);
    }

    // ---- editing --------------------------------------------------------------

    /// Paste `src` into the Full level with its top-left at a world point.
    ///
    /// Pixels are copied, alpha included. Blocks that end up one color become
    /// solid tiles, blocks that end up fully transparent are removed, and the
    /// Normal/Tiny blocks above every touched block are cleared. Parts of
    /// the image at negative world coordinates are dropped.
    pub fn insert_image(&mut self, src: &RgbaImage, world_x: i64, world_y: i64) -> Result<()> {
        let (sw, sh) = src.dimensions();
        if sw == 0 || sh == 0 {
            return Ok(());
        }
        let x0 = world_x.max(0);
        let y0 = world_y.max(0);
        let x1 = world_x + sw as i64;
        let y1 = world_y + sh as i64;
        if x1 <= x0 || y1 <= y0 {
            return Ok(());
        }

        let range = blocks_overlapping(&WorldRect::new(x0, y0, x1 - x0, y1 - y0), ZoomLevel::Full);
        let block_count = (range.cols.end - range.cols.start) * (range.rows.end - range.rows.start);
        self.check_name_room(block_count as u64)?;
        // Coarser blocks go first so a write failing halfway cannot leave
        // them showing the old pixels.
        self.invalidate_coarser(&range)?;

        for (col, row) in range.iter() {
            let (bx, by) = block_origin(col, row, ZoomLevel::Full);
            let ox0 = bx.max(x0);
            let oy0 = by.max(y0);
            let ox1 = (bx + BW).min(x1);
            let oy1 = (by + BH).min(y1);
            let region = BlockWrite {
                sx: (ox0 - world_x) as u32,
                sy: (oy0 - world_y) as u32,
                w: (ox1 - ox0) as u32,
                h: (oy1 - oy0) as u32,
                dx: (ox0 - bx) as u32,
                dy: (oy0 - by) as u32,
            };
            self.write_block(col as usize, row as usize, src, region)?;
        }
        log::debug!(
            "Inserted {}x{} image at ({}, {}) over {} blocks",
            sw,
            sh,
            world_x,
            world_y,
            block_count
        );
        Ok(())
    }

    /// Flood every Full block overlapping `rect` with `color` (block-granular).
    /// A fully transparent color empties the blocks instead.
    pub fn fill_rect(&mut self, rect: &WorldRect, color: Rgba<u8>) -> Result<()> {
        let range = blocks_overlapping(rect, ZoomLevel::Full).non_negative();
        if range.is_empty() {
            return Ok(());
        }
        for (col, row) in range.iter() {
            self.remove_tile(ZoomLevel::Full, col, row)?;
            if color[3] != 0 {
                self.grids[0].set(col as usize, row as usize, Tile::Solid(color));
            }
        }
        self.invalidate_coarser(&range)
    }

    /// Empty every tile, at every level, that overlaps `rect`.
    pub fn clear_region(&mut self, rect: &WorldRect) -> Result<()> {
        for zoom in ZoomLevel::ALL {
            let range = blocks_overlapping(rect, zoom).non_negative();
            for (col, row) in range.iter() {
                self.remove_tile(zoom, col, row)?;
            }
        }
        Ok(())
    }

    /// Remove every tile and object.
    pub fn clear(&mut self) -> Result<()> {
        for zoom in ZoomLevel::ALL {
            self.clear_level(zoom)?;
        }
        self.cache.discard_all()?;
        self.objects.clear();
        Ok(())
    }

    /// Move the whole layer by a world offset.
    ///
    /// The offset must be a whole number of Full blocks. Normal and Tiny
    /// tiles move along only when the offset is also a whole number of their
    /// own blocks; otherwise that level is dropped and rebuilt on demand.
    pub fn shift(&mut self, world_dx: i64, world_dy: i64) -> Result<()> {
        let (fw, fh) = ZoomLevel::Full.world_span();
        if world_dx % fw != 0 || world_dy % fh != 0 {
            return Err(CacheError::MisalignedShift { dx: world_dx, dy: world_dy });
        }
        let (bdx, bdy) = (world_dx / fw, world_dy / fh);
        if !self.can_shift(ZoomLevel::Full, bdx, bdy) {
            return Err(CacheError::ShiftOutOfBounds { dx: world_dx, dy: world_dy });
        }

        for obj in &mut self.objects {
            obj.x += world_dx;
            obj.y += world_dy;
        }
        self.grids[0].shift(bdx, bdy);

        for zoom in [ZoomLevel::Normal, ZoomLevel::Tiny] {
            let (sw, sh) = zoom.world_span();
            let aligned = world_dx % sw == 0 && world_dy % sh == 0;
            if aligned && self.can_shift(zoom, world_dx / sw, world_dy / sh) {
                self.grids[zoom.index()].shift(world_dx / sw, world_dy / sh);
            } else {
                self.clear_level(zoom)?;
            }
        }
        log::debug!("Shifted layer by ({}, {})", world_dx, world_dy);
        Ok(())
    }

    // ---- rendering ------------------------------------------------------------

    /// Draw the layer into `dest_rect` of `dest` at `zoom`.
    ///
    /// The top-left of `dest_rect` shows the world point `(world_x, world_y)`;
    /// each destination pixel is one pixel of the chosen level. Missing
    /// Normal/Tiny tiles are synthesised on the way. With `blend` the tiles
    /// are composited over `dest`, otherwise they replace it.
    pub fn render(
        &mut self,
        dest: &mut RgbaImage,
        world_x: i64,
        world_y: i64,
        dest_rect: PixelRect,
        zoom: ZoomLevel,
        blend: bool,
    ) -> Result<()> {
        let dr = dest_rect.clip_to(dest.width(), dest.height());
        if dr.is_empty() {
            return Ok(());
        }
        let f = zoom.factor();
        let zx0 = floor_div(world_x, f);
        let zy0 = floor_div(world_y, f);
        let zx1 = zx0 + dr.width as i64;
        let zy1 = zy0 + dr.height as i64;
        let (ext_w, ext_h) = self.extent(zoom);

        let rows = floor_div(zy0, BH).max(0)..(floor_div(zy1 - 1, BH) + 1).min(ext_h as i64);
        let cols = floor_div(zx0, BW).max(0)..(floor_div(zx1 - 1, BW) + 1).min(ext_w as i64);
        for row in rows {
            for col in cols.clone() {
                let (bx, by) = (col * BW, row * BH);
                let ox0 = bx.max(zx0);
                let oy0 = by.max(zy0);
                let ox1 = (bx + BW).min(zx1);
                let oy1 = (by + BH).min(zy1);
                let region = BlockWrite {
                    sx: (ox0 - bx) as u32,
                    sy: (oy0 - by) as u32,
                    w: (ox1 - ox0) as u32,
                    h: (oy1 - oy0) as u32,
                    dx: dr.x + (ox0 - zx0) as u32,
                    dy: dr.y + (oy0 - zy0) as u32,
                };
                self.paint_block(dest, zoom, col, row, region, blend)?;
            }
        }
        Ok(())
    }

    /// Render a world rectangle into a new image at `zoom`.
    pub fn render_to_image(&mut self, rect: &WorldRect, zoom: ZoomLevel) -> Result<RgbaImage> {
        if rect.is_empty() {
            return Ok(RgbaImage::new(0, 0));
        }
        let f = zoom.factor();
        let w = (floor_div(rect.right() - 1, f) - floor_div(rect.x, f) + 1) as u32;
        let h = (floor_div(rect.bottom() - 1, f) - floor_div(rect.y, f) + 1) as u32;
        let mut out = RgbaImage::new(w, h);
        self.render(&mut out, rect.x, rect.y, PixelRect::new(0, 0, w, h), zoom, false)?;
        Ok(out)
    }

    /// Make sure the Normal/Tiny tile at `(col, row)` exists if its finer
    /// children have any content. Full tiles are never synthesised.
    pub fn synthesize(&mut self, zoom: ZoomLevel, col: i64, row: i64) -> Result<()> {
        let Some(finer) = zoom.finer() else {
            return Ok(());
        };
        if col < 0 || row < 0 || !self.tile(zoom, col, row).is_empty() {
            return Ok(());
        }

        let (fw, fh) = self.extent(finer);
        let mut children: Vec<(u32, u32, Tile)> = Vec::new();
        for yi in 0..ZOOM_STEP {
            for xi in 0..ZOOM_STEP {
                let (cc, cr) = (col * ZOOM_STEP + xi, row * ZOOM_STEP + yi);
                if cc >= fw as i64 || cr >= fh as i64 {
                    continue;
                }
                if finer != ZoomLevel::Full {
                    self.synthesize(finer, cc, cr)?;
                }
                let child = self.tile(finer, cc, cr);
                if !child.is_empty() {
                    children.push((xi as u32, yi as u32, child.clone()));
                }
            }
        }
        if children.is_empty() {
            return Ok(());
        }

        // All sixteen children solid and alike: no bitmap needed at all.
        if children.len() == (ZOOM_STEP * ZOOM_STEP) as usize
            && let Some(c) = children[0].2.solid_color()
            && children.iter().all(|(_, _, t)| t.solid_color() == Some(c))
        {
            self.grids[zoom.index()].set(col as usize, row as usize, Tile::Solid(c));
            log::debug!("Synthesised solid {} tile ({}, {})", zoom, col, row);
            return Ok(());
        }

        let cw = BLOCK_WIDTH / ZOOM_STEP as u32;
        let ch = BLOCK_HEIGHT / ZOOM_STEP as u32;
        let mut pixels = RgbaImage::new(BLOCK_WIDTH, BLOCK_HEIGHT);
        for (xi, yi, child) in children {
            match child {
                Tile::Empty => {}
                Tile::Solid(c) => fill_region(&mut pixels, xi * cw, yi * ch, cw, ch, c, false),
                Tile::Named { name, .. } => {
                    let reduced = {
                        let image = fetch_tile(
                            &mut self.cache,
                            self.archive.as_ref(),
                            self.previous.as_deref(),
                            &name,
                        )?;
                        downsample(&image.pixels)
                    };
                    copy_region(&reduced, 0, 0, cw, ch, &mut pixels, xi * cw, yi * ch);
                }
            }
        }

        if is_fully_transparent(&pixels) {
            return Ok(());
        }
        if let Some(c) = uniform_color(&pixels) {
            self.grids[zoom.index()].set(col as usize, row as usize, Tile::Solid(c));
            return Ok(());
        }
        let name = self.new_name()?;
        self.grids[zoom.index()].set(col as usize, row as usize, Tile::named(name.clone()));
        self.cache.insert(CachedImage { name, pixels, dirty: true })?;
        log::debug!("Synthesised {} tile ({}, {})", zoom, col, row);
        Ok(())
    }

    // ---- persistence ----------------------------------------------------------

    /// Write every changed tile image to the archive and describe the layer.
    ///
    /// Not atomic: if a write fails the save stops there and earlier blobs
    /// stay written.
    pub fn save(&mut self) -> Result<LayerManifest> {
        self.save_with(SaveMode::Editable)
    }

    /// Save a compiled (Normal-level only) view of the layer into its archive.
    pub fn save_compiled(&mut self) -> Result<LayerManifest> {
        self.save_with(SaveMode::Compiled)
    }

    /// Save into a new archive, copying every tile across, and adopt it.
    /// On failure the layer keeps its old archive.
    pub fn save_as(&mut self, store: Box<dyn BlobStore>) -> Result<LayerManifest> {
        self.previous = Some(std::mem::replace(&mut self.archive, store));
        let saved = self.save_with(SaveMode::Editable);
        let previous = self.previous.take();
        if saved.is_err()
            && let Some(old) = previous
        {
            self.archive = old;
        }
        saved
    }

    /// Save the tiles `mode` selects into the archive.
    pub fn save_with(&mut self, mode: SaveMode) -> Result<LayerManifest> {
        let levels: &[ZoomLevel] = match mode {
            SaveMode::Editable => &ZoomLevel::ALL,
            SaveMode::Compiled => &[ZoomLevel::Normal],
        };

        let mut manifest = LayerManifest::default();
        let mut written = 0usize;
        let mut pruned = 0usize;
        for &zoom in levels {
            if mode == SaveMode::Compiled {
                let (w, h) = self.extent(zoom);
                for row in 0..h as i64 {
                    for col in 0..w as i64 {
                        self.synthesize(zoom, col, row)?;
                    }
                }
            }

            let cells: Vec<(usize, usize, Tile)> = self.grids[zoom.index()]
                .populated()
                .map(|(c, r, t)| (c, r, t.clone()))
                .collect();
            for (col, row, tile) in cells {
                let x = col as i64 * BW;
                let y = row as i64 * BH;
                match tile {
                    Tile::Empty => {}
                    Tile::Solid(c) => manifest.tiles.push(TileRecord {
                        name: None,
                        color: Some(c.0),
                        x,
                        y,
                        zoom: zoom.factor(),
                    }),
                    Tile::Named { name, .. } => {
                        let image = fetch_tile(
                            &mut self.cache,
                            self.archive.as_ref(),
                            self.previous.as_deref(),
                            &name,
                        )?;
                        if is_fully_transparent(&image.pixels) {
                            self.remove_tile(zoom, col as i64, row as i64)?;
                            pruned += 1;
                            continue;
                        }
                        if image.dirty || !self.archive.contains(name.as_str()) {
                            store_tile(self.archive.as_mut(), name.as_str(), &image.pixels)?;
                            image.dirty = false;
                            written += 1;
                        }
                        self.cache.forget_spill(&name)?;
                        manifest.tiles.push(TileRecord {
                            name: Some(name.to_string()),
                            color: None,
                            x,
                            y,
                            zoom: zoom.factor(),
                        });
                    }
                }
            }
        }
        manifest.objects = self.objects.clone();
        log::info!(
            "Saved layer: {} records, {} images written, {} pruned",
            manifest.tiles.len(),
            written,
            pruned
        );
        Ok(manifest)
    }

    // ---- internals ------------------------------------------------------------

    fn write_block(&mut self, col: usize, row: usize, src: &RgbaImage, r: BlockWrite) -> Result<()> {
        let covers_block = r.w == BLOCK_WIDTH && r.h == BLOCK_HEIGHT;
        let current = self.grids[0].get(col as i64, row as i64).clone();
        match current {
            Tile::Empty => {
                if region_is_transparent(src, r.sx, r.sy, r.w, r.h) {
                    return Ok(());
                }
                if covers_block && let Some(c) = region_uniform_color(src, r.sx, r.sy, r.w, r.h) {
                    self.grids[0].set(col, row, Tile::Solid(c));
                    return Ok(());
                }
                let mut pixels = RgbaImage::new(BLOCK_WIDTH, BLOCK_HEIGHT);
                copy_region(src, r.sx, r.sy, r.w, r.h, &mut pixels, r.dx, r.dy);
                let name = self.new_name()?;
                self.grids[0].set(col, row, Tile::named(name.clone()));
                self.cache.insert(CachedImage { name, pixels, dirty: true })?;
            }
            Tile::Solid(c) => {
                if region_is(src, r.sx, r.sy, r.w, r.h, c) {
                    return Ok(());
                }
                if covers_block {
                    if region_is_transparent(src, r.sx, r.sy, r.w, r.h) {
                        self.grids[0].clear_cell(col as i64, row as i64);
                        return Ok(());
                    }
                    if let Some(nc) = region_uniform_color(src, r.sx, r.sy, r.w, r.h) {
                        self.grids[0].set(col, row, Tile::Solid(nc));
                        return Ok(());
                    }
                }
                let mut pixels = RgbaImage::from_pixel(BLOCK_WIDTH, BLOCK_HEIGHT, c);
                copy_region(src, r.sx, r.sy, r.w, r.h, &mut pixels, r.dx, r.dy);
                let name = self.new_name()?;
                self.grids[0].set(col, row, Tile::Named { name: name.clone(), solid_hint: Some(c) });
                self.cache.insert(CachedImage { name, pixels, dirty: true })?;
            }
            Tile::Named { name, .. } => {
                let image = fetch_tile(
                    &mut self.cache,
                    self.archive.as_ref(),
                    self.previous.as_deref(),
                    &name,
                )?;
                copy_region(src, r.sx, r.sy, r.w, r.h, &mut image.pixels, r.dx, r.dy);
                image.dirty = true;
            }
        }
        self.collapse_block(ZoomLevel::Full, col, row)
    }

    /// Turn a bitmap tile that became uniform into a solid tile, or one that
    /// became fully transparent into an empty cell.
    fn collapse_block(&mut self, zoom: ZoomLevel, col: usize, row: usize) -> Result<()> {
        let Tile::Named { name, solid_hint } = self.grids[zoom.index()].get(col as i64, row as i64).clone() else {
            return Ok(());
        };
        let verdict = {
            let image = fetch_tile(
                &mut self.cache,
                self.archive.as_ref(),
                self.previous.as_deref(),
                &name,
            )?;
            if is_fully_transparent(&image.pixels) {
                Collapse::Empty
            } else {
                let uniform = match solid_hint {
                    Some(c) if region_is(&image.pixels, 0, 0, BLOCK_WIDTH, BLOCK_HEIGHT, c) => Some(c),
                    _ => uniform_color(&image.pixels),
                };
                match uniform {
                    Some(c) => Collapse::Solid(c),
                    None => Collapse::Keep,
                }
            }
        };
        match verdict {
            Collapse::Keep => Ok(()),
            Collapse::Empty => self.remove_tile(zoom, col as i64, row as i64),
            Collapse::Solid(c) => {
                self.remove_tile(zoom, col as i64, row as i64)?;
                self.grids[zoom.index()].set(col, row, Tile::Solid(c));
                Ok(())
            }
        }
    }

    fn paint_block(
        &mut self,
        dest: &mut RgbaImage,
        zoom: ZoomLevel,
        col: i64,
        row: i64,
        r: BlockWrite,
        blend: bool,
    ) -> Result<()> {
        if zoom != ZoomLevel::Full && self.tile(zoom, col, row).is_empty() {
            self.synthesize(zoom, col, row)?;
        }
        match self.tile(zoom, col, row).clone() {
            Tile::Empty => {}
            Tile::Solid(c) => fill_region(dest, r.dx, r.dy, r.w, r.h, c, blend),
            Tile::Named { name, .. } => {
                let image = fetch_tile(
                    &mut self.cache,
                    self.archive.as_ref(),
                    self.previous.as_deref(),
                    &name,
                )?;
                if blend {
                    blend_region(&image.pixels, r.sx, r.sy, r.w, r.h, dest, r.dx, r.dy);
                } else {
                    copy_region(&image.pixels, r.sx, r.sy, r.w, r.h, dest, r.dx, r.dy);
                }
            }
        }
        Ok(())
    }

    /// Clear the Normal and Tiny blocks covering a range of Full blocks.
    fn invalidate_coarser(&mut self, full: &BlockRange) -> Result<()> {
        if full.is_empty() {
            return Ok(());
        }
        let normal = full.coarser();
        let tiny = normal.coarser();
        for (col, row) in normal.iter() {
            self.remove_tile(ZoomLevel::Normal, col, row)?;
        }
        for (col, row) in tiny.iter() {
            self.remove_tile(ZoomLevel::Tiny, col, row)?;
        }
        Ok(())
    }

    /// Empty one cell, dropping its cached image and any stored blobs.
    fn remove_tile(&mut self, zoom: ZoomLevel, col: i64, row: i64) -> Result<()> {
        if let Tile::Named { name, .. } = self.grids[zoom.index()].clear_cell(col, row) {
            self.cache.remove_and_discard(&name)?;
            self.archive.delete(name.as_str())?;
        }
        Ok(())
    }

    fn clear_level(&mut self, zoom: ZoomLevel) -> Result<()> {
        let cells: Vec<(usize, usize)> = self.grids[zoom.index()]
            .populated()
            .map(|(c, r, _)| (c, r))
            .collect();
        for (col, row) in cells {
            self.remove_tile(zoom, col as i64, row as i64)?;
        }
        self.grids[zoom.index()].clear_all();
        Ok(())
    }

    fn can_shift(&self, zoom: ZoomLevel, dx: i64, dy: i64) -> bool {
        match self.grids[zoom.index()].min_populated() {
            Some((c, r)) => c as i64 + dx >= 0 && r as i64 + dy >= 0,
            None => true,
        }
    }

    fn new_name(&self) -> Result<TileName> {
        TileName::new(self.ids.next_name().to_string(), self.archive.max_name_len())
    }

    /// Fail up front if the next `count` generated names would not fit the archive.
    fn check_name_room(&self, count: u64) -> Result<()> {
        let worst = TileName::from_id(self.ids.peek() + count.saturating_sub(1));
        TileName::new(worst.to_string(), self.archive.max_name_len()).map(|_| ())
    }
}

/// A rectangle copy between a block and an outside image: source origin,
/// size, destination origin.
#[derive(Clone, Copy, Debug)]
struct BlockWrite {
    sx: u32,
    sy: u32,
    w: u32,
    h: u32,
    dx: u32,
    dy: u32,
}

/// Fetch a tile image through the cache, reading misses from `archive`
/// (or from `fallback` for blobs the archive does not hold yet).
fn fetch_tile<'a>(
    cache: &'a mut MruImageCache,
    archive: &dyn BlobStore,
    fallback: Option<&dyn BlobStore>,
    name: &TileName,
) -> Result<&'a mut CachedImage> {
    cache.fetch(name, || match fallback {
        Some(old) if !archive.contains(name.as_str()) => load_tile(old, name.as_str()),
        _ => load_tile(archive, name.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

    fn layer() -> Layer {
        layer_with_capacity(64)
    }

    fn layer_with_capacity(max: usize) -> Layer {
        let config = CacheConfig { max_resident_images: max, base_path: None };
        Layer::new(&config, Box::new(MemoryBlobStore::new()), TileIdGen::new()).unwrap()
    }

    fn noise(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 7) as u8, (y * 13) as u8, (x + y) as u8, 255]))
    }

    #[test]
    fn red_square_becomes_solid_blocks() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(256, 256, RED), 0, 0).unwrap();
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 8);
        for row in 0..4 {
            for col in 0..2 {
                assert_eq!(l.tile(ZoomLevel::Full, col, row), &Tile::Solid(RED));
            }
        }
        assert_eq!((l.width(), l.height()), (2, 4));
        assert!(l.cache().is_empty(), "solid tiles hold no images");
    }

    #[test]
    fn zero_area_insert_is_a_no_op() {
        let mut l = layer();
        l.insert_image(&RgbaImage::new(0, 10), 5, 5).unwrap();
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 0);
        assert_eq!(l.ids().peek(), 1);
    }

    #[test]
    fn unaligned_insert_round_trips_through_render() {
        let mut l = layer();
        let img = noise(300, 100);
        l.insert_image(&img, 50, 30).unwrap();
        // 50..350 spans blocks 0..=2, 30..130 spans rows 0..=2
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 9);

        let out = l.render_to_image(&WorldRect::new(50, 30, 300, 100), ZoomLevel::Full).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn transparent_insert_leaves_no_tiles() {
        let mut l = layer();
        l.insert_image(&RgbaImage::new(200, 90), 0, 0).unwrap();
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 0);
    }

    #[test]
    fn overwriting_with_one_color_collapses_to_solid() {
        let mut l = layer();
        l.insert_image(&noise(128, 64), 0, 0).unwrap();
        let name = l.tile(ZoomLevel::Full, 0, 0).name().cloned().unwrap();
        assert!(l.cache().contains(&name));

        l.insert_image(&RgbaImage::from_pixel(128, 64, BLUE), 0, 0).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Solid(BLUE));
        assert!(!l.cache().contains(&name));

        // Erasing a partial bitmap back to transparent empties the cell.
        l.insert_image(&noise(10, 10), 0, 0).unwrap();
        assert!(l.tile(ZoomLevel::Full, 0, 0).name().is_some());
        l.insert_image(&RgbaImage::new(128, 64), 0, 0).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Empty);
    }

    #[test]
    fn partial_write_expands_a_solid_tile() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(128, 64, RED), 0, 0).unwrap();
        l.insert_image(&RgbaImage::from_pixel(4, 4, BLUE), 10, 10).unwrap();
        match l.tile(ZoomLevel::Full, 0, 0) {
            Tile::Named { solid_hint, .. } => assert_eq!(*solid_hint, Some(RED)),
            other => panic!("expected bitmap tile, got {:?}", other),
        }
        let out = l.render_to_image(&WorldRect::new(0, 0, 128, 64), ZoomLevel::Full).unwrap();
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(*out.get_pixel(11, 12), BLUE);

        // Same color over a solid tile touches nothing.
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(128, 64, RED), 0, 0).unwrap();
        l.insert_image(&RgbaImage::from_pixel(3, 3, RED), 1, 1).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Solid(RED));
    }

    #[test]
    fn normal_render_synthesises_solid_without_buffers() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(512, 256, RED), 0, 0).unwrap();
        let out = l.render_to_image(&WorldRect::new(0, 0, 512, 256), ZoomLevel::Normal).unwrap();
        assert_eq!(out.dimensions(), (128, 64));
        assert!(out.pixels().all(|p| *p == RED));
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Solid(RED));
        assert!(l.cache().is_empty());
        assert_eq!(l.ids().peek(), 1, "no tile image was ever named");
    }

    #[test]
    fn partially_covered_normal_tile_is_a_bitmap() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(256, 256, RED), 0, 0).unwrap();
        let out = l.render_to_image(&WorldRect::new(0, 0, 512, 256), ZoomLevel::Normal).unwrap();
        assert_eq!(*out.get_pixel(0, 0), RED);
        assert_eq!(*out.get_pixel(63, 63), RED);
        assert_eq!(*out.get_pixel(64, 0), Rgba([0, 0, 0, 0]));
        assert!(l.tile(ZoomLevel::Normal, 0, 0).name().is_some());
    }

    #[test]
    fn tiny_render_cascades_through_normal() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(2048, 1024, BLUE), 0, 0).unwrap();
        l.insert_image(&noise(64, 64), 0, 0).unwrap();
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Empty);

        let out = l.render_to_image(&WorldRect::new(0, 0, 2048, 1024), ZoomLevel::Tiny).unwrap();
        assert_eq!(out.dimensions(), (128, 64));
        // The intermediate Normal level was populated along the way.
        assert!(l.tile(ZoomLevel::Normal, 0, 0).name().is_some());
        assert_eq!(l.tile(ZoomLevel::Normal, 3, 3), &Tile::Solid(BLUE));
        assert!(l.tile(ZoomLevel::Tiny, 0, 0).name().is_some());
        assert_eq!(*out.get_pixel(127, 63), BLUE);
    }

    #[test]
    fn full_writes_invalidate_coarser_levels() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(2048, 1024, BLUE), 0, 0).unwrap();
        l.render_to_image(&WorldRect::new(0, 0, 2048, 1024), ZoomLevel::Tiny).unwrap();
        assert_eq!(l.tile(ZoomLevel::Tiny, 0, 0), &Tile::Solid(BLUE));

        l.insert_image(&RgbaImage::from_pixel(128, 64, RED), 1024, 512).unwrap();
        assert_eq!(l.tile(ZoomLevel::Tiny, 0, 0), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Normal, 2, 2), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Solid(BLUE));
    }

    #[test]
    fn aligned_shift_keeps_tiny_tiles_and_misaligned_drops_them() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(2048, 1024, BLUE), 0, 0).unwrap();
        l.render_to_image(&WorldRect::new(0, 0, 2048, 1024), ZoomLevel::Tiny).unwrap();

        l.shift(2048, 1024).unwrap();
        assert_eq!(l.tile(ZoomLevel::Tiny, 1, 1), &Tile::Solid(BLUE));
        assert_eq!(l.tile(ZoomLevel::Tiny, 0, 0), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Full, 16, 16), &Tile::Solid(BLUE));

        l.shift(128, 0).unwrap();
        assert_eq!(l.grid(ZoomLevel::Tiny).tile_count(), 0);
        assert_eq!(l.grid(ZoomLevel::Normal).tile_count(), 0);
        assert_eq!(l.tile(ZoomLevel::Full, 17, 16), &Tile::Solid(BLUE));
    }

    #[test]
    fn shift_rejects_bad_offsets_without_mutating() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(128, 64, RED), 0, 0).unwrap();
        assert!(matches!(l.shift(5, 0), Err(CacheError::MisalignedShift { .. })));
        assert!(matches!(l.shift(-128, 0), Err(CacheError::ShiftOutOfBounds { .. })));
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Solid(RED));
    }

    #[test]
    fn shifting_an_empty_layer_keeps_zero_extent() {
        let mut l = layer();
        l.shift(1280, 640).unwrap();
        assert_eq!((l.width(), l.height()), (0, 0));
        assert_eq!(l.extent(ZoomLevel::Normal), (0, 0));
        assert_eq!(l.save_compiled().unwrap().tiles.len(), 0);
    }

    #[test]
    fn failed_insert_still_invalidates_coarser_levels() {
        struct NoSpace;
        impl BlobStore for NoSpace {
            fn contains(&self, _: &str) -> bool {
                false
            }
            fn read(&self, name: &str) -> Result<Box<dyn std::io::Read + '_>> {
                Err(CacheError::NotFound(name.into()))
            }
            fn write(&mut self, _: &str, _: usize) -> Result<Box<dyn std::io::Write + '_>> {
                Err(CacheError::Persistence("no space left on device".into()))
            }
            fn delete(&mut self, _: &str) -> Result<()> {
                Ok(())
            }
            fn names(&self) -> Vec<String> {
                Vec::new()
            }
        }

        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(2048, 1024, BLUE), 0, 0).unwrap();
        l.render_to_image(&WorldRect::new(0, 0, 2048, 1024), ZoomLevel::Tiny).unwrap();
        assert_eq!(l.tile(ZoomLevel::Tiny, 0, 0), &Tile::Solid(BLUE));

        // Two images fit; the third forces a spill that cannot be written.
        l.cache = MruImageCache::new(2, Box::new(NoSpace));
        let err = l.insert_image(&noise(384, 64), 0, 0).unwrap_err();
        assert!(matches!(err, CacheError::Persistence(_)), "{}", err);

        assert!(l.tile(ZoomLevel::Full, 0, 0).name().is_some());
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Tiny, 0, 0), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Normal, 1, 0), &Tile::Solid(BLUE));
    }

    fn load_single(archive: MemoryBlobStore, name: &str) -> Layer {
        let manifest = LayerManifest {
            tiles: vec![TileRecord { name: Some(name.into()), color: None, x: 0, y: 0, zoom: 1 }],
            ..Default::default()
        };
        Layer::load(&CacheConfig::default(), Box::new(archive), TileIdGen::new(), &manifest).unwrap()
    }

    #[test]
    fn corrupt_blob_leaves_the_tile_untouched() {
        let mut archive = MemoryBlobStore::new();
        crate::blob::write_blob(&mut archive, "1.png", b"not a png").unwrap();
        let mut l = load_single(archive, "1.png");

        let err = l.render_to_image(&WorldRect::new(0, 0, 128, 64), ZoomLevel::Full).unwrap_err();
        assert!(matches!(err, CacheError::ImageLoad { .. }), "{}", err);
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0).name().map(|n| n.as_str()), Some("1.png"));
        assert!(l.cache().is_empty());

        // Synthesis over it fails the same way and names nothing.
        let err = l.render_to_image(&WorldRect::new(0, 0, 512, 256), ZoomLevel::Normal).unwrap_err();
        assert!(matches!(err, CacheError::ImageLoad { .. }), "{}", err);
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Empty);
        assert_eq!(l.ids().peek(), 2);

        assert!(matches!(l.save(), Err(CacheError::ImageLoad { .. })));
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0).name().map(|n| n.as_str()), Some("1.png"));
    }

    #[test]
    fn missing_blob_is_not_found_on_render_and_save() {
        let mut l = load_single(MemoryBlobStore::new(), "2.png");
        let err = l.render_to_image(&WorldRect::new(0, 0, 128, 64), ZoomLevel::Full).unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)), "{}", err);
        assert!(matches!(l.save(), Err(CacheError::NotFound(_))));
        assert!(l.tile(ZoomLevel::Full, 0, 0).name().is_some());
    }

    #[test]
    fn shift_moves_objects() {
        let mut l = layer();
        l.add_object(PlacedObject { kind: "door".into(), x: 10, y: 20 });
        l.shift(256, 64).unwrap();
        assert_eq!(l.objects()[0], PlacedObject { kind: "door".into(), x: 266, y: 84 });
    }

    #[test]
    fn clear_region_empties_every_level() {
        let mut l = layer();
        l.insert_image(&noise(256, 128), 0, 0).unwrap();
        l.render_to_image(&WorldRect::new(0, 0, 512, 256), ZoomLevel::Normal).unwrap();
        let name = l.tile(ZoomLevel::Full, 0, 0).name().cloned().unwrap();

        l.clear_region(&WorldRect::new(0, 0, 10, 10)).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Empty);
        assert_eq!(l.tile(ZoomLevel::Normal, 0, 0), &Tile::Empty);
        assert!(l.tile(ZoomLevel::Full, 1, 1).name().is_some());
        assert!(!l.cache().contains(&name));
    }

    #[test]
    fn clear_drops_tiles_objects_and_blobs() {
        let mut l = layer();
        l.insert_image(&noise(256, 64), 0, 0).unwrap();
        l.add_object(PlacedObject { kind: "lamp".into(), x: 1, y: 1 });
        l.save().unwrap();
        assert_eq!(l.archive().names().len(), 2);
        assert!(l.tile_at(200, 10, ZoomLevel::Full).name().is_some());

        l.clear().unwrap();
        assert_eq!(l.tile_at(200, 10, ZoomLevel::Full), &Tile::Empty);
        assert!(l.archive().names().is_empty());
        assert!(l.objects().is_empty());
        assert!(l.cache().is_empty());
    }

    #[test]
    fn fill_rect_is_block_granular() {
        let mut l = layer();
        l.insert_image(&noise(128, 64), 0, 0).unwrap();
        l.fill_rect(&WorldRect::new(10, 10, 130, 10), RED).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Solid(RED));
        assert_eq!(l.tile(ZoomLevel::Full, 1, 0), &Tile::Solid(RED));
        assert!(l.cache().is_empty());

        l.fill_rect(&WorldRect::new(0, 0, 1, 1), Rgba([0, 0, 0, 0])).unwrap();
        assert_eq!(l.tile(ZoomLevel::Full, 0, 0), &Tile::Empty);
    }

    #[test]
    fn cache_budget_holds_while_editing() {
        let mut l = layer_with_capacity(3);
        let img = noise(128 * 4, 64 * 3);
        l.insert_image(&img, 0, 0).unwrap();
        assert!(l.cache().len() <= 3);

        // Spilled images come back intact.
        let out = l.render_to_image(&WorldRect::new(0, 0, 512, 192), ZoomLevel::Full).unwrap();
        assert_eq!(out, img);
        assert!(l.cache().len() <= 3);
    }

    #[test]
    fn negative_origin_is_clipped() {
        let mut l = layer();
        l.insert_image(&noise(200, 100), -100, -50).unwrap();
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 1);
        let out = l.render_to_image(&WorldRect::new(-100, -50, 200, 100), ZoomLevel::Full).unwrap();
        assert_eq!(out.get_pixel(100, 50), noise(200, 100).get_pixel(100, 50));
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn blend_composites_over_destination() {
        let mut l = layer();
        l.insert_image(&RgbaImage::from_pixel(128, 64, Rgba([255, 0, 0, 0])), 0, 0).unwrap();
        l.insert_image(&RgbaImage::from_pixel(4, 4, RED), 0, 0).unwrap();
        let mut dest = RgbaImage::from_pixel(8, 8, BLUE);
        l.render(&mut dest, 0, 0, PixelRect::new(0, 0, 8, 8), ZoomLevel::Full, true).unwrap();
        assert_eq!(*dest.get_pixel(1, 1), RED);
        assert_eq!(*dest.get_pixel(6, 6), BLUE);

        let mut dest = RgbaImage::from_pixel(8, 8, BLUE);
        l.render(&mut dest, 0, 0, PixelRect::new(0, 0, 8, 8), ZoomLevel::Full, false).unwrap();
        assert_eq!(dest.get_pixel(6, 6)[3], 0);
    }

    #[test]
    fn names_too_long_for_the_store_are_rejected_up_front() {
        struct Tiny(MemoryBlobStore);
        impl BlobStore for Tiny {
            fn contains(&self, name: &str) -> bool {
                self.0.contains(name)
            }
            fn read(&self, name: &str) -> Result<Box<dyn std::io::Read + '_>> {
                self.0.read(name)
            }
            fn write(&mut self, name: &str, len: usize) -> Result<Box<dyn std::io::Write + '_>> {
                self.0.write(name, len)
            }
            fn delete(&mut self, name: &str) -> Result<()> {
                self.0.delete(name)
            }
            fn names(&self) -> Vec<String> {
                self.0.names()
            }
            fn max_name_len(&self) -> usize {
                5
            }
        }

        let config = CacheConfig::default();
        let mut l = Layer::new(&config, Box::new(Tiny(MemoryBlobStore::new())), TileIdGen::starting_at(9)).unwrap();
        // "9.png" fits, "10.png" does not: two blocks need both.
        let err = l.insert_image(&noise(256, 64), 0, 0).unwrap_err();
        assert!(matches!(err, CacheError::InvalidName(_)));
        assert_eq!(l.grid(ZoomLevel::Full).tile_count(), 0);
        assert_eq!(l.ids().peek(), 9);
    }
}
