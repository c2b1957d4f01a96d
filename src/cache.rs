// ============================================================================
// MRU IMAGE CACHE – bounded pool of decoded tile images
// ============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use image::RgbaImage;

use crate::blob::BlobStore;
use crate::error::{CacheError, Result};
use crate::grid::TileName;
use crate::io::{load_tile, store_tile};

/// A decoded tile image resident in the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedImage {
    pub name: TileName,
    pub pixels: RgbaImage,
    /// Modified since it was last written to the archive.
    pub dirty: bool,
}

struct Slot {
    image: CachedImage,
    tick: u64,
}

/// Bounded, recency-ordered cache of [`CachedImage`]s.
///
/// Entries live in an arena of slots; `index` maps names to slots and
/// `recency` maps a monotonically increasing use tick to a slot, so the
/// first key of `recency` is always the least-recently-used entry.
///
/// Dirty entries evicted over budget are written to the *spill* store (the
/// loose-file fallback) and transparently reloaded from it on the next fetch.
/// The spill store may be shared with other caches; each one only reads and
/// deletes the names it wrote itself.
pub struct MruImageCache {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<TileName, usize>,
    recency: BTreeMap<u64, usize>,
    next_tick: u64,
    spill: Box<dyn BlobStore>,
    spilled: HashSet<TileName>,
}

impl MruImageCache {
    /// Create a cache holding at most `capacity` images (at least one).
    pub fn new(capacity: usize, spill: Box<dyn BlobStore>) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            spill,
            spilled: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &TileName) -> bool {
        self.index.contains_key(name)
    }

    pub fn spill(&self) -> &dyn BlobStore {
        self.spill.as_ref()
    }

    /// Whether this cache holds a spilled copy of `name`.
    pub fn is_spilled(&self, name: &TileName) -> bool {
        self.spilled.contains(name)
    }

    /// Peek without counting as a use.
    pub fn get(&self, name: &TileName) -> Option<&CachedImage> {
        let slot = *self.index.get(name)?;
        self.slots[slot].as_ref().map(|s| &s.image)
    }

    /// Names from most to least recently used.
    pub fn resident_names(&self) -> Vec<TileName> {
        self.recency
            .values()
            .rev()
            .filter_map(|&slot| self.slots[slot].as_ref().map(|s| s.image.name.clone()))
            .collect()
    }

    /// Return the image for `name`, loading it on a miss.
    ///
    /// Misses check this cache's own spilled copies first (such images were
    /// evicted dirty and come back dirty), then call `loader`. The new entry becomes the most
    /// recently used one *before* eviction runs, so it is never the victim.
    pub fn fetch<F>(&mut self, name: &TileName, loader: F) -> Result<&mut CachedImage>
    where
        F: FnOnce() -> Result<RgbaImage>,
    {
        if let Some(&slot) = self.index.get(name) {
            self.promote(slot);
            return self.slot_image(slot);
        }

        let image = if self.spilled.contains(name) {
            log::debug!("Reloading spilled tile {}", name);
            CachedImage {
                name: name.clone(),
                pixels: load_tile(self.spill.as_ref(), name.as_str())?,
                dirty: true,
            }
        } else {
            CachedImage {
                name: name.clone(),
                pixels: loader()?,
                dirty: false,
            }
        };

        let slot = self.insert_slot(image);
        self.evict_if_over_capacity()?;
        self.slot_image(slot)
    }

    /// Add a freshly created image (replacing any resident one of that name).
    pub fn insert(&mut self, image: CachedImage) -> Result<&mut CachedImage> {
        let slot = match self.index.get(&image.name) {
            Some(&slot) => {
                if let Some(s) = self.slots[slot].as_mut() {
                    s.image = image;
                }
                self.promote(slot);
                slot
            }
            None => self.insert_slot(image),
        };
        self.evict_if_over_capacity()?;
        self.slot_image(slot)
    }

    /// Count a use without loading anything. Returns false if not resident.
    pub fn touch(&mut self, name: &TileName) -> bool {
        match self.index.get(name) {
            Some(&slot) => {
                self.promote(slot);
                true
            }
            None => false,
        }
    }

    pub fn mark_dirty(&mut self, name: &TileName) {
        self.set_dirty(name, true);
    }

    pub fn mark_clean(&mut self, name: &TileName) {
        self.set_dirty(name, false);
    }

    /// Evict least-recently-used entries until within capacity.
    ///
    /// Dirty victims are written to the spill store first. A failed write
    /// stops eviction and leaves the cache over budget; nothing is lost.
    pub fn evict_if_over_capacity(&mut self) -> Result<()> {
        while self.index.len() > self.capacity {
            let Some((&tick, &slot)) = self.recency.first_key_value() else {
                break;
            };
            if let Some(victim) = self.slots[slot].as_ref()
                && victim.image.dirty
            {
                let name = &victim.image.name;
                store_tile(self.spill.as_mut(), name.as_str(), &victim.image.pixels)?;
                self.spilled.insert(name.clone());
                log::debug!("Spilled dirty tile {}", name);
            }
            self.recency.remove(&tick);
            if let Some(s) = self.slots[slot].take() {
                self.index.remove(&s.image.name);
            }
            self.free.push(slot);
        }
        Ok(())
    }

    /// Drop an entry without writing it anywhere, and delete its spilled copy.
    pub fn remove_and_discard(&mut self, name: &TileName) -> Result<()> {
        if let Some(slot) = self.index.remove(name) {
            if let Some(s) = self.slots[slot].take() {
                self.recency.remove(&s.tick);
            }
            self.free.push(slot);
        }
        self.forget_spill(name)
    }

    /// Delete the spilled copy of `name` once it is committed elsewhere.
    pub fn forget_spill(&mut self, name: &TileName) -> Result<()> {
        if self.spilled.contains(name) {
            self.spill.delete(name.as_str())?;
            self.spilled.remove(name);
        }
        Ok(())
    }

    /// Drop every entry and every image this cache spilled.
    pub fn discard_all(&mut self) -> Result<()> {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.recency.clear();
        let spilled: Vec<TileName> = self.spilled.iter().cloned().collect();
        for name in spilled {
            self.spill.delete(name.as_str())?;
            self.spilled.remove(&name);
        }
        Ok(())
    }

    /// Write every dirty resident image to the spill store.
    pub fn flush_dirty_to_spill(&mut self) -> Result<usize> {
        let mut written = 0;
        for s in self.slots.iter().flatten() {
            if s.image.dirty {
                store_tile(self.spill.as_mut(), s.image.name.as_str(), &s.image.pixels)?;
                self.spilled.insert(s.image.name.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    fn set_dirty(&mut self, name: &TileName, dirty: bool) {
        if let Some(&slot) = self.index.get(name)
            && let Some(s) = self.slots[slot].as_mut()
        {
            s.image.dirty = dirty;
        }
    }

    fn insert_slot(&mut self, image: CachedImage) -> usize {
        let tick = self.bump_tick();
        let name = image.name.clone();
        let entry = Some(Slot { image, tick });
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = entry;
                slot
            }
            None => {
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };
        self.index.insert(name, slot);
        self.recency.insert(tick, slot);
        slot
    }

    fn promote(&mut self, slot: usize) {
        let tick = self.bump_tick();
        if let Some(s) = self.slots[slot].as_mut() {
            self.recency.remove(&s.tick);
            s.tick = tick;
            self.recency.insert(tick, slot);
        }
    }

    fn bump_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn slot_image(&mut self, slot: usize) -> Result<&mut CachedImage> {
        self.slots[slot]
            .as_mut()
            .map(|s| &mut s.image)
            .ok_or_else(|| CacheError::NotFound(format!("cache slot {}", slot)))
    }
}

impl Drop for MruImageCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush_dirty_to_spill() {
            log::warn!("Could not flush dirty tiles before dropping the cache: {}", e);
        }
    }
}
