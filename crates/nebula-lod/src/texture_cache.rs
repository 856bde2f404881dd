//! Budgeted, LOD-aware store of atlas textures.
//!
//! The cache owns every atlas texture. Entries live in a slot arena addressed
//! by [`AtlasSlotId`]; chunks refer to them through [`TextureRef`]s and never
//! own them. Eviction is least-recently-used by the frame an entry was last
//! read, skipping entries pinned by active chunks this frame. Textures the
//! cache lets go of are handed back to the caller for destruction, so the
//! cache itself never talks to the backend.

use std::collections::{HashMap, HashSet};

use nebula_cubesphere::CubeFace;
use nebula_render::{PipelineError, SlotArena, TextureHandle};

use crate::atlas::{AtlasKey, AtlasKind, LodAtlasConfig, UvTransform};

/// Index of an entry in the cache arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtlasSlotId(u32);

/// A sampled atlas: either a whole texture or one layer of a pooled array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureRef {
    pub texture: TextureHandle,
    pub layer: Option<u32>,
}

impl TextureRef {
    #[must_use]
    pub fn standalone(texture: TextureHandle) -> Self {
        Self {
            texture,
            layer: None,
        }
    }
}

/// What a chunk needs to sample one atlas kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodTexture {
    pub texture: TextureRef,
    pub uv_transform: UvTransform,
    pub atlas_key: AtlasKey,
}

/// Pools share one 2D array per `(kind, lod, texture size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: AtlasKind,
    pub lod: u8,
    pub size: u32,
}

struct ArrayPool {
    texture: TextureHandle,
    capacity: u32,
    free: Vec<u32>,
}

#[derive(Debug)]
struct CacheEntry {
    key: AtlasKey,
    kind: AtlasKind,
    texture: TextureRef,
    size_bytes: u64,
    last_used_frame: u64,
}

/// Result of one [`TextureCache::tick`].
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Evicted entries in eviction order.
    pub evicted: Vec<(AtlasKey, AtlasKind)>,
    /// Standalone textures the caller must destroy.
    pub destroy: Vec<TextureHandle>,
    /// Set when pinned entries alone exceed the budget.
    pub budget_exceeded: Option<PipelineError>,
}

/// LRU texture cache with a byte budget.
pub struct TextureCache {
    entries: SlotArena<CacheEntry>,
    index: HashMap<(AtlasKey, AtlasKind), AtlasSlotId>,
    pinned: HashSet<AtlasSlotId>,
    pools: HashMap<PoolKey, ArrayPool>,
    budget_bytes: u64,
    resident_bytes: u64,
    frame: u64,
    evictions_total: u64,
}

impl TextureCache {
    #[must_use]
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            entries: SlotArena::new(),
            index: HashMap::new(),
            pinned: HashSet::new(),
            pools: HashMap::new(),
            budget_bytes,
            resident_bytes: 0,
            frame: 0,
            evictions_total: 0,
        }
    }

    /// Look up an atlas and mark it used this frame.
    pub fn get(&mut self, key: &AtlasKey, kind: AtlasKind) -> Option<TextureRef> {
        let id = *self.index.get(&(*key, kind))?;
        let frame = self.frame;
        let entry = self.entries.get_mut(id.0)?;
        entry.last_used_frame = frame;
        Some(entry.texture)
    }

    /// Look up an atlas without touching its LRU stamp.
    #[must_use]
    pub fn peek(&self, key: &AtlasKey, kind: AtlasKind) -> Option<TextureRef> {
        let id = self.index.get(&(*key, kind))?;
        self.entries.get(id.0).map(|e| e.texture)
    }

    #[must_use]
    pub fn contains(&self, key: &AtlasKey, kind: AtlasKind) -> bool {
        self.index.contains_key(&(*key, kind))
    }

    /// Store an atlas. Replacing an existing `(key, kind)` releases the old
    /// texture before the new one becomes visible; a released standalone
    /// texture is returned for destruction.
    pub fn set_lod(
        &mut self,
        key: AtlasKey,
        kind: AtlasKind,
        texture: TextureRef,
        size_bytes: u64,
    ) -> Option<TextureHandle> {
        // Re-storing the same texture keeps its layer out of the free list.
        let released = match self.take(&key, kind) {
            Some(old) if old.texture == texture => None,
            Some(old) => self.release(old.kind, old.key.lod, old.texture),
            None => None,
        };
        let id = AtlasSlotId(self.entries.insert(CacheEntry {
            key,
            kind,
            texture,
            size_bytes,
            last_used_frame: self.frame,
        }));
        self.index.insert((key, kind), id);
        self.resident_bytes += size_bytes;
        released.filter(|old| *old != texture.texture)
    }

    /// Drop an entry, recycling its array layer. Returns a standalone texture
    /// to destroy.
    pub fn remove(&mut self, key: &AtlasKey, kind: AtlasKind) -> Option<TextureHandle> {
        let entry = self.take(key, kind)?;
        self.release(entry.kind, entry.key.lod, entry.texture)
    }

    fn take(&mut self, key: &AtlasKey, kind: AtlasKind) -> Option<CacheEntry> {
        let id = self.index.remove(&(*key, kind))?;
        self.pinned.remove(&id);
        let entry = self.entries.remove(id.0)?;
        self.resident_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn release(&mut self, kind: AtlasKind, lod: u8, texture: TextureRef) -> Option<TextureHandle> {
        match texture.layer {
            Some(layer) => {
                if let Some(pool) = self
                    .pools
                    .values_mut()
                    .find(|p| p.texture == texture.texture)
                {
                    pool.free.push(layer);
                } else {
                    tracing::warn!(
                        "Released {kind} layer {layer} at lod {lod} has no owning pool"
                    );
                }
                None
            }
            None => Some(texture.texture),
        }
    }

    /// Whether `kind` is resident for the chunk at exactly `lod`.
    #[must_use]
    pub fn has_lod(
        &self,
        chunk_x: i32,
        chunk_y: i32,
        kind: AtlasKind,
        lod: u8,
        face: Option<CubeFace>,
        cfg: &LodAtlasConfig,
    ) -> bool {
        self.contains(&cfg.atlas_key_from_chunk(chunk_x, chunk_y, lod, face), kind)
    }

    /// Texture, UV transform and key for a chunk at `lod`, marking it used.
    pub fn get_lod_for_chunk(
        &mut self,
        chunk_x: i32,
        chunk_y: i32,
        kind: AtlasKind,
        lod: u8,
        face: Option<CubeFace>,
        cfg: &LodAtlasConfig,
    ) -> Option<LodTexture> {
        let atlas_key = cfg.atlas_key_from_chunk(chunk_x, chunk_y, lod, face);
        let texture = self.get(&atlas_key, kind)?;
        Some(LodTexture {
            texture,
            uv_transform: cfg.uv_transform(chunk_x, chunk_y),
            atlas_key,
        })
    }

    /// Like [`TextureCache::get_lod_for_chunk`] but fails with
    /// [`PipelineError::MissingTexture`].
    pub fn require_lod_for_chunk(
        &mut self,
        chunk_x: i32,
        chunk_y: i32,
        kind: AtlasKind,
        lod: u8,
        face: Option<CubeFace>,
        cfg: &LodAtlasConfig,
    ) -> Result<LodTexture, PipelineError> {
        self.get_lod_for_chunk(chunk_x, chunk_y, kind, lod, face, cfg)
            .ok_or_else(|| PipelineError::MissingTexture {
                key: cfg
                    .atlas_key_from_chunk(chunk_x, chunk_y, lod, face)
                    .to_string(),
                kind: kind.to_string(),
            })
    }

    /// Finest resident LOD at or above `lod` for which every kind in `kinds`
    /// is present.
    #[must_use]
    pub fn finest_resident_lod(
        &self,
        chunk_x: i32,
        chunk_y: i32,
        lod: u8,
        face: Option<CubeFace>,
        kinds: &[AtlasKind],
        cfg: &LodAtlasConfig,
    ) -> Option<u8> {
        (lod..cfg.max_lod_levels()).find(|&l| {
            kinds
                .iter()
                .all(|&k| self.has_lod(chunk_x, chunk_y, k, l, face, cfg))
        })
    }

    pub fn set_budget(&mut self, bytes: u64) {
        self.budget_bytes = bytes;
    }

    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget_bytes
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn evictions_total(&self) -> u64 {
        self.evictions_total
    }

    /// Protect every kind of `key` from eviction until the next tick.
    pub fn pin(&mut self, key: &AtlasKey) {
        for kind in AtlasKind::ALL {
            if let Some(id) = self.index.get(&(*key, kind)) {
                self.pinned.insert(*id);
                if let Some(e) = self.entries.get_mut(id.0) {
                    e.last_used_frame = self.frame;
                }
            }
        }
    }

    #[must_use]
    pub fn is_pinned(&self, key: &AtlasKey, kind: AtlasKind) -> bool {
        self.index
            .get(&(*key, kind))
            .is_some_and(|id| self.pinned.contains(id))
    }

    /// Evict least-recently-used unpinned entries until the budget holds,
    /// then clear pins and advance to `frame`.
    pub fn tick(&mut self, frame: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.resident_bytes > self.budget_bytes {
            let mut candidates: Vec<(u64, AtlasSlotId)> = self
                .entries
                .iter()
                .filter(|(i, _)| !self.pinned.contains(&AtlasSlotId(*i)))
                .map(|(i, e)| (e.last_used_frame, AtlasSlotId(i)))
                .collect();
            candidates.sort_unstable();
            for (_, id) in candidates {
                if self.resident_bytes <= self.budget_bytes {
                    break;
                }
                let Some((key, kind)) = self.entries.get(id.0).map(|e| (e.key, e.kind)) else {
                    continue;
                };
                if let Some(tex) = self.remove(&key, kind) {
                    outcome.destroy.push(tex);
                }
                outcome.evicted.push((key, kind));
                self.evictions_total += 1;
            }
            if !outcome.evicted.is_empty() {
                tracing::debug!(
                    "Evicted {} atlas textures, {} bytes resident",
                    outcome.evicted.len(),
                    self.resident_bytes
                );
            }
            if self.resident_bytes > self.budget_bytes {
                let err = PipelineError::BudgetExceeded {
                    resident: self.resident_bytes,
                    budget: self.budget_bytes,
                };
                tracing::warn!("{err}");
                outcome.budget_exceeded = Some(err);
            }
        }
        self.pinned.clear();
        self.frame = frame;
        outcome
    }

    /// Register a 2D array texture as the backing pool for `key`.
    pub fn add_pool(&mut self, key: PoolKey, texture: TextureHandle, capacity: u32) {
        self.pools.insert(
            key,
            ArrayPool {
                texture,
                capacity,
                free: (0..capacity).rev().collect(),
            },
        );
    }

    #[must_use]
    pub fn has_pool(&self, key: &PoolKey) -> bool {
        self.pools.contains_key(key)
    }

    /// Take a free layer from the pool for `key`.
    pub fn acquire_layer(&mut self, key: &PoolKey) -> Option<TextureRef> {
        let pool = self.pools.get_mut(key)?;
        let layer = pool.free.pop()?;
        Some(TextureRef {
            texture: pool.texture,
            layer: Some(layer),
        })
    }

    /// Return a layer that was acquired but never stored.
    pub fn return_layer(&mut self, texture: TextureRef) {
        if let Some(layer) = texture.layer
            && let Some(pool) = self.pools.values_mut().find(|p| p.texture == texture.texture)
        {
            pool.free.push(layer);
        }
    }

    /// Free layers left in the pool for `key`.
    #[must_use]
    pub fn free_layers(&self, key: &PoolKey) -> Option<usize> {
        self.pools.get(key).map(|p| p.free.len())
    }

    /// Remove pools whose layers are all free, returning their textures.
    pub fn drain_empty_pools(&mut self) -> Vec<TextureHandle> {
        let empty: Vec<PoolKey> = self
            .pools
            .iter()
            .filter(|(_, p)| p.free.len() as u32 == p.capacity)
            .map(|(k, _)| *k)
            .collect();
        empty
            .into_iter()
            .filter_map(|k| self.pools.remove(&k).map(|p| p.texture))
            .collect()
    }

    /// Remove everything, returning all textures the caller must destroy.
    pub fn clear(&mut self) -> Vec<TextureHandle> {
        let keys: Vec<(AtlasKey, AtlasKind)> = self.index.keys().copied().collect();
        let mut out: Vec<TextureHandle> = keys
            .into_iter()
            .filter_map(|(k, kind)| self.remove(&k, kind))
            .collect();
        out.extend(self.pools.drain().map(|(_, p)| p.texture));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn cfg() -> LodAtlasConfig {
        LodAtlasConfig::new(1024, 128, 1024, 5, &[1200.0, 3200.0, 8000.0, 16000.0]).unwrap()
    }

    fn tex(i: u32) -> TextureRef {
        TextureRef::standalone(TextureHandle::from_index(i))
    }

    fn key(x: i32) -> AtlasKey {
        AtlasKey::new(None, x, 0, 0)
    }

    /// Stored textures are retrievable and resident bytes add up.
    #[test]
    fn test_set_and_get() {
        let mut cache = TextureCache::new(100 * MB);
        assert!(cache.set_lod(key(0), AtlasKind::Height, tex(1), 16 * MB).is_none());
        assert_eq!(cache.get(&key(0), AtlasKind::Height), Some(tex(1)));
        assert_eq!(cache.get(&key(0), AtlasKind::Tile), None);
        assert_eq!(cache.resident_bytes(), 16 * MB);
    }

    /// Replacing a slot releases the previous texture.
    #[test]
    fn test_replace_releases_old_texture() {
        let mut cache = TextureCache::new(100 * MB);
        cache.set_lod(key(0), AtlasKind::Height, tex(1), 16 * MB);
        let released = cache.set_lod(key(0), AtlasKind::Height, tex(2), 16 * MB);
        assert_eq!(released, Some(TextureHandle::from_index(1)));
        assert_eq!(cache.peek(&key(0), AtlasKind::Height), Some(tex(2)));
        assert_eq!(cache.resident_bytes(), 16 * MB);
        assert_eq!(cache.len(), 1);
    }

    /// Chunk lookups return the atlas-relative UV transform.
    #[test]
    fn test_get_lod_for_chunk() {
        let cfg = cfg();
        let mut cache = TextureCache::new(100 * MB);
        cache.set_lod(key(0), AtlasKind::Tile, tex(3), MB);
        assert!(cache.has_lod(3, 2, AtlasKind::Tile, 0, None, &cfg));
        assert!(!cache.has_lod(9, 2, AtlasKind::Tile, 0, None, &cfg));
        let lt = cache
            .get_lod_for_chunk(3, 2, AtlasKind::Tile, 0, None, &cfg)
            .unwrap();
        assert_eq!(lt.uv_transform.offset, [0.375, 0.25]);
        assert_eq!(lt.uv_transform.scale, 0.125);
        let missing = cache.require_lod_for_chunk(3, 2, AtlasKind::Height, 0, None, &cfg);
        assert!(matches!(missing, Err(PipelineError::MissingTexture { .. })));
    }

    /// The coarsest resident fallback is found when the target is missing.
    #[test]
    fn test_finest_resident_lod() {
        let cfg = cfg();
        let mut cache = TextureCache::new(100 * MB);
        let coarse = cfg.atlas_key_from_chunk(0, 0, 2, None);
        cache.set_lod(coarse, AtlasKind::Height, tex(1), MB);
        cache.set_lod(coarse, AtlasKind::Tile, tex(2), MB);
        let kinds = AtlasKind::REQUIRED;
        assert_eq!(cache.finest_resident_lod(0, 0, 0, None, &kinds, &cfg), Some(2));
        assert_eq!(cache.finest_resident_lod(0, 0, 3, None, &kinds, &cfg), None);
    }

    /// Eviction removes least-recently-used entries first and skips pins.
    #[test]
    fn test_lru_eviction_respects_pins() {
        let mut cache = TextureCache::new(u64::MAX);
        for i in 0..5 {
            cache.tick(i as u64);
            cache.set_lod(key(i), AtlasKind::Height, tex(i as u32), 16 * MB);
        }
        cache.set_budget(48 * MB);
        cache.pin(&key(0));
        let out = cache.tick(10);
        assert_eq!(
            out.evicted,
            vec![(key(1), AtlasKind::Height), (key(2), AtlasKind::Height)]
        );
        assert_eq!(out.destroy.len(), 2);
        assert!(cache.contains(&key(0), AtlasKind::Height));
        assert!(cache.resident_bytes() <= 48 * MB);
        assert!(out.budget_exceeded.is_none());
    }

    /// When pins alone exceed the budget the tick reports it and keeps them.
    #[test]
    fn test_budget_exceeded_when_all_pinned() {
        let mut cache = TextureCache::new(20 * MB);
        cache.set_lod(key(0), AtlasKind::Height, tex(0), 16 * MB);
        cache.set_lod(key(1), AtlasKind::Height, tex(1), 16 * MB);
        cache.pin(&key(0));
        cache.pin(&key(1));
        let out = cache.tick(1);
        assert!(out.evicted.is_empty());
        assert!(matches!(
            out.budget_exceeded,
            Some(PipelineError::BudgetExceeded { .. })
        ));
        // Pins last one frame.
        let out = cache.tick(2);
        assert_eq!(out.evicted.len(), 1);
    }

    /// Pooled layers return to the free list on eviction.
    #[test]
    fn test_array_pool_recycles_layers() {
        let mut cache = TextureCache::new(2 * MB);
        let pool = PoolKey {
            kind: AtlasKind::Height,
            lod: 0,
            size: 256,
        };
        cache.add_pool(pool, TextureHandle::from_index(99), 2);
        let a = cache.acquire_layer(&pool).unwrap();
        let b = cache.acquire_layer(&pool).unwrap();
        assert_eq!(a.layer, Some(0));
        assert_eq!(b.layer, Some(1));
        assert!(cache.acquire_layer(&pool).is_none());

        assert!(cache.set_lod(key(0), AtlasKind::Height, a, 2 * MB).is_none());
        cache.set_lod(key(1), AtlasKind::Height, b, 2 * MB);
        let out = cache.tick(5);
        assert_eq!(out.evicted.len(), 1);
        assert!(out.destroy.is_empty(), "layers are recycled, not destroyed");
        assert_eq!(cache.free_layers(&pool), Some(1));
    }

    /// Storing the same layer again keeps it out of the free list.
    #[test]
    fn test_restore_same_layer_not_recycled() {
        let mut cache = TextureCache::new(u64::MAX);
        let pool = PoolKey {
            kind: AtlasKind::Height,
            lod: 0,
            size: 257,
        };
        cache.add_pool(pool, TextureHandle::from_index(99), 2);
        let a = cache.acquire_layer(&pool).unwrap();
        cache.set_lod(key(0), AtlasKind::Height, a, 2 * MB);
        assert!(cache.set_lod(key(0), AtlasKind::Height, a, 2 * MB).is_none());
        assert_eq!(cache.free_layers(&pool), Some(1));
        assert_eq!(cache.resident_bytes(), 2 * MB);

        let b = cache.acquire_layer(&pool).unwrap();
        assert_ne!(a, b, "a stored layer is never handed out twice");
        assert!(cache.acquire_layer(&pool).is_none());
    }

    /// Empty pools are drained and their textures returned.
    #[test]
    fn test_drain_empty_pools() {
        let mut cache = TextureCache::new(MB);
        let pool = PoolKey {
            kind: AtlasKind::Splat,
            lod: 1,
            size: 512,
        };
        cache.add_pool(pool, TextureHandle::from_index(7), 4);
        let layer = cache.acquire_layer(&pool).unwrap();
        assert!(cache.drain_empty_pools().is_empty());
        cache.return_layer(layer);
        assert_eq!(cache.drain_empty_pools(), vec![TextureHandle::from_index(7)]);
        assert!(!cache.has_pool(&pool));
    }
}
