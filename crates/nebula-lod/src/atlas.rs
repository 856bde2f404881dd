//! Atlas coordinate system.
//!
//! Maps face-local world meters to chunks, chunks to atlas slots and atlas
//! slots to UV transforms. Every ratio is a power of two, so offsets and
//! scales are exact in `f32` and neighbouring chunks sample identical texels
//! along their shared edge.

use std::fmt;

use nebula_config::StreamingConfig;
use nebula_cubesphere::CubeFace;
use nebula_render::{PipelineError, TextureFormat};
use serde::{Deserialize, Serialize};

use crate::error::LodError;
use crate::selector::LodThresholds;

/// The five per-slot atlas kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AtlasKind {
    Height,
    Normal,
    Tile,
    Macro,
    Splat,
}

impl AtlasKind {
    pub const ALL: [AtlasKind; 5] = [
        AtlasKind::Height,
        AtlasKind::Normal,
        AtlasKind::Tile,
        AtlasKind::Macro,
        AtlasKind::Splat,
    ];

    /// Kinds streaming always needs before a chunk can be drawn.
    pub const REQUIRED: [AtlasKind; 2] = [AtlasKind::Height, AtlasKind::Tile];

    /// `outputKind` written into the terrain uniform. The splat pass has its
    /// own pipeline and no output kind.
    #[must_use]
    pub fn output_kind(self) -> Option<i32> {
        match self {
            AtlasKind::Height => Some(0),
            AtlasKind::Normal => Some(1),
            AtlasKind::Tile => Some(2),
            AtlasKind::Macro => Some(3),
            AtlasKind::Splat => None,
        }
    }

    /// Tile ids are looked up exactly, everything else is filtered.
    #[must_use]
    pub fn uses_nearest_filter(self) -> bool {
        self == AtlasKind::Tile
    }

    /// Height and tile ids are read back and splat weights must sum to one,
    /// so those stay full precision; normal and macro are filtered.
    #[must_use]
    pub fn format(self) -> TextureFormat {
        match self {
            AtlasKind::Height | AtlasKind::Tile | AtlasKind::Splat => TextureFormat::Rgba32Float,
            AtlasKind::Normal | AtlasKind::Macro => TextureFormat::Rgba16Float,
        }
    }

    /// Extra texels past the far edge. Height carries one so texel `size`
    /// holds the first texel of the next atlas and edge vertices of
    /// adjacent atlases read the same value.
    #[must_use]
    pub fn apron(self) -> u32 {
        u32::from(self == AtlasKind::Height)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AtlasKind::Height => "height",
            AtlasKind::Normal => "normal",
            AtlasKind::Tile => "tile",
            AtlasKind::Macro => "macro",
            AtlasKind::Splat => "splat",
        }
    }
}

impl fmt::Display for AtlasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one atlas slot. `face == None` is the planar world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtlasKey {
    pub face: Option<CubeFace>,
    pub atlas_x: i32,
    pub atlas_y: i32,
    pub lod: u8,
}

impl AtlasKey {
    #[must_use]
    pub fn new(face: Option<CubeFace>, atlas_x: i32, atlas_y: i32, lod: u8) -> Self {
        Self {
            face,
            atlas_x,
            atlas_y,
            lod,
        }
    }

    /// Face index for shader uniforms, `-1` in planar mode.
    #[must_use]
    pub fn face_index(&self) -> i32 {
        self.face.map_or(-1, CubeFace::index)
    }

    /// The same slot one LOD coarser, or `None` past `max_lod`.
    #[must_use]
    pub fn coarser(&self, cfg: &LodAtlasConfig, chunk_x: i32, chunk_y: i32) -> Option<AtlasKey> {
        let lod = self.lod + 1;
        (lod < cfg.max_lod_levels()).then(|| cfg.atlas_key_from_chunk(chunk_x, chunk_y, lod, self.face))
    }
}

impl fmt::Display for AtlasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.face {
            Some(face) => write!(
                f,
                "{face:?}/{},{}@lod{}",
                self.atlas_x, self.atlas_y, self.lod
            ),
            None => write!(f, "planar/{},{}@lod{}", self.atlas_x, self.atlas_y, self.lod),
        }
    }
}

/// Maps a chunk's local `[0,1]²` UV into its atlas.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UvTransform {
    pub offset: [f32; 2],
    pub scale: f32,
}

impl UvTransform {
    pub const IDENTITY: Self = Self {
        offset: [0.0, 0.0],
        scale: 1.0,
    };

    /// Transform a chunk-local UV into atlas UV.
    #[must_use]
    pub fn apply(&self, uv: [f32; 2]) -> [f32; 2] {
        [
            self.offset[0] + uv[0] * self.scale,
            self.offset[1] + uv[1] * self.scale,
        ]
    }
}

/// Half-open world rectangle `[min, max)` covered by one atlas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AtlasBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl AtlasBounds {
    #[must_use]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }
}

/// Immutable atlas parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct LodAtlasConfig {
    world_coverage: u32,
    base_chunk_size: u32,
    base_texture_size: u32,
    thresholds: LodThresholds,
}

fn power_of_two(field: &'static str, value: u32) -> Result<(), LodError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(LodError::InvalidConfig {
            field,
            reason: format!("{value} is not a power of two"),
        });
    }
    Ok(())
}

fn finite(x: f64, y: f64) -> Result<(), PipelineError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::InvalidCoordinate { x, y })
    }
}

impl LodAtlasConfig {
    /// Build a config; `lod_distances` holds one threshold per LOD with the
    /// last one infinite (it is appended when missing).
    pub fn new(
        world_coverage: u32,
        base_chunk_size: u32,
        base_texture_size: u32,
        max_lod_levels: u8,
        lod_distances: &[f64],
    ) -> Result<Self, LodError> {
        power_of_two("world_coverage", world_coverage)?;
        power_of_two("base_chunk_size", base_chunk_size)?;
        power_of_two("base_texture_size", base_texture_size)?;
        if world_coverage % base_chunk_size != 0 {
            return Err(LodError::InvalidConfig {
                field: "world_coverage",
                reason: format!("{world_coverage} is not a multiple of {base_chunk_size}"),
            });
        }
        if max_lod_levels == 0 {
            return Err(LodError::InvalidConfig {
                field: "max_lod_levels",
                reason: "at least one level is required".into(),
            });
        }
        let mut distances = lod_distances.to_vec();
        if distances.len() + 1 == max_lod_levels as usize {
            distances.push(f64::INFINITY);
        }
        if distances.len() != max_lod_levels as usize {
            return Err(LodError::InvalidConfig {
                field: "lod_distances",
                reason: format!(
                    "{} thresholds for {max_lod_levels} levels",
                    distances.len()
                ),
            });
        }
        Ok(Self {
            world_coverage,
            base_chunk_size,
            base_texture_size,
            thresholds: LodThresholds::custom(distances)?,
        })
    }

    /// Derive the atlas parameters from the streaming section of the config.
    pub fn from_streaming(cfg: &StreamingConfig) -> Result<Self, LodError> {
        let distances: Vec<f64> = cfg
            .resolved_lod_distances()
            .into_iter()
            .map(f64::from)
            .collect();
        let max_lod = u8::try_from(cfg.max_lod_levels).map_err(|_| LodError::InvalidConfig {
            field: "max_lod_levels",
            reason: format!("{} is too large", cfg.max_lod_levels),
        })?;
        Self::new(
            cfg.world_coverage,
            cfg.chunk_size,
            cfg.base_texture_size,
            max_lod,
            &distances,
        )
    }

    #[must_use]
    pub fn world_coverage(&self) -> u32 {
        self.world_coverage
    }

    #[must_use]
    pub fn base_chunk_size(&self) -> u32 {
        self.base_chunk_size
    }

    #[must_use]
    pub fn base_texture_size(&self) -> u32 {
        self.base_texture_size
    }

    #[must_use]
    pub fn max_lod_levels(&self) -> u8 {
        self.thresholds.levels()
    }

    #[must_use]
    pub fn thresholds(&self) -> &LodThresholds {
        &self.thresholds
    }

    #[must_use]
    pub fn chunks_per_atlas(&self) -> u32 {
        self.world_coverage / self.base_chunk_size
    }

    /// Texels per atlas side at `lod`, never below 64.
    #[must_use]
    pub fn texture_size(&self, lod: u8) -> u32 {
        (self.base_texture_size >> lod).max(64)
    }

    /// Texture side of `kind` at `lod`, including its apron.
    #[must_use]
    pub fn texture_extent(&self, kind: AtlasKind, lod: u8) -> u32 {
        self.texture_size(lod) + kind.apron()
    }

    #[must_use]
    pub fn meters_per_vertex(&self, lod: u8) -> u32 {
        1 << lod
    }

    /// Mesh segments per chunk side at `lod`, never below 4.
    #[must_use]
    pub fn grid_segments(&self, lod: u8) -> u32 {
        (self.base_chunk_size >> lod).max(4)
    }

    /// Texels covering one chunk side at `lod`.
    #[must_use]
    pub fn texels_per_chunk(&self, lod: u8) -> u32 {
        self.texture_size(lod) / self.chunks_per_atlas()
    }

    /// World meters between adjacent texel centres at `lod`.
    #[must_use]
    pub fn texel_spacing(&self, lod: u8) -> f64 {
        f64::from(self.world_coverage) / f64::from(self.texture_size(lod))
    }

    /// First LOD whose threshold exceeds `distance`.
    #[must_use]
    pub fn lod_for_distance(&self, distance: f64) -> u8 {
        self.thresholds.select_lod(distance)
    }

    /// Atlas containing a world position.
    pub fn atlas_coords(&self, world_x: f64, world_y: f64) -> Result<(i32, i32), PipelineError> {
        finite(world_x, world_y)?;
        let c = f64::from(self.world_coverage);
        Ok(((world_x / c).floor() as i32, (world_y / c).floor() as i32))
    }

    /// Chunk containing a world position.
    pub fn chunk_coords(&self, world_x: f64, world_y: f64) -> Result<(i32, i32), PipelineError> {
        finite(world_x, world_y)?;
        let c = f64::from(self.base_chunk_size);
        Ok(((world_x / c).floor() as i32, (world_y / c).floor() as i32))
    }

    /// Position of a chunk inside its atlas, in chunks.
    #[must_use]
    pub fn local_chunk(&self, chunk_x: i32, chunk_y: i32) -> (u32, u32) {
        let n = self.chunks_per_atlas() as i32;
        (chunk_x.rem_euclid(n) as u32, chunk_y.rem_euclid(n) as u32)
    }

    #[must_use]
    pub fn uv_transform(&self, chunk_x: i32, chunk_y: i32) -> UvTransform {
        let scale = 1.0 / self.chunks_per_atlas() as f32;
        let (lx, ly) = self.local_chunk(chunk_x, chunk_y);
        UvTransform {
            offset: [lx as f32 * scale, ly as f32 * scale],
            scale,
        }
    }

    #[must_use]
    pub fn atlas_key_from_chunk(
        &self,
        chunk_x: i32,
        chunk_y: i32,
        lod: u8,
        face: Option<CubeFace>,
    ) -> AtlasKey {
        let n = self.chunks_per_atlas() as i32;
        AtlasKey {
            face,
            atlas_x: chunk_x.div_euclid(n),
            atlas_y: chunk_y.div_euclid(n),
            lod,
        }
    }

    #[must_use]
    pub fn atlas_world_bounds(&self, key: &AtlasKey) -> AtlasBounds {
        let c = f64::from(self.world_coverage);
        AtlasBounds {
            min_x: f64::from(key.atlas_x) * c,
            min_y: f64::from(key.atlas_y) * c,
            max_x: f64::from(key.atlas_x + 1) * c,
            max_y: f64::from(key.atlas_y + 1) * c,
        }
    }

    /// World origin (minimum corner) of a chunk.
    #[must_use]
    pub fn chunk_origin(&self, chunk_x: i32, chunk_y: i32) -> (f64, f64) {
        let c = f64::from(self.base_chunk_size);
        (f64::from(chunk_x) * c, f64::from(chunk_y) * c)
    }

    #[must_use]
    pub fn chunk_center(&self, chunk_x: i32, chunk_y: i32) -> (f64, f64) {
        let (x, y) = self.chunk_origin(chunk_x, chunk_y);
        let half = f64::from(self.base_chunk_size) * 0.5;
        (x + half, y + half)
    }

    /// Bytes of one `kind` atlas texture at `lod`.
    #[must_use]
    pub fn atlas_bytes(&self, kind: AtlasKind, lod: u8) -> u64 {
        let side = u64::from(self.texture_extent(kind, lod));
        side * side * u64::from(kind.format().bytes_per_texel())
    }

    /// Bytes of all five atlas kinds of one slot at `lod`.
    #[must_use]
    pub fn slot_bytes(&self, lod: u8) -> u64 {
        AtlasKind::ALL
            .iter()
            .map(|&k| self.atlas_bytes(k, lod))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s1_config() -> LodAtlasConfig {
        LodAtlasConfig::new(1024, 128, 1024, 5, &[1200.0, 3200.0, 8000.0, 16000.0]).unwrap()
    }

    /// Per-LOD sizes follow the shift rules with their floors.
    #[test]
    fn test_per_lod_sizes() {
        let cfg = s1_config();
        assert_eq!(cfg.chunks_per_atlas(), 8);
        assert_eq!(cfg.texture_size(0), 1024);
        assert_eq!(cfg.texture_size(3), 128);
        assert_eq!(cfg.texture_size(5), 64);
        assert_eq!(cfg.meters_per_vertex(2), 4);
        assert_eq!(cfg.grid_segments(0), 128);
        assert_eq!(cfg.grid_segments(6), 4);
        assert_eq!(cfg.texels_per_chunk(0), 128);
        assert_eq!(cfg.texels_per_chunk(4), 8);
    }

    /// Atlas and chunk coordinates floor toward negative infinity.
    #[test]
    fn test_coords_floor_negative() {
        let cfg = s1_config();
        assert_eq!(cfg.atlas_coords(-0.5, 1023.9).unwrap(), (-1, 0));
        assert_eq!(cfg.chunk_coords(-128.0, 129.0).unwrap(), (-1, 1));
        let key = cfg.atlas_key_from_chunk(-1, 8, 0, None);
        assert_eq!((key.atlas_x, key.atlas_y), (-1, 1));
        assert_eq!(cfg.local_chunk(-1, 8), (7, 0));
    }

    /// Non-finite coordinates are rejected.
    #[test]
    fn test_non_finite_rejected() {
        let cfg = s1_config();
        assert!(matches!(
            cfg.atlas_coords(f64::NAN, 0.0),
            Err(PipelineError::InvalidCoordinate { .. })
        ));
        assert!(cfg.chunk_coords(0.0, f64::INFINITY).is_err());
    }

    /// Every UV transform stays inside the unit square and tiles it
    /// exactly, including across atlas boundaries.
    #[test]
    fn test_uv_transform_bounds() {
        let cfg = s1_config();
        for cx in -9..17 {
            for cy in -9..17 {
                let t = cfg.uv_transform(cx, cy);
                assert!(t.offset[0] + t.scale <= 1.0 + 1e-6);
                assert!(t.offset[1] + t.scale <= 1.0 + 1e-6);
                // Right edge of this chunk is the left edge of the next one
                // inside the same atlas.
                let (lx, _) = cfg.local_chunk(cx, cy);
                if lx + 1 < cfg.chunks_per_atlas() {
                    let next = cfg.uv_transform(cx + 1, cy);
                    assert_eq!(t.apply([1.0, 0.0])[0], next.apply([0.0, 0.0])[0]);
                } else {
                    // Across atlases the edge lands exactly on the height
                    // apron, at the next atlas's origin.
                    let size = cfg.texture_size(0);
                    assert_eq!(t.apply([1.0, 0.0])[0] * size as f32, size as f32);
                    assert_eq!(cfg.uv_transform(cx + 1, cy).offset[0], 0.0);
                    let key = cfg.atlas_key_from_chunk(cx, cy, 0, None);
                    let next = cfg.atlas_key_from_chunk(cx + 1, cy, 0, None);
                    assert_eq!(
                        cfg.atlas_world_bounds(&key).max_x,
                        cfg.atlas_world_bounds(&next).min_x
                    );
                    assert!(size < cfg.texture_extent(AtlasKind::Height, 0));
                }
            }
        }
    }

    /// A chunk lies inside the bounds of its atlas.
    #[test]
    fn test_chunk_inside_atlas_bounds() {
        let cfg = s1_config();
        for (cx, cy) in [(0, 0), (7, 7), (8, 0), (-1, -9), (15, 3)] {
            let key = cfg.atlas_key_from_chunk(cx, cy, 0, None);
            let (x, y) = cfg.chunk_center(cx, cy);
            assert!(cfg.atlas_world_bounds(&key).contains(x, y), "chunk {cx},{cy}");
        }
    }

    /// The LOD scenario thresholds select LOD 0 near and LOD 1 at 2 km.
    #[test]
    fn test_lod_for_distance_thresholds() {
        let cfg = s1_config();
        assert_eq!(cfg.lod_for_distance(0.0), 0);
        assert_eq!(cfg.lod_for_distance(2000.0), 1);
        assert_eq!(cfg.lod_for_distance(1.0e9), 4);
    }

    /// Invalid parameters fail construction.
    #[test]
    fn test_invalid_config() {
        assert!(LodAtlasConfig::new(1000, 128, 1024, 2, &[100.0]).is_err());
        assert!(LodAtlasConfig::new(1024, 2048, 1024, 2, &[100.0]).is_err());
        assert!(LodAtlasConfig::new(1024, 128, 1024, 3, &[100.0]).is_err());
    }

    /// Default streaming settings produce a valid atlas config.
    #[test]
    fn test_from_streaming_defaults() {
        let cfg = LodAtlasConfig::from_streaming(&StreamingConfig::default()).unwrap();
        assert_eq!(cfg.max_lod_levels(), 5);
        assert_eq!(cfg.chunks_per_atlas(), 8);
    }

    /// One LOD-0 slot of the default layout holds 1024² texels of each
    /// kind plus the height apron.
    #[test]
    fn test_slot_bytes() {
        let cfg = s1_config();
        let texels = 1024 * 1024;
        let height = 1025 * 1025 * 16;
        assert_eq!(cfg.slot_bytes(0), height + texels * (8 + 16 + 8 + 16));
        assert_eq!(cfg.texture_extent(AtlasKind::Height, 3), 129);
        assert_eq!(cfg.texture_extent(AtlasKind::Tile, 3), 128);
    }

    /// Keys format readably for logs.
    #[test]
    fn test_key_display() {
        let key = AtlasKey::new(Some(CubeFace::PosY), 2, -1, 3);
        assert_eq!(key.to_string(), "PosY/2,-1@lod3");
        assert_eq!(AtlasKey::new(None, 0, 0, 0).face_index(), -1);
    }
}
