//! Compute-shader uniform blocks.
//!
//! Both layouts are little-endian and std140-compatible; field order matches
//! `TerrainUniforms` in `terrain_atlas.wgsl` and `SplatUniforms` in
//! `splat.wgsl`.

use bytemuck::{Pod, Zeroable};
use nebula_lod::{AtlasKey, LodAtlasConfig};

use crate::sampler::TerrainParams;

/// Terrain atlas uniforms, 80 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TerrainUniform {
    pub world_origin_x: f32,
    pub world_origin_y: f32,
    pub world_coverage: f32,
    pub seed: i32,
    pub elevation_scale: f32,
    pub height_scale: f32,
    pub biome_scale: f32,
    pub region_scale: f32,
    pub detail_scale: f32,
    pub ridge_scale: f32,
    pub valley_scale: f32,
    pub plateau_scale: f32,
    pub world_scale: f32,
    /// 0 height, 1 normal, 2 tile, 3 macro.
    pub output_kind: i32,
    /// Cube face index, `-1` in planar mode.
    pub face: i32,
    pub lod: i32,
    pub texture_size: i32,
    pub _pad: [i32; 3],
}

static_assertions::assert_eq_size!(TerrainUniform, [u8; 80]);

impl TerrainUniform {
    /// Uniforms for one output kind of one atlas slot.
    #[must_use]
    pub fn new(
        params: &TerrainParams,
        cfg: &LodAtlasConfig,
        key: &AtlasKey,
        output_kind: i32,
    ) -> Self {
        let bounds = cfg.atlas_world_bounds(key);
        Self {
            world_origin_x: bounds.min_x as f32,
            world_origin_y: bounds.min_y as f32,
            world_coverage: cfg.world_coverage() as f32,
            seed: params.seed,
            elevation_scale: params.elevation_scale,
            height_scale: params.height_scale,
            biome_scale: params.biome_scale,
            region_scale: params.region_scale,
            detail_scale: params.detail_scale,
            ridge_scale: params.ridge_scale,
            valley_scale: params.valley_scale,
            plateau_scale: params.plateau_scale,
            world_scale: params.world_scale(),
            output_kind,
            face: key.face_index(),
            lod: i32::from(key.lod),
            texture_size: cfg.texture_size(key.lod) as i32,
            _pad: [0; 3],
        }
    }
}

/// Splat pass uniforms, 24 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SplatUniform {
    /// First chunk of the atlas.
    pub chunk_coord_x: i32,
    pub chunk_coord_y: i32,
    /// Chunk side in meters.
    pub chunk_size: i32,
    pub seed: i32,
    /// Splat texels per chunk side.
    pub splat_density: i32,
    /// Kernel side, odd.
    pub kernel_size: i32,
}

static_assertions::assert_eq_size!(SplatUniform, [u8; 24]);

impl SplatUniform {
    #[must_use]
    pub fn new(seed: i32, cfg: &LodAtlasConfig, key: &AtlasKey, kernel_size: u32) -> Self {
        let per_atlas = cfg.chunks_per_atlas() as i32;
        Self {
            chunk_coord_x: key.atlas_x * per_atlas,
            chunk_coord_y: key.atlas_y * per_atlas,
            chunk_size: cfg.base_chunk_size() as i32,
            seed,
            splat_density: cfg.texels_per_chunk(key.lod) as i32,
            kernel_size: kernel_size as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_config::TerrainConfig;

    fn cfg() -> LodAtlasConfig {
        LodAtlasConfig::new(1024, 128, 1024, 5, &[1200.0, 3200.0, 8000.0, 16000.0]).unwrap()
    }

    /// Field offsets follow the shader struct.
    #[test]
    fn test_terrain_uniform_layout() {
        let params = TerrainParams::planar(42, &TerrainConfig::default());
        let key = AtlasKey::new(None, -2, 3, 1);
        let u = TerrainUniform::new(&params, &cfg(), &key, 2);
        let bytes: &[u8] = bytemuck::bytes_of(&u);
        let f32_at = |o: usize| f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
        let i32_at = |o: usize| i32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
        assert_eq!(f32_at(0), -2048.0);
        assert_eq!(f32_at(4), 3072.0);
        assert_eq!(f32_at(8), 1024.0);
        assert_eq!(i32_at(12), 42);
        assert_eq!(f32_at(48), 1.0);
        assert_eq!(i32_at(52), 2);
        assert_eq!(i32_at(56), -1);
        assert_eq!(i32_at(60), 1);
        assert_eq!(i32_at(64), 512);
        assert_eq!(&bytes[68..80], &[0u8; 12]);
    }

    /// The splat block carries the atlas's first chunk and texel density.
    #[test]
    fn test_splat_uniform_values() {
        let key = AtlasKey::new(None, 1, -1, 2);
        let u = SplatUniform::new(42, &cfg(), &key, 5);
        assert_eq!((u.chunk_coord_x, u.chunk_coord_y), (8, -8));
        assert_eq!(u.chunk_size, 128);
        assert_eq!(u.splat_density, 32);
        assert_eq!(bytemuck::bytes_of(&u).len(), 24);
    }
}
