//! Deterministic terrain atlas generation.
//!
//! The same height, tile and splat functions exist twice: as WGSL compute
//! passes and as a CPU reference in [`sampler`] and [`splat`]. Both evaluate
//! the same f32 expressions at the same texel positions, so the CPU path
//! doubles as the fallback for backends without compute and as the oracle
//! in tests.

pub mod chunk;
pub mod cpu;
pub mod error;
pub mod generator;
pub mod hash;
pub mod noise;
pub mod sampler;
pub mod splat;
pub mod uniforms;

pub use chunk::{ChunkData, ChunkDataReader, ChunkDataStatus};
pub use cpu::{AtlasImages, build_atlas_images, decode_rgba32f, encode_texels};
pub use error::GenerationError;
pub use generator::{
    AtlasGenerator, GenerationEvent, GenerationMode, GeneratorOptions, GeneratorStats,
    RequestOutcome,
};
pub use sampler::{
    Biome, FEATURE_TILE_BASE, TerrainDomain, TerrainParams, TerrainSample, TerrainSampler,
    WATER_LEVEL, base_tile, is_feature_tile,
};
pub use splat::{SplatTexel, decode_id};
pub use uniforms::{SplatUniform, TerrainUniform};

/// Hashes, noise and terrain sampling shared by every terrain shader.
pub const TERRAIN_COMMON_WGSL: &str = include_str!("terrain_common.wgsl");

/// Atlas fill pass; `ATLAS_FORMAT` must be replaced with a storage format.
pub const TERRAIN_ATLAS_WGSL: &str = include_str!("terrain_atlas.wgsl");

/// Splat kernel pass.
pub const SPLAT_WGSL: &str = include_str!("splat.wgsl");
