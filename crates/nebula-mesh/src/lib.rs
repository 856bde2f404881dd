//! Terrain chunk meshes: one shared vertex grid per chunk size and
//! precomputed LOD index strips with full-resolution rims.

pub mod chunk_mesh;
pub mod lod_stitching;
pub mod vertex_format;

pub use chunk_mesh::{ChunkMeshTemplate, IndexData};
pub use lod_stitching::{MAX_STRIP_LOD, build_lod_indices, grid_cross, interior_step};
pub use vertex_format::{TERRAIN_VERTEX_ATTRIBUTES, TERRAIN_VERTEX_LAYOUT, TerrainVertex};
