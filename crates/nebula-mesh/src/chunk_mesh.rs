//! The shared chunk grid and its precomputed LOD index strips.

use nebula_render::IndexFormat;

use crate::lod_stitching::{MAX_STRIP_LOD, build_lod_indices};
use crate::vertex_format::TerrainVertex;

/// Index data in the narrowest format that addresses every vertex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexData {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    #[must_use]
    pub fn from_indices(indices: Vec<u32>, vertex_count: usize) -> Self {
        if vertex_count <= usize::from(u16::MAX) {
            Self::U16(indices.into_iter().map(|i| i as u16).collect())
        } else {
            Self::U32(indices)
        }
    }

    #[must_use]
    pub fn format(&self) -> IndexFormat {
        match self {
            Self::U16(_) => IndexFormat::U16,
            Self::U32(_) => IndexFormat::U32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::U16(v) => bytemuck::cast_slice(v),
            Self::U32(v) => bytemuck::cast_slice(v),
        }
    }

    /// Index `i` widened to `u32`.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<u32> {
        match self {
            Self::U16(v) => v.get(i).map(|x| u32::from(*x)),
            Self::U32(v) => v.get(i).copied(),
        }
    }
}

/// Vertices and LOD 0..3 index strips for a chunk of `segments` cells.
///
/// Authored once per segment count and shared by every chunk; switching
/// LOD swaps only the index buffer.
#[derive(Clone, Debug)]
pub struct ChunkMeshTemplate {
    segments: u32,
    vertices: Vec<TerrainVertex>,
    strips: Vec<IndexData>,
}

impl ChunkMeshTemplate {
    #[must_use]
    pub fn new(segments: u32) -> Self {
        let segments = segments.max(1);
        let side = segments + 1;
        let inv = 1.0 / segments as f32;
        let mut vertices = Vec::with_capacity((side * side) as usize);
        for y in 0..side {
            for x in 0..side {
                vertices.push(TerrainVertex {
                    grid: [x as f32, y as f32],
                    uv: [x as f32 * inv, y as f32 * inv],
                });
            }
        }
        let strips = (0..=MAX_STRIP_LOD)
            .map(|lod| IndexData::from_indices(build_lod_indices(segments, lod), vertices.len()))
            .collect();
        Self {
            segments,
            vertices,
            strips,
        }
    }

    #[must_use]
    pub fn segments(&self) -> u32 {
        self.segments
    }

    #[must_use]
    pub fn vertices(&self) -> &[TerrainVertex] {
        &self.vertices
    }

    #[must_use]
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Strip for `lod`; LODs past the last strip reuse it.
    #[must_use]
    pub fn indices(&self, lod: u8) -> &IndexData {
        &self.strips[usize::from(lod.min(MAX_STRIP_LOD))]
    }

    #[must_use]
    pub fn triangle_count(&self, lod: u8) -> usize {
        self.indices(lod).len() / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The grid has `(n + 1)²` vertices with UVs spanning `[0, 1]`.
    #[test]
    fn test_grid_vertices() {
        let mesh = ChunkMeshTemplate::new(16);
        assert_eq!(mesh.vertices().len(), 17 * 17);
        assert_eq!(mesh.vertices()[0].uv, [0.0, 0.0]);
        assert_eq!(mesh.vertices()[17 * 17 - 1].uv, [1.0, 1.0]);
        assert_eq!(mesh.vertices()[17 * 3 + 5].grid, [5.0, 3.0]);
    }

    /// Small grids use 16-bit indices, large ones 32-bit.
    #[test]
    fn test_index_format_selection() {
        assert_eq!(ChunkMeshTemplate::new(128).indices(0).format(), IndexFormat::U16);
        let large = ChunkMeshTemplate::new(256);
        assert_eq!(large.indices(0).format(), IndexFormat::U32);
        assert_eq!(large.indices(0).as_bytes().len(), large.indices(0).len() * 4);
    }

    /// LODs beyond the last strip reuse it, and all indices are in range.
    #[test]
    fn test_strip_lookup() {
        let mesh = ChunkMeshTemplate::new(32);
        assert_eq!(mesh.indices(7), mesh.indices(3));
        for lod in 0..=3 {
            let strip = mesh.indices(lod);
            assert!((0..strip.len()).all(|i| strip.get(i).unwrap() < mesh.vertices().len() as u32));
        }
    }
}
