//! Vertex layout shared by every terrain chunk pipeline.
//!
//! ## Attribute Packing
//!
//! | Location | Offset | Format    | Fields                               |
//! |----------|--------|-----------|--------------------------------------|
//! | 0        | 0      | Float32x2 | grid position in `[0, n]` per axis   |
//! | 1        | 8      | Float32x2 | chunk UV in `[0, 1]` per axis        |
//!
//! Heights are not stored: the vertex shader reads them from the height
//! atlas, so one vertex buffer serves every chunk.

use std::mem;

use bytemuck::{Pod, Zeroable};
use nebula_render::{VertexAttribute, VertexFormat, VertexLayout, VertexStep};

/// One terrain grid vertex.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    /// Grid coordinates; `(0, 0)` is the chunk's minimum corner.
    pub grid: [f32; 2],
    /// `grid / n`.
    pub uv: [f32; 2],
}

pub const TERRAIN_VERTEX_ATTRIBUTES: [VertexAttribute; 2] = [
    VertexAttribute {
        format: VertexFormat::Float32x2,
        offset: 0,
        location: 0,
    },
    VertexAttribute {
        format: VertexFormat::Float32x2,
        offset: 8,
        location: 1,
    },
];

pub const TERRAIN_VERTEX_LAYOUT: VertexLayout<'static> = VertexLayout {
    stride: mem::size_of::<TerrainVertex>() as u64,
    step: VertexStep::Vertex,
    attributes: &TERRAIN_VERTEX_ATTRIBUTES,
};

const _: () = assert!(
    mem::size_of::<TerrainVertex>() == 16,
    "TerrainVertex size changed, update TERRAIN_VERTEX_LAYOUT"
);
const _: () = assert!(TERRAIN_VERTEX_ATTRIBUTES[0].offset == 0);
const _: () = assert!(TERRAIN_VERTEX_ATTRIBUTES[1].offset == 8);

#[cfg(test)]
mod tests {
    use super::*;

    /// The layout stride covers the whole vertex.
    #[test]
    fn test_layout_stride() {
        assert_eq!(TERRAIN_VERTEX_LAYOUT.stride, 16);
        assert_eq!(TERRAIN_VERTEX_LAYOUT.attributes.len(), 2);
    }

    /// Vertices cast to bytes without padding.
    #[test]
    fn test_vertex_bytes() {
        let v = [TerrainVertex {
            grid: [1.0, 2.0],
            uv: [0.5, 0.25],
        }];
        let bytes: &[u8] = bytemuck::cast_slice(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
    }
}
