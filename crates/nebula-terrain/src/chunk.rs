//! Chunk data extraction from resident atlases.
//!
//! A request copies the chunk's `(n + 1)²` height rectangle and `n²` tile
//! rectangle into 256-byte-aligned staging buffers and starts two
//! readbacks. Polling on later frames assembles [`ChunkData`] once both
//! buffers are mapped. Height texels past the atlas edge (the last row and
//! column of edge chunks) are evaluated from the sampler at the same world
//! positions the neighbouring atlas uses.

use std::collections::HashMap;

use glam::Vec2;
use nebula_cubesphere::CubeFace;
use nebula_lod::{AtlasKey, AtlasKind, LodAtlasConfig, TextureCache};
use nebula_render::{
    BufferHandle, BufferUsage, GpuBackend, PipelineError, ReadbackStatus, ReadbackToken,
    TextureRegion, padded_bytes_per_row, unpad_rows,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cpu::decode_rgba32f;
use crate::error::GenerationError;
use crate::sampler::{Biome, TerrainSampler, WATER_LEVEL, base_tile, is_feature_tile};
use crate::splat::decode_id;

/// Height and tile data of one chunk at one LOD.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChunkData {
    pub face: Option<CubeFace>,
    pub chunk_x: i32,
    pub chunk_y: i32,
    pub lod: u8,
    /// World origin of the chunk in face-local meters.
    pub offset: [f64; 2],
    /// Texels per chunk side; heights are `(n + 1)²`, tiles `n²`.
    pub resolution: u32,
    pub heights: Vec<f32>,
    pub tiles: Vec<u32>,
    pub is_fully_submerged: bool,
    /// Tile count per biome.
    pub biome_histogram: [u32; Biome::COUNT],
}

impl ChunkData {
    #[must_use]
    pub fn height_at(&self, x: u32, y: u32) -> f32 {
        self.heights[(y * (self.resolution + 1) + x) as usize]
    }

    #[must_use]
    pub fn tile_at(&self, x: u32, y: u32) -> u32 {
        self.tiles[(y * self.resolution + x) as usize]
    }

    /// Fraction of feature tiles whose id is in `valid_tiles`.
    #[must_use]
    pub fn feature_distribution(&self, valid_tiles: &[u32]) -> f32 {
        if self.tiles.is_empty() {
            return 0.0;
        }
        let hits = self
            .tiles
            .iter()
            .filter(|t| is_feature_tile(**t) && valid_tiles.contains(t))
            .count();
        hits as f32 / self.tiles.len() as f32
    }

    fn from_parts(
        target: &ChunkTarget,
        heights: Vec<f32>,
        tiles: Vec<u32>,
    ) -> Self {
        let mut biome_histogram = [0u32; Biome::COUNT];
        for t in &tiles {
            biome_histogram[(base_tile(*t) as usize).min(Biome::COUNT - 1)] += 1;
        }
        Self {
            face: target.face,
            chunk_x: target.chunk_x,
            chunk_y: target.chunk_y,
            lod: target.lod,
            offset: target.offset,
            resolution: target.resolution,
            is_fully_submerged: heights.iter().all(|h| *h < WATER_LEVEL),
            heights,
            tiles,
            biome_histogram,
        }
    }
}

/// Result of polling a chunk data request.
#[derive(Debug)]
pub enum ChunkDataStatus {
    Pending,
    Ready(Box<ChunkData>),
    Failed(String),
}

#[derive(Clone, Copy, Debug)]
struct ChunkTarget {
    face: Option<CubeFace>,
    chunk_x: i32,
    chunk_y: i32,
    lod: u8,
    offset: [f64; 2],
    resolution: u32,
    /// First texel of the chunk in the atlas.
    texel_origin: [u32; 2],
    /// Height texels copied from the atlas per axis.
    copied: [u32; 2],
    atlas: AtlasKey,
}

struct StagedReadback {
    buffer: BufferHandle,
    token: ReadbackToken,
    width: u32,
    height: u32,
    padded_row: u32,
    data: Option<Vec<u8>>,
}

impl StagedReadback {
    fn poll(&mut self, backend: &mut dyn GpuBackend) -> Result<(), String> {
        if self.data.is_some() {
            return Ok(());
        }
        match backend.poll_readback(self.token) {
            ReadbackStatus::Pending => Ok(()),
            ReadbackStatus::Ready(bytes) => {
                let row = self.width * AtlasKind::Height.format().bytes_per_texel();
                self.data = Some(unpad_rows(&bytes, row, self.padded_row, self.height));
                Ok(())
            }
            ReadbackStatus::Failed(reason) => Err(reason),
        }
    }
}

struct PendingChunk {
    target: ChunkTarget,
    height: StagedReadback,
    tile: StagedReadback,
}

/// Tracks chunk data readbacks by the token handed to the caller.
#[derive(Default)]
pub struct ChunkDataReader {
    pending: HashMap<ReadbackToken, PendingChunk>,
}

impl ChunkDataReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Copy the chunk's height and tile texels to staging buffers and start
    /// the readback. The returned token is polled with
    /// [`ChunkDataReader::poll_chunk_data`]; the copy is submitted here.
    #[allow(clippy::too_many_arguments)]
    pub fn request_chunk_data(
        &mut self,
        backend: &mut dyn GpuBackend,
        cache: &TextureCache,
        cfg: &LodAtlasConfig,
        chunk_x: i32,
        chunk_y: i32,
        lod: u8,
        face: Option<CubeFace>,
    ) -> Result<ReadbackToken, GenerationError> {
        let atlas = cfg.atlas_key_from_chunk(chunk_x, chunk_y, lod, face);
        let missing = |kind: AtlasKind| {
            GenerationError::Pipeline(PipelineError::MissingTexture {
                key: atlas.to_string(),
                kind: kind.to_string(),
            })
        };
        let height_tex = cache
            .peek(&atlas, AtlasKind::Height)
            .ok_or_else(|| missing(AtlasKind::Height))?;
        let tile_tex = cache
            .peek(&atlas, AtlasKind::Tile)
            .ok_or_else(|| missing(AtlasKind::Tile))?;

        let extent = cfg.texture_extent(AtlasKind::Height, lod);
        let n = cfg.texels_per_chunk(lod);
        let (lx, ly) = cfg.local_chunk(chunk_x, chunk_y);
        let texel_origin = [lx * n, ly * n];
        let copied = [(n + 1).min(extent - texel_origin[0]), (n + 1).min(extent - texel_origin[1])];
        let (ox, oy) = cfg.chunk_origin(chunk_x, chunk_y);
        let target = ChunkTarget {
            face,
            chunk_x,
            chunk_y,
            lod,
            offset: [ox, oy],
            resolution: n,
            texel_origin,
            copied,
            atlas,
        };

        let bpt = AtlasKind::Height.format().bytes_per_texel();
        let mut staged = Vec::with_capacity(2);
        for (label, tex, width, height) in [
            ("chunk_height_readback", height_tex, copied[0], copied[1]),
            ("chunk_tile_readback", tile_tex, n, n),
        ] {
            let padded_row = padded_bytes_per_row(width, bpt);
            let buffer = backend.create_buffer(
                label,
                u64::from(padded_row) * u64::from(height),
                BufferUsage::READBACK,
            )?;
            let region = TextureRegion {
                texture: tex.texture,
                layer: tex.layer.unwrap_or(0),
                x: texel_origin[0],
                y: texel_origin[1],
                width,
                height,
            };
            let started = backend
                .copy_texture_to_buffer(&region, buffer, padded_row)
                .and_then(|()| backend.read_buffer(buffer));
            match started {
                Ok(token) => staged.push(StagedReadback {
                    buffer,
                    token,
                    width,
                    height,
                    padded_row,
                    data: None,
                }),
                Err(e) => {
                    backend.destroy_buffer(buffer);
                    for s in staged {
                        backend.destroy_buffer(s.buffer);
                    }
                    return Err(e.into());
                }
            }
        }
        backend.submit();

        let mut staged = staged.into_iter();
        let (Some(height), Some(tile)) = (staged.next(), staged.next()) else {
            return Err(missing(AtlasKind::Height));
        };
        let token = height.token;
        debug!("Requested chunk data ({chunk_x}, {chunk_y}) lod {lod} from {atlas}");
        self.pending.insert(
            token,
            PendingChunk {
                target,
                height,
                tile,
            },
        );
        Ok(token)
    }

    /// Non-blocking poll. `Ready` and `Failed` are returned once, after
    /// which the token is forgotten.
    pub fn poll_chunk_data(
        &mut self,
        backend: &mut dyn GpuBackend,
        sampler: &TerrainSampler,
        cfg: &LodAtlasConfig,
        token: ReadbackToken,
    ) -> ChunkDataStatus {
        let Some(entry) = self.pending.get_mut(&token) else {
            return ChunkDataStatus::Failed(format!("unknown chunk readback {}", token.index()));
        };
        let polled = entry
            .height
            .poll(backend)
            .and_then(|()| entry.tile.poll(backend));
        if let Err(reason) = polled {
            if let Some(entry) = self.pending.remove(&token) {
                backend.destroy_buffer(entry.height.buffer);
                backend.destroy_buffer(entry.tile.buffer);
                warn!(
                    "Chunk data readback ({}, {}) failed: {reason}",
                    entry.target.chunk_x, entry.target.chunk_y
                );
            }
            return ChunkDataStatus::Failed(reason);
        }
        if entry.height.data.is_none() || entry.tile.data.is_none() {
            return ChunkDataStatus::Pending;
        }

        let Some(entry) = self.pending.remove(&token) else {
            return ChunkDataStatus::Pending;
        };
        backend.destroy_buffer(entry.height.buffer);
        backend.destroy_buffer(entry.tile.buffer);
        let (Some(height_bytes), Some(tile_bytes)) = (entry.height.data, entry.tile.data) else {
            return ChunkDataStatus::Failed("readback data missing".into());
        };
        let heights = assemble_heights(&entry.target, &decode_rgba32f(&height_bytes), sampler, cfg);
        let tiles = decode_rgba32f(&tile_bytes)
            .iter()
            .map(|t| decode_id(t[0]))
            .collect();
        ChunkDataStatus::Ready(Box::new(ChunkData::from_parts(&entry.target, heights, tiles)))
    }

    /// Drop every pending request, freeing its staging buffers.
    pub fn cancel_all(&mut self, backend: &mut dyn GpuBackend) {
        for (_, entry) in self.pending.drain() {
            backend.destroy_buffer(entry.height.buffer);
            backend.destroy_buffer(entry.tile.buffer);
        }
    }
}

/// Merge copied texels with sampler evaluations for any rim texel the copy
/// could not reach.
fn assemble_heights(
    target: &ChunkTarget,
    copied: &[[f32; 4]],
    sampler: &TerrainSampler,
    cfg: &LodAtlasConfig,
) -> Vec<f32> {
    let side = target.resolution + 1;
    let size = cfg.texture_size(target.lod);
    let spacing = cfg.world_coverage() as f32 / size as f32;
    let bounds = cfg.atlas_world_bounds(&target.atlas);
    let mut heights = Vec::with_capacity((side * side) as usize);
    for j in 0..side {
        for i in 0..side {
            if i < target.copied[0] && j < target.copied[1] {
                heights.push(copied[(j * target.copied[0] + i) as usize][0]);
            } else {
                // Texel index `size` is texel 0 of the next atlas.
                let tx = target.texel_origin[0] + i;
                let ty = target.texel_origin[1] + j;
                let world = rim_world(bounds.min_x, bounds.min_y, tx, ty, size, spacing, cfg);
                heights.push(sampler.height(target.face, world));
            }
        }
    }
    heights
}

fn rim_world(
    min_x: f64,
    min_y: f64,
    tx: u32,
    ty: u32,
    size: u32,
    spacing: f32,
    cfg: &LodAtlasConfig,
) -> Vec2 {
    let coverage = f64::from(cfg.world_coverage());
    let axis = |min: f64, t: u32| {
        if t >= size {
            (min + coverage) as f32 + (t - size) as f32 * spacing
        } else {
            min as f32 + t as f32 * spacing
        }
    };
    Vec2::new(axis(min_x, tx), axis(min_y, ty))
}
