//! Terrain surface material: the chunk render pipeline, the seasonal tile
//! set, and CPU twins of the fragment rules in `terrain.wgsl`.
//!
//! One vertex grid at full chunk resolution is shared by every chunk; the
//! displayed LOD only selects an index strip and the atlases to sample.
//! Per-frame state (camera, atmosphere, environment, tile set) lives in bind
//! group 0, per-chunk state (uniform plus five atlases) in group 1.
//!
//! ## Fragment pipeline
//!
//! 1. Tile id from the tile atlas. Feature-marked ids whose base biome can
//!    not host features are discarded; the rest shade as their base tile.
//! 2. Micro colour from the tile set, variant and quarter-turn picked by
//!    `good_tile_hash`, sampled with clamped analytic gradients.
//! 3. Splat blend of the two dominant tiles below LOD 2.
//! 4. Macro blend at LOD 0.
//! 5. Lighting, aerial perspective, height fog, tonemap.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use nebula_lod::{AtlasKind, LodTexture, TextureRef};
use nebula_mesh::{ChunkMeshTemplate, MAX_STRIP_LOD, TERRAIN_VERTEX_LAYOUT};
use nebula_render::{
    AddressMode, BindGroupHandle, BindingResource, BindingType, BlendMode, BufferHandle,
    BufferUsage, DepthState, DrawCall, FilterMode, GpuBackend, IndexFormat, PipelineHandle,
    RenderPipelineDesc, SamplerDesc, TextureDesc, TextureFormat, TextureHandle,
    TextureRegion, TextureUsage,
};
use nebula_terrain::hash::{hash12, tile_variant};
use nebula_terrain::{Biome, FEATURE_TILE_BASE, base_tile};
use tracing::{debug, info};

use crate::atmosphere::{
    AltitudeFrame, AtmosphereParams, AtmosphereUniform, ap_apply_with_blend, ap_blend,
    ap_compute_simple, tonemap,
};
use crate::environment::EnvironmentUniform;
use crate::error::StreamingError;
use crate::streaming::{ChunkId, StreamingDomain, StreamingManager};

/// Surface shader; compose after the terrain, atmosphere, aerial and
/// environment modules.
pub const TERRAIN_WGSL: &str = include_str!("terrain.wgsl");

/// Variants per tile and season in the tile set.
pub const TILE_VARIANTS: u32 = 4;
pub const SEASONS: u32 = 4;
/// Side of one variant cell in the tile colour texture.
pub const TILE_CELL: u32 = 32;
/// Meters covered by one micro tile.
pub const TILE_WORLD_SIZE: f32 = 4.0;
/// Largest gradient as a fraction of the variant's UV range.
pub const GRADIENT_CLAMP: f32 = 0.25;
/// Splat blending runs below this LOD.
pub const SPLAT_MAX_LOD: u8 = 2;
pub const MACRO_BLEND_MAX: f32 = 0.85;
/// Exposure applied before the `c / (c + 1)` tonemap that keeps the terrain
/// in `[0, 1]`. At 2 a lit albedo of 0.5 maps back to 0.5 and white tops out
/// at 2/3, which keeps the surface in the same range as the tonemapped sky.
pub const SURFACE_EXPOSURE: f32 = 2.0;
const THUNDER_FLASH: f32 = 0.6;

const TILE_KINDS: u32 = Biome::COUNT as u32;

/// GPU layout of `TerrainFrame` in `terrain.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TerrainFrameUniform {
    pub view_proj: [[f32; 4]; 4],
    /// (offset 64)
    pub camera_position: [f32; 3],
    pub time: f32,
    /// (offset 80)
    pub enable_splat: u32,
    pub enable_macro: u32,
    pub splat_neighbors: u32,
    pub spherical: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<TerrainFrameUniform>(), 96);

/// GPU layout of `ChunkParams` in `terrain.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ChunkUniform {
    pub origin: [f32; 2],
    pub uv_offset: [f32; 2],
    pub uv_scale: f32,
    pub chunk_size: f32,
    pub segments: f32,
    pub lod: u32,
    /// `-1` on the flat world.
    pub face: i32,
    pub atlas_size: u32,
    pub planet_radius: f32,
    pub _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ChunkUniform>(), 48);

/// Which optional layers a chunk at a given LOD shades.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceLayers {
    pub splat: bool,
    pub macro_mask: bool,
}

/// Splat below [`SPLAT_MAX_LOD`], macro at LOD 0 only.
#[must_use]
pub fn layers_for_lod(lod: u8, enable_splat: bool, enable_macro: bool) -> SurfaceLayers {
    SurfaceLayers {
        splat: enable_splat && lod < SPLAT_MAX_LOD,
        macro_mask: enable_macro && lod == 0,
    }
}

/// Feature-marked tiles over biomes that never host features.
#[must_use]
pub fn discards_tile(tile: u32) -> bool {
    tile >= FEATURE_TILE_BASE
        && !Biome::from_id(tile - FEATURE_TILE_BASE).is_some_and(Biome::is_vegetated)
}

/// Quarter-turn rotation of a tile-local UV.
#[must_use]
pub fn rotate_uv(uv: Vec2, quarter_turns: u32) -> Vec2 {
    match quarter_turns % 4 {
        1 => Vec2::new(1.0 - uv.y, uv.x),
        2 => Vec2::new(1.0 - uv.x, 1.0 - uv.y),
        3 => Vec2::new(uv.y, 1.0 - uv.x),
        _ => uv,
    }
}

/// Derivative of [`rotate_uv`] applied to a screen-space gradient.
#[must_use]
pub fn rotate_grad(d: Vec2, quarter_turns: u32) -> Vec2 {
    match quarter_turns % 4 {
        1 => Vec2::new(-d.y, d.x),
        2 => -d,
        3 => Vec2::new(d.y, -d.x),
        _ => d,
    }
}

/// Scale a tile-space gradient into a variant rectangle and clamp it.
#[must_use]
pub fn clamp_gradient(grad: Vec2, range: Vec2) -> Vec2 {
    let limit = range * GRADIENT_CLAMP;
    (grad * range).clamp(-limit, limit)
}

/// `c0·w0 + c1·w1` mixed into `base` by `clamp(w0 + w1, 0, 1)`.
#[must_use]
pub fn splat_mix(base: Vec3, c0: Vec3, w0: f32, c1: Vec3, w1: f32) -> Vec3 {
    base.lerp(c0 * w0 + c1 * w1, (w0 + w1).clamp(0.0, 1.0))
}

/// Bilinear weights of the four splat neighbours, in `(0,0) (1,0) (0,1) (1,1)` order.
#[must_use]
pub fn splat_bilinear_weights(f: Vec2) -> [f32; 4] {
    [
        (1.0 - f.x) * (1.0 - f.y),
        f.x * (1.0 - f.y),
        (1.0 - f.x) * f.y,
        f.x * f.y,
    ]
}

#[must_use]
pub fn macro_blend(mask: f32, proc_mask: f32) -> f32 {
    (mask * proc_mask * 0.8).clamp(0.0, MACRO_BLEND_MAX)
}

/// `ambient·0.35 + sun·intensity·max(N·L, 0)·0.9`, plus any thunder flash.
#[must_use]
pub fn terrain_lighting(env: &EnvironmentUniform, n: Vec3) -> Vec3 {
    let ambient = Vec3::from(env.ambient_color) * 0.35;
    let sun = Vec3::from(env.sun_direction);
    let diffuse = Vec3::from(env.sun_color) * env.sun_intensity * n.dot(sun).max(0.0) * 0.9;
    ambient + diffuse + Vec3::splat(env.thunder_intensity * THUNDER_FLASH)
}

/// `mix(fog, color, exp(−density·exp(−alt/H)·d))`.
#[must_use]
pub fn height_fog(env: &EnvironmentUniform, color: Vec3, distance: f32, avg_alt: f32) -> Vec3 {
    let density = env.fog_density * (-avg_alt.max(0.0) / env.fog_scale_height.max(1.0)).exp();
    let transmittance = (-density * distance).exp();
    Vec3::from(env.fog_color).lerp(color, transmittance)
}

/// Everything after the albedo: lighting, aerial perspective, fog, tonemap.
#[must_use]
pub fn shade_surface(
    albedo: Vec3,
    normal: Vec3,
    world: Vec3,
    camera: Vec3,
    env: &EnvironmentUniform,
    atmosphere: &AtmosphereParams,
    frame: AltitudeFrame,
) -> Vec3 {
    let mut color = albedo * terrain_lighting(env, normal);
    let distance = (world - camera).length();
    let sun = Vec3::from(env.sun_direction);
    let ap = ap_compute_simple(world, camera, sun, atmosphere, frame);
    color = ap_apply_with_blend(color, &ap, ap_blend(distance));
    let avg_alt = 0.5 * (frame.altitude(atmosphere, camera) + frame.altitude(atmosphere, world));
    color = height_fog(env, color, distance, avg_alt);
    tonemap(color * SURFACE_EXPOSURE).clamp(Vec3::ZERO, Vec3::ONE)
}

fn base_color(biome: Biome) -> Vec3 {
    match biome {
        Biome::Water => Vec3::new(0.09, 0.22, 0.38),
        Biome::Beach => Vec3::new(0.76, 0.70, 0.50),
        Biome::Grass => Vec3::new(0.30, 0.52, 0.20),
        Biome::Forest => Vec3::new(0.15, 0.33, 0.13),
        Biome::Meadow => Vec3::new(0.46, 0.58, 0.26),
        Biome::Rock => Vec3::new(0.44, 0.42, 0.40),
        Biome::Tundra => Vec3::new(0.52, 0.50, 0.42),
        Biome::Snow => Vec3::new(0.92, 0.94, 0.97),
        Biome::Desert => Vec3::new(0.82, 0.66, 0.44),
    }
}

fn season_tint(biome: Biome, season: u32) -> Vec3 {
    if !biome.is_vegetated() {
        return Vec3::ONE;
    }
    match season {
        0 => Vec3::new(0.95, 1.08, 0.92),
        2 => Vec3::new(1.35, 0.95, 0.55),
        3 => Vec3::new(1.6, 1.5, 1.7),
        _ => Vec3::ONE,
    }
}

/// Per-season tile variants: the lookup table of variant rectangles and the
/// colour texture they point into.
#[derive(Clone, Debug)]
pub struct TileSet {
    /// `[u_min, v_min, u_max, v_max]` per `(variant, season · 9 + tile)`.
    lookup: Vec<[f32; 4]>,
    colors: Vec<u8>,
}

impl TileSet {
    pub const LOOKUP_WIDTH: u32 = TILE_VARIANTS;
    pub const LOOKUP_HEIGHT: u32 = TILE_KINDS * SEASONS;
    pub const COLOR_WIDTH: u32 = TILE_VARIANTS * TILE_CELL;
    pub const COLOR_HEIGHT: u32 = TILE_KINDS * SEASONS * TILE_CELL;

    /// Procedural palette: [`Self::cell_color`] speckled by `hash12`. The
    /// speckle repeats per tile so seasons only change the tint.
    #[must_use]
    pub fn build() -> Self {
        let w = Self::COLOR_WIDTH as f32;
        let h = Self::COLOR_HEIGHT as f32;
        let mut lookup = Vec::with_capacity((Self::LOOKUP_WIDTH * Self::LOOKUP_HEIGHT) as usize);
        for row in 0..Self::LOOKUP_HEIGHT {
            for variant in 0..TILE_VARIANTS {
                let x0 = (variant * TILE_CELL) as f32;
                let y0 = (row * TILE_CELL) as f32;
                let cell = TILE_CELL as f32;
                lookup.push([
                    (x0 + 0.5) / w,
                    (y0 + 0.5) / h,
                    (x0 + cell - 0.5) / w,
                    (y0 + cell - 0.5) / h,
                ]);
            }
        }

        let mut colors = Vec::with_capacity((Self::COLOR_WIDTH * Self::COLOR_HEIGHT * 4) as usize);
        for y in 0..Self::COLOR_HEIGHT {
            let row = y / TILE_CELL;
            let season = row / TILE_KINDS;
            let tile = row % TILE_KINDS;
            for x in 0..Self::COLOR_WIDTH {
                let variant = x / TILE_CELL;
                let speckle = 0.85 + 0.3 * hash12(x as f32, (tile * TILE_CELL + y % TILE_CELL) as f32);
                let c = (Self::cell_color(tile, variant, season) * speckle).clamp(Vec3::ZERO, Vec3::ONE);
                colors.extend_from_slice(&[
                    (c.x * 255.0).round() as u8,
                    (c.y * 255.0).round() as u8,
                    (c.z * 255.0).round() as u8,
                    255,
                ]);
            }
        }
        Self { lookup, colors }
    }

    /// Variant rectangle of `tile` (feature marker ignored) in `season`.
    #[must_use]
    pub fn rect(&self, tile: u32, variant: u32, season: u32) -> [f32; 4] {
        let tile = base_tile(tile).min(TILE_KINDS - 1);
        let row = (season % SEASONS) * TILE_KINDS + tile;
        let index = row * TILE_VARIANTS + variant.min(TILE_VARIANTS - 1);
        self.lookup[index as usize]
    }

    /// Tile-set UV sampled for `tile` at face-local `surface` meters.
    #[must_use]
    pub fn sample_uv(&self, tile: u32, surface: Vec2, season: u32) -> Vec2 {
        let scaled = surface / TILE_WORLD_SIZE;
        let cell = scaled.floor();
        let (variant, degrees) = tile_variant(cell.x, cell.y, tile, season, TILE_VARIANTS);
        let [u0, v0, u1, v1] = self.rect(tile, variant, season);
        let min = Vec2::new(u0, v0);
        let range = Vec2::new(u1, v1) - min;
        min + rotate_uv(scaled - cell, degrees / 90) * range
    }

    /// Unspeckled colour of one variant cell.
    #[must_use]
    pub fn cell_color(tile: u32, variant: u32, season: u32) -> Vec3 {
        let biome = Biome::from_id(base_tile(tile)).unwrap_or(Biome::Rock);
        base_color(biome) * season_tint(biome, season % SEASONS) * (0.9 + 0.06 * variant as f32)
    }

    #[must_use]
    pub fn lookup_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.lookup)
    }

    #[must_use]
    pub fn color_bytes(&self) -> &[u8] {
        &self.colors
    }
}

/// Per-frame inputs of the terrain pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainFrameInputs {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    pub time: f32,
    pub enable_splat: bool,
    pub enable_macro: bool,
    /// 1 or 4 splat taps.
    pub splat_neighbors: u32,
}

/// Counters from one terrain draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TerrainDrawStats {
    pub drawn: usize,
    /// Active chunks without a drawable LOD this frame.
    pub skipped: usize,
    pub triangles: usize,
}

struct StripBuffer {
    buffer: BufferHandle,
    format: IndexFormat,
    count: u32,
}

struct ChunkBinding {
    uniform: BufferHandle,
    bind_group: BindGroupHandle,
    textures: [Option<TextureRef>; 5],
    seen_frame: u64,
}

const BINDING_KINDS: [AtlasKind; 5] = [
    AtlasKind::Height,
    AtlasKind::Normal,
    AtlasKind::Tile,
    AtlasKind::Splat,
    AtlasKind::Macro,
];

fn upload_padded(
    gpu: &mut dyn GpuBackend,
    label: &str,
    bytes: &[u8],
    usage: BufferUsage,
) -> Result<BufferHandle, StreamingError> {
    let mut data = bytes.to_vec();
    data.resize(data.len().next_multiple_of(4), 0);
    let buffer = gpu.create_buffer(label, data.len() as u64, usage)?;
    gpu.write_buffer(buffer, 0, &data)?;
    Ok(buffer)
}

/// The terrain render pipeline with its shared mesh and tile set.
pub struct TerrainMaterial {
    pipeline: PipelineHandle,
    frame_uniform: BufferHandle,
    atmosphere_uniform: BufferHandle,
    environment_uniform: BufferHandle,
    tile_lookup: TextureHandle,
    tile_colors: TextureHandle,
    placeholder: TextureHandle,
    frame_group: BindGroupHandle,
    segments: u32,
    vertices: BufferHandle,
    strips: Vec<StripBuffer>,
    chunks: HashMap<ChunkId, ChunkBinding>,
    frame: u64,
}

impl TerrainMaterial {
    /// Build the pipeline, upload the tile set and the mesh for chunks of
    /// `segments` cells.
    pub fn new(
        gpu: &mut dyn GpuBackend,
        color_format: TextureFormat,
        segments: u32,
    ) -> Result<Self, StreamingError> {
        let shader = nebula_render::compose_wgsl(&[
            nebula_terrain::TERRAIN_COMMON_WGSL,
            crate::atmosphere::ATMOSPHERE_COMMON_WGSL,
            crate::atmosphere::AERIAL_PERSPECTIVE_WGSL,
            crate::environment::ENVIRONMENT_WGSL,
            TERRAIN_WGSL,
        ]);
        let raw = BindingType::Texture {
            filterable: false,
            array: false,
        };
        let frame_layout = [
            BindingType::UniformBuffer,
            BindingType::UniformBuffer,
            BindingType::UniformBuffer,
            raw,
            BindingType::Texture {
                filterable: true,
                array: false,
            },
            BindingType::Sampler { filtering: true },
        ];
        let chunk_layout = [BindingType::UniformBuffer, raw, raw, raw, raw, raw];
        let pipeline = gpu.create_render_pipeline(&RenderPipelineDesc {
            label: "terrain",
            shader: &shader,
            vs_entry: "vs_main",
            fs_entry: "fs_main",
            vertex_layouts: &[TERRAIN_VERTEX_LAYOUT],
            bind_group_layouts: &[&frame_layout, &chunk_layout],
            color_format,
            depth: Some(DepthState::REVERSE_Z),
            blend: BlendMode::Opaque,
            cull_back_faces: false,
        })?;

        let frame_uniform = gpu.create_buffer(
            "terrain_frame",
            std::mem::size_of::<TerrainFrameUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let atmosphere_uniform = gpu.create_buffer(
            "terrain_atmosphere",
            std::mem::size_of::<AtmosphereUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let environment_uniform = gpu.create_buffer(
            "terrain_environment",
            std::mem::size_of::<EnvironmentUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;

        let tiles = TileSet::build();
        let tile_lookup = gpu.create_texture_2d(&TextureDesc {
            label: "tile_lookup",
            width: TileSet::LOOKUP_WIDTH,
            height: TileSet::LOOKUP_HEIGHT,
            layers: 1,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::UPLOAD,
        })?;
        gpu.write_texture(
            &TextureRegion::full(tile_lookup, 0, TileSet::LOOKUP_WIDTH, TileSet::LOOKUP_HEIGHT),
            tiles.lookup_bytes(),
            TileSet::LOOKUP_WIDTH * 16,
        )?;
        let tile_colors = gpu.create_texture_2d(&TextureDesc {
            label: "tile_colors",
            width: TileSet::COLOR_WIDTH,
            height: TileSet::COLOR_HEIGHT,
            layers: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::UPLOAD,
        })?;
        gpu.write_texture(
            &TextureRegion::full(tile_colors, 0, TileSet::COLOR_WIDTH, TileSet::COLOR_HEIGHT),
            tiles.color_bytes(),
            TileSet::COLOR_WIDTH * 4,
        )?;
        let sampler = gpu.create_sampler(&SamplerDesc {
            filter: FilterMode::Linear,
            address: AddressMode::ClampToEdge,
        })?;
        let placeholder = gpu.create_texture_2d(&TextureDesc {
            label: "terrain_placeholder",
            width: 1,
            height: 1,
            layers: 1,
            format: TextureFormat::Rgba32Float,
            usage: TextureUsage::UPLOAD,
        })?;
        gpu.write_texture(
            &TextureRegion::full(placeholder, 0, 1, 1),
            bytemuck::cast_slice(&[0.5f32, 1.0, 0.5, 1.0]),
            16,
        )?;

        let frame_group = gpu.create_bind_group(
            pipeline,
            0,
            &[
                BindingResource::Buffer(frame_uniform),
                BindingResource::Buffer(atmosphere_uniform),
                BindingResource::Buffer(environment_uniform),
                BindingResource::Texture {
                    texture: tile_lookup,
                    layer: None,
                },
                BindingResource::Texture {
                    texture: tile_colors,
                    layer: None,
                },
                BindingResource::Sampler(sampler),
            ],
        )?;

        let template = ChunkMeshTemplate::new(segments);
        let vertices = upload_padded(gpu, "terrain_vertices", template.vertex_bytes(), BufferUsage::VERTEX)?;
        let mut strips = Vec::with_capacity(usize::from(MAX_STRIP_LOD) + 1);
        for lod in 0..=MAX_STRIP_LOD {
            let indices = template.indices(lod);
            strips.push(StripBuffer {
                buffer: upload_padded(gpu, "terrain_indices", indices.as_bytes(), BufferUsage::INDEX)?,
                format: indices.format(),
                count: indices.len() as u32,
            });
        }
        info!(
            "Terrain material ready: {} segments, {} strips",
            template.segments(),
            strips.len()
        );

        Ok(Self {
            pipeline,
            frame_uniform,
            atmosphere_uniform,
            environment_uniform,
            tile_lookup,
            tile_colors,
            placeholder,
            frame_group,
            segments: template.segments(),
            vertices,
            strips,
            chunks: HashMap::new(),
            frame: 0,
        })
    }

    #[must_use]
    pub fn segments(&self) -> u32 {
        self.segments
    }

    /// Chunks holding a bind group.
    #[must_use]
    pub fn bound_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Upload the frame uniforms and draw every drawable chunk into the open
    /// pass. Chunks without a resident LOD are skipped and show the sky.
    pub fn draw(
        &mut self,
        gpu: &mut dyn GpuBackend,
        inputs: &TerrainFrameInputs,
        atmosphere: &AtmosphereUniform,
        environment: &EnvironmentUniform,
        streaming: &StreamingManager,
    ) -> Result<TerrainDrawStats, StreamingError> {
        self.frame += 1;
        let (face_radius, spherical) = match streaming.domain() {
            StreamingDomain::Planar => (0.0, false),
            StreamingDomain::Spherical(surface) => (surface.radius_m as f32, true),
        };
        let frame = TerrainFrameUniform {
            view_proj: inputs.view_proj.to_cols_array_2d(),
            camera_position: inputs.camera_position.to_array(),
            time: inputs.time,
            enable_splat: u32::from(inputs.enable_splat),
            enable_macro: u32::from(inputs.enable_macro),
            splat_neighbors: inputs.splat_neighbors,
            spherical: u32::from(spherical),
        };
        gpu.write_buffer(self.frame_uniform, 0, bytemuck::bytes_of(&frame))?;
        gpu.write_buffer(self.atmosphere_uniform, 0, bytemuck::bytes_of(atmosphere))?;
        gpu.write_buffer(self.environment_uniform, 0, bytemuck::bytes_of(environment))?;

        let cfg = streaming.config();
        let mut stats = TerrainDrawStats::default();
        for (id, chunk) in streaming.chunks() {
            let (Some(lod), Some(height)) = (chunk.display_lod, chunk.textures.get(AtlasKind::Height))
            else {
                stats.skipped += 1;
                continue;
            };
            if !chunk.textures.is_drawable() {
                stats.skipped += 1;
                continue;
            }
            let (ox, oy) = cfg.chunk_origin(chunk.coord.x, chunk.coord.y);
            let uniform = ChunkUniform {
                origin: [ox as f32, oy as f32],
                uv_offset: height.uv_transform.offset,
                uv_scale: height.uv_transform.scale,
                chunk_size: cfg.base_chunk_size() as f32,
                segments: self.segments as f32,
                lod: u32::from(lod),
                face: chunk.coord.face.map_or(-1, |f| f.index()),
                atlas_size: cfg.texture_size(lod),
                planet_radius: face_radius,
                _pad: 0,
            };
            let textures = BINDING_KINDS.map(|k| chunk.textures.get(k).map(|t: &LodTexture| t.texture));
            let bind_group = self.chunk_group(gpu, id, textures)?;
            let binding = self.chunks.get(&id).map(|b| b.uniform);
            if let Some(buffer) = binding {
                gpu.write_buffer(buffer, 0, bytemuck::bytes_of(&uniform))?;
            }

            let strip = &self.strips[usize::from(lod.min(MAX_STRIP_LOD))];
            gpu.draw(&DrawCall {
                pipeline: self.pipeline,
                bind_groups: &[self.frame_group, bind_group],
                vertex_buffers: &[self.vertices],
                index_buffer: Some((strip.buffer, strip.format)),
                count: strip.count,
                instance_count: 1,
            })?;
            stats.drawn += 1;
            stats.triangles += strip.count as usize / 3;
        }
        self.release_unseen(gpu);
        if stats.skipped > 0 {
            debug!("Terrain frame {}: {} chunks skipped, no resident LOD", self.frame, stats.skipped);
        }
        Ok(stats)
    }

    fn chunk_group(
        &mut self,
        gpu: &mut dyn GpuBackend,
        id: ChunkId,
        textures: [Option<TextureRef>; 5],
    ) -> Result<BindGroupHandle, StreamingError> {
        if let Some(binding) = self.chunks.get_mut(&id) {
            binding.seen_frame = self.frame;
            if binding.textures == textures {
                return Ok(binding.bind_group);
            }
            gpu.destroy_bind_group(binding.bind_group);
            let bind_group = Self::create_chunk_group(gpu, self.pipeline, binding.uniform, &textures, self.placeholder)?;
            binding.bind_group = bind_group;
            binding.textures = textures;
            return Ok(bind_group);
        }
        let uniform = gpu.create_buffer(
            "terrain_chunk",
            std::mem::size_of::<ChunkUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let bind_group = Self::create_chunk_group(gpu, self.pipeline, uniform, &textures, self.placeholder)?;
        self.chunks.insert(
            id,
            ChunkBinding {
                uniform,
                bind_group,
                textures,
                seen_frame: self.frame,
            },
        );
        Ok(bind_group)
    }

    fn create_chunk_group(
        gpu: &mut dyn GpuBackend,
        pipeline: PipelineHandle,
        uniform: BufferHandle,
        textures: &[Option<TextureRef>; 5],
        placeholder: TextureHandle,
    ) -> Result<BindGroupHandle, StreamingError> {
        let mut entries = Vec::with_capacity(6);
        entries.push(BindingResource::Buffer(uniform));
        for t in textures {
            entries.push(match t {
                Some(r) => BindingResource::Texture {
                    texture: r.texture,
                    layer: r.layer,
                },
                None => BindingResource::Texture {
                    texture: placeholder,
                    layer: None,
                },
            });
        }
        Ok(gpu.create_bind_group(pipeline, 1, &entries)?)
    }

    fn release_unseen(&mut self, gpu: &mut dyn GpuBackend) {
        let frame = self.frame;
        self.chunks.retain(|_, b| {
            if b.seen_frame == frame {
                return true;
            }
            gpu.destroy_bind_group(b.bind_group);
            gpu.destroy_buffer(b.uniform);
            false
        });
    }

    /// Free every GPU resource.
    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend) {
        for (_, b) in self.chunks.drain() {
            gpu.destroy_bind_group(b.bind_group);
            gpu.destroy_buffer(b.uniform);
        }
        for strip in self.strips.drain(..) {
            gpu.destroy_buffer(strip.buffer);
        }
        gpu.destroy_bind_group(self.frame_group);
        gpu.destroy_buffer(self.vertices);
        gpu.destroy_buffer(self.frame_uniform);
        gpu.destroy_buffer(self.atmosphere_uniform);
        gpu.destroy_buffer(self.environment_uniform);
        gpu.destroy_texture(self.tile_lookup);
        gpu.destroy_texture(self.tile_colors);
        gpu.destroy_texture(self.placeholder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_config::StreamingConfig;
    use nebula_lod::LodAtlasConfig;
    use nebula_render::{ApiName, BackendCapabilities, PassDesc, SoftwareBackend};
    use nebula_terrain::{AtlasGenerator, GeneratorOptions, TerrainParams};

    use crate::streaming::CameraView;

    fn validate(label: &str, source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("{label}: {}", e.emit_to_string(source)));
        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator
            .validate(&module)
            .unwrap_or_else(|e| panic!("{label}: {e:?}"));
    }

    fn env() -> EnvironmentUniform {
        EnvironmentUniform {
            sun_direction: [0.0, 1.0, 0.0],
            sun_intensity: 1.0,
            sun_color: [1.0, 0.95, 0.9],
            daylight: 1.0,
            ambient_color: [0.4, 0.45, 0.5],
            fog_density: 0.0,
            fog_color: [0.7, 0.75, 0.8],
            fog_scale_height: 200.0,
            wind_direction: [1.0, 0.0],
            wind_speed: 1.0,
            weather_intensity: 0.0,
            thunder_intensity: 0.0,
            season: 1,
            time: 0.0,
            weather: 0,
        }
    }

    /// The composed surface shader parses and validates.
    #[test]
    fn test_terrain_shader_validates() {
        let source = nebula_render::compose_wgsl(&[
            nebula_terrain::TERRAIN_COMMON_WGSL,
            crate::atmosphere::ATMOSPHERE_COMMON_WGSL,
            crate::atmosphere::AERIAL_PERSPECTIVE_WGSL,
            crate::environment::ENVIRONMENT_WGSL,
            TERRAIN_WGSL,
        ]);
        validate("terrain", &source);
    }

    /// Uniform fields land at the offsets the shader reads.
    #[test]
    fn test_uniform_layouts() {
        let u = ChunkUniform {
            origin: [1.0, 2.0],
            uv_offset: [0.25, 0.5],
            uv_scale: 0.125,
            chunk_size: 128.0,
            segments: 128.0,
            lod: 2,
            face: -1,
            atlas_size: 256,
            planet_radius: 0.0,
            _pad: 0,
        };
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&u));
        assert_eq!(words.len() * 4, 48);
        assert_eq!(f32::from_bits(words[4]), 0.125, "uv_scale at 16");
        assert_eq!(words[7], 2, "lod at 28");
        assert_eq!(words[8] as i32, -1, "face at 32");
        assert_eq!(std::mem::size_of::<TerrainFrameUniform>(), 96);
    }

    /// Feature markers over vegetated biomes shade as their base tile; over
    /// anything else they are discarded.
    #[test]
    fn test_tile_discard_rule() {
        assert!(!discards_tile(Biome::Grass.id()));
        assert!(!discards_tile(Biome::Rock.id()));
        assert!(!discards_tile(FEATURE_TILE_BASE + Biome::Grass.id()));
        assert!(!discards_tile(FEATURE_TILE_BASE + Biome::Meadow.id()));
        assert!(discards_tile(FEATURE_TILE_BASE + Biome::Water.id()));
        assert!(discards_tile(FEATURE_TILE_BASE + Biome::Snow.id()));
        assert!(discards_tile(FEATURE_TILE_BASE + 40));
    }

    /// Quarter turns map tile corners onto corners and the gradient rotation
    /// is the derivative of the UV rotation.
    #[test]
    fn test_rotation_consistency() {
        assert_eq!(rotate_uv(Vec2::new(0.0, 0.0), 1), Vec2::new(1.0, 0.0));
        assert_eq!(rotate_uv(Vec2::new(0.25, 0.75), 4), Vec2::new(0.25, 0.75));
        let p = Vec2::new(0.3, 0.6);
        let d = Vec2::new(0.01, -0.02);
        for turns in 0..4 {
            let fd = rotate_uv(p + d, turns) - rotate_uv(p, turns);
            assert!((fd - rotate_grad(d, turns)).length() < 1e-6, "turns {turns}");
        }
    }

    /// Gradients are clamped to a quarter of the variant range.
    #[test]
    fn test_gradient_clamp() {
        let range = Vec2::new(0.2, 0.1);
        let g = clamp_gradient(Vec2::new(10.0, -10.0), range);
        assert_eq!(g, Vec2::new(0.05, -0.025));
        let small = clamp_gradient(Vec2::new(0.1, 0.1), range);
        assert!((small - Vec2::new(0.02, 0.01)).length() < 1e-7);
    }

    /// Variant rectangles stay inside the texture, inset by half a texel,
    /// and the sampled UV falls inside the chosen rectangle.
    #[test]
    fn test_tile_set_rects() {
        let tiles = TileSet::build();
        assert_eq!(tiles.lookup_bytes().len(), (TileSet::LOOKUP_WIDTH * TileSet::LOOKUP_HEIGHT * 16) as usize);
        assert_eq!(
            tiles.color_bytes().len(),
            (TileSet::COLOR_WIDTH * TileSet::COLOR_HEIGHT * 4) as usize
        );
        for season in 0..SEASONS {
            for tile in 0..TILE_KINDS {
                for v in 0..TILE_VARIANTS {
                    let [u0, v0, u1, v1] = tiles.rect(tile, v, season);
                    assert!(u0 > 0.0 && v0 > 0.0 && u1 < 1.0 && v1 < 1.0);
                    assert!(u1 > u0 && v1 > v0);
                }
            }
        }
        let surface = Vec2::new(123.4, -56.7);
        let uv = tiles.sample_uv(Biome::Forest.id(), surface, 2);
        let cell = (surface / TILE_WORLD_SIZE).floor();
        let (variant, _) = tile_variant(cell.x, cell.y, Biome::Forest.id(), 2, TILE_VARIANTS);
        let [u0, v0, u1, v1] = tiles.rect(Biome::Forest.id(), variant, 2);
        assert!(uv.x >= u0 && uv.x <= u1 && uv.y >= v0 && uv.y <= v1, "uv {uv}");
    }

    /// Feature-marked ids share their base tile's rectangles, and seasons
    /// recolour vegetation only.
    #[test]
    fn test_tile_set_seasons() {
        let tiles = TileSet::build();
        let grass = Biome::Grass.id();
        assert_eq!(tiles.rect(grass, 1, 0), tiles.rect(FEATURE_TILE_BASE + grass, 1, 0));
        let summer = TileSet::cell_color(grass, 0, 1);
        let autumn = TileSet::cell_color(grass, 0, 2);
        assert!(autumn.x > summer.x, "autumn grass is warmer: {autumn} vs {summer}");
        let rock = Biome::Rock.id();
        assert_eq!(TileSet::cell_color(rock, 2, 1), TileSet::cell_color(rock, 2, 3));

        // Same pixel of a rock cell in summer and winter.
        let bytes = tiles.color_bytes();
        let texel = |season: u32| {
            let y = (season * TILE_KINDS + rock) * TILE_CELL + 5;
            let i = ((y * TileSet::COLOR_WIDTH + 7) * 4) as usize;
            [bytes[i], bytes[i + 1], bytes[i + 2]]
        };
        assert_eq!(texel(1), texel(3));
    }

    /// Splat weights summing to one replace the base colour; zero weights
    /// keep it; bilinear weights sum to one.
    #[test]
    fn test_splat_mix() {
        let base = Vec3::new(1.0, 0.0, 0.0);
        let c0 = Vec3::new(0.0, 1.0, 0.0);
        let c1 = Vec3::new(0.0, 0.0, 1.0);
        let full = splat_mix(base, c0, 0.78125, c1, 0.21875);
        assert!((full - Vec3::new(0.0, 0.78125, 0.21875)).length() < 1e-6);
        assert_eq!(splat_mix(base, c0, 0.0, c1, 0.0), base);
        let w = splat_bilinear_weights(Vec2::new(0.3, 0.8));
        assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert_eq!(splat_bilinear_weights(Vec2::ZERO), [1.0, 0.0, 0.0, 0.0]);
    }

    /// The macro blend factor never exceeds 0.85.
    #[test]
    fn test_macro_blend_clamp() {
        assert_eq!(macro_blend(1.0, 1.0), 0.8);
        assert_eq!(macro_blend(2.0, 1.0), MACRO_BLEND_MAX);
        assert_eq!(macro_blend(0.0, 1.0), 0.0);
        assert_eq!(macro_blend(-1.0, 1.0), 0.0);
    }

    /// Splat runs at LOD 0 and 1, macro only at LOD 0, and both respect the
    /// switches.
    #[test]
    fn test_layers_for_lod() {
        assert_eq!(layers_for_lod(0, true, true), SurfaceLayers { splat: true, macro_mask: true });
        assert_eq!(layers_for_lod(1, true, true), SurfaceLayers { splat: true, macro_mask: false });
        assert_eq!(layers_for_lod(2, true, true), SurfaceLayers { splat: false, macro_mask: false });
        assert_eq!(layers_for_lod(0, false, false), SurfaceLayers { splat: false, macro_mask: false });
    }

    /// A surface facing away from the sun only receives ambient light.
    #[test]
    fn test_lighting_terms() {
        let e = env();
        let away = terrain_lighting(&e, -Vec3::Y);
        assert!((away - Vec3::new(0.14, 0.1575, 0.175)).length() < 1e-6, "{away}");
        let lit = terrain_lighting(&e, Vec3::Y);
        assert!((lit - away - Vec3::new(0.9, 0.855, 0.81)).length() < 1e-5, "{lit}");
        let flash = terrain_lighting(&EnvironmentUniform { thunder_intensity: 1.0, ..e }, -Vec3::Y);
        assert!((flash - away - Vec3::splat(THUNDER_FLASH)).length() < 1e-6);
    }

    /// Height fog follows `exp(−density·exp(−alt/H)·d)`.
    #[test]
    fn test_height_fog() {
        let e = EnvironmentUniform {
            fog_density: 0.001,
            ..env()
        };
        let c = Vec3::ZERO;
        let near = height_fog(&e, c, 1000.0, 0.0);
        let t = (-1.0f32).exp();
        assert!((near - Vec3::from(e.fog_color) * (1.0 - t)).length() < 1e-5);
        let high = height_fog(&e, c, 1000.0, 200.0);
        assert!(high.x < near.x, "thinner fog at altitude");
        assert_eq!(height_fog(&env(), Vec3::ONE, 5000.0, 0.0), Vec3::ONE);
    }

    /// Distant fragments gain haze but the output stays in `[0, 1]`.
    #[test]
    fn test_shade_surface_haze() {
        let atmo = AtmosphereParams::earth_like(50_000.0);
        let e = env();
        let camera = Vec3::new(0.0, 100.0, 0.0);
        let albedo = Vec3::new(0.2, 0.35, 0.1);
        let near = shade_surface(albedo, Vec3::Y, Vec3::new(50.0, 100.0, 0.0), camera, &e, &atmo, AltitudeFrame::Planar);
        let far = shade_surface(albedo, Vec3::Y, Vec3::new(25_000.0, 100.0, 0.0), camera, &e, &atmo, AltitudeFrame::Planar);
        for c in [near, far] {
            assert!(c.min_element() >= 0.0 && c.max_element() <= 1.0, "{c}");
        }
        assert!(far.z > near.z, "haze is blue: near {near} far {far}");
    }

    /// The exposure leaves mid grey unchanged and never saturates white.
    #[test]
    fn test_surface_exposure() {
        let mid = tonemap(Vec3::splat(0.5) * SURFACE_EXPOSURE);
        assert!((mid - Vec3::splat(0.5)).length() < 1e-6, "{mid}");
        let atmo = AtmosphereParams::earth_like(50_000.0);
        let camera = Vec3::new(0.0, 100.0, 0.0);
        let white = shade_surface(Vec3::ONE, Vec3::Y, Vec3::new(10.0, 100.0, 0.0), camera, &env(), &atmo, AltitudeFrame::Planar);
        assert!(white.max_element() < 1.0, "{white}");
        let grey = shade_surface(Vec3::splat(0.5), Vec3::Y, Vec3::new(10.0, 100.0, 0.0), camera, &env(), &atmo, AltitudeFrame::Planar);
        assert!(grey.x < white.x, "grey {grey} white {white}");
    }

    /// Drawing with the software backend issues one indexed draw per
    /// drawable chunk and releases bindings of chunks that went away.
    #[test]
    fn test_draw_streamed_chunks() {
        let mut gpu = SoftwareBackend::with_capabilities(ApiName::WebGpu, BackendCapabilities::FULL);
        let settings = StreamingConfig {
            base_texture_size: 64,
            stream_radius: 200.0,
            ..StreamingConfig::default()
        };
        let cfg = LodAtlasConfig::from_streaming(&settings).unwrap();
        let generator = AtlasGenerator::new(
            &mut gpu,
            cfg.clone(),
            TerrainParams::planar(settings.seed, &nebula_config::TerrainConfig::default()),
            GeneratorOptions::from_streaming(&settings),
        )
        .unwrap();
        let mut streaming = StreamingManager::new(&settings, generator, StreamingDomain::Planar);
        let view = CameraView {
            position: glam::DVec3::new(64.0, 100.0, 64.0),
            forward: glam::DVec3::X,
        };
        streaming.refresh_residency(&view, 0);
        for frame in 0..40 {
            gpu.poll();
            streaming.update(&mut gpu, &view, frame).unwrap();
        }
        let drawable = streaming.drawable().count();
        assert!(drawable > 0);

        let mut material = TerrainMaterial::new(&mut gpu, TextureFormat::Rgba8UnormSrgb, cfg.grid_segments(0)).unwrap();
        let color = gpu
            .create_texture_2d(&TextureDesc {
                label: "color",
                width: 8,
                height: 8,
                layers: 1,
                format: TextureFormat::Rgba8UnormSrgb,
                usage: TextureUsage::TARGET,
            })
            .unwrap();
        let atmo = AtmosphereParams::earth_like(50_000.0).uniform(Vec3::ZERO, false, [256, 64]);
        let inputs = TerrainFrameInputs {
            view_proj: Mat4::IDENTITY,
            camera_position: Vec3::new(64.0, 100.0, 64.0),
            time: 0.0,
            enable_splat: true,
            enable_macro: true,
            splat_neighbors: 4,
        };
        gpu.begin_pass(&PassDesc {
            label: "terrain",
            color,
            depth: None,
            clear_color: Some([0.0; 4]),
            clear_depth: None,
        })
        .unwrap();
        let stats = material.draw(&mut gpu, &inputs, &atmo, &env(), &streaming).unwrap();
        gpu.end_pass().unwrap();
        assert_eq!(stats.drawn, drawable);
        assert_eq!(material.bound_chunks(), drawable);
        let pass = gpu.passes().last().unwrap();
        assert_eq!(pass.draws.len(), drawable);
        assert!(pass.draws.iter().all(|d| d.pipeline == "terrain" && d.count > 0));

        streaming.shutdown(&mut gpu);
        gpu.begin_pass(&PassDesc {
            label: "terrain",
            color,
            depth: None,
            clear_color: None,
            clear_depth: None,
        })
        .unwrap();
        let empty = material.draw(&mut gpu, &inputs, &atmo, &env(), &streaming).unwrap();
        gpu.end_pass().unwrap();
        assert_eq!(empty.drawn, 0);
        assert_eq!(material.bound_chunks(), 0);
    }
}
