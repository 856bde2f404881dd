//! Streamed ground features: per-chunk instanced grass and flowers whose
//! placement is computed in the vertex shader from the chunk's height and
//! tile atlases.
//!
//! Each feature type owns one small cone mesh. Every streamed chunk within a
//! type's stream radius gets a [`FeatureInstanceId`] holding its uniform
//! block and bind group; the draw is a single instanced call with one
//! instance per grid cell. Cells that fail a cull emit a degenerate position
//! instead of being compacted, so no readback or compute pass is involved.
//!
//! [`place_instance`] mirrors the vertex shader on the CPU for the flat
//! world; tests use it to check culling and determinism.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use nebula_config::FeatureTypeConfig;
use nebula_lod::{AtlasKind, TextureRef};
use nebula_render::{
    BindGroupHandle, BindingResource, BindingType, BlendMode, BufferHandle, BufferUsage,
    DepthState, DrawCall, GpuBackend, PipelineHandle, RenderPipelineDesc, SlotArena,
    TextureFormat, VertexAttribute, VertexFormat, VertexLayout, VertexStep,
};
use nebula_terrain::WATER_LEVEL;
use nebula_terrain::hash::hash13;
use nebula_terrain::noise::smoothstep;
use tracing::{debug, info};

use crate::environment::EnvironmentUniform;
use crate::error::StreamingError;
use crate::streaming::{ActiveChunk, ChunkCoord, ChunkId, StreamingDomain, StreamingEvent, StreamingManager};

pub const FEATURES_WGSL: &str = include_str!("features.wgsl");

/// Render distance scale per displayed LOD; LODs past the table use the last entry.
pub const LOD_DISTANCE_MULTIPLIERS: [f32; 5] = [1.0, 0.8, 0.6, 0.4, 0.2];
/// Frames between chunk set refreshes.
pub const FEATURE_UPDATE_INTERVAL: u64 = 10;
pub const MAX_VALID_TILES: usize = 8;

const JITTER_FRACTION: f32 = 0.8;
const ALPHA_CUTOFF: f32 = 0.01;
const SWAY_FREQUENCY: f32 = 0.1;
const CONE_SIDES: u32 = 3;

/// GPU layout of `FeatureFrame` in `features.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FeatureFrameUniform {
    pub view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 3],
    pub time: f32,
    pub spherical: u32,
    pub planet_radius: f32,
    pub _pad: [u32; 2],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FeatureFrameUniform>(), 96);

/// GPU layout of `FeatureChunk` in `features.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FeatureChunkUniform {
    pub origin: [f32; 2],
    pub chunk_size: f32,
    pub grid_spacing: f32,
    pub noise_seed: f32,
    pub density: f32,
    pub max_distance: f32,
    pub cull_margin: f32,
    pub taper_start: f32,
    pub taper_end: f32,
    pub min_cull_distance: f32,
    pub wind_strength: f32,
    /// (offset 48)
    pub color: [f32; 3],
    pub height: f32,
    pub uv_offset: [f32; 2],
    pub uv_scale: f32,
    pub width: f32,
    pub instances_per_row: u32,
    pub lod: u32,
    pub valid_count: u32,
    pub face: i32,
    /// (offset 96) `array<vec4<u32>, 2>`
    pub valid_tiles: [u32; MAX_VALID_TILES],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FeatureChunkUniform>(), 128);

impl FeatureChunkUniform {
    /// Placement block for one chunk at `lod`. Atlas fields are filled at draw time.
    #[must_use]
    pub fn new(cfg: &FeatureTypeConfig, origin: Vec2, chunk_size: f32, lod: u8) -> Self {
        let mut valid_tiles = [0; MAX_VALID_TILES];
        let valid_count = cfg.valid_tiles.len().min(MAX_VALID_TILES);
        valid_tiles[..valid_count].copy_from_slice(&cfg.valid_tiles[..valid_count]);
        Self {
            origin: origin.to_array(),
            chunk_size,
            grid_spacing: cfg.grid_spacing,
            noise_seed: cfg.noise_seed,
            density: cfg.density,
            max_distance: max_render_distance(cfg, lod),
            cull_margin: cfg.cull_margin,
            taper_start: cfg.taper_start_distance,
            taper_end: cfg.taper_end_distance,
            min_cull_distance: cfg.min_cull_distance,
            wind_strength: cfg.wind_strength,
            color: cfg.color,
            height: cfg.height,
            uv_offset: [0.0; 2],
            uv_scale: 1.0,
            width: cfg.width,
            instances_per_row: instances_per_row(chunk_size, cfg.grid_spacing),
            lod: u32::from(lod),
            valid_count: valid_count as u32,
            face: -1,
            valid_tiles,
        }
    }

    fn accepts(&self, tile: u32) -> bool {
        self.valid_tiles[..self.valid_count as usize].contains(&tile)
    }
}

/// Index of a per-chunk feature instance in the instancer's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureInstanceId(u32);

impl FeatureInstanceId {
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// `⌊(chunk / spacing)²⌋`.
#[must_use]
pub fn instance_count(chunk_size: f32, grid_spacing: f32) -> u32 {
    let per_axis = chunk_size / grid_spacing;
    (per_axis * per_axis).floor() as u32
}

/// `⌈chunk / spacing⌉`.
#[must_use]
pub fn instances_per_row(chunk_size: f32, grid_spacing: f32) -> u32 {
    (chunk_size / grid_spacing).ceil().max(1.0) as u32
}

#[must_use]
pub fn max_render_distance(cfg: &FeatureTypeConfig, lod: u8) -> f32 {
    let last = LOD_DISTANCE_MULTIPLIERS.len() - 1;
    cfg.max_render_distance * LOD_DISTANCE_MULTIPLIERS[usize::from(lod).min(last)]
}

/// Density multiplier, halving towards the render distance.
#[must_use]
pub fn density_falloff(distance: f32, max_distance: f32) -> f32 {
    1.0 - 0.5 * smoothstep(0.0, max_distance, distance)
}

/// Sideways sway of a vertex at `sway_weight` (0 at the base, 1 at the tip).
#[must_use]
pub fn wind_sway(time: f32, surface: Vec2, wind_strength: f32, sway_weight: f32) -> f32 {
    (time + (surface.x + surface.y) * SWAY_FREQUENCY).sin() * wind_strength * sway_weight
}

/// Clip-space sphere test used by the vertex shader.
#[must_use]
pub fn clip_visible(view_proj: &Mat4, center: Vec3, radius: f32) -> bool {
    let c = *view_proj * center.extend(1.0);
    let w = c.w + radius;
    c.w > -radius && c.x.abs() <= w && c.y.abs() <= w
}

/// A grid cell that survived every cull.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlacedFeature {
    pub cell: (u32, u32),
    /// Root of the instance on the terrain.
    pub base: Vec3,
    pub distance: f32,
    /// Distance taper in `(0.01, 1]`.
    pub alpha: f32,
}

/// Flat-world placement of instance `cell_index`; `None` where the vertex
/// shader would emit a degenerate position.
pub fn place_instance(
    chunk: &FeatureChunkUniform,
    cell_index: u32,
    camera: Vec3,
    view_proj: &Mat4,
    height_at: impl Fn(Vec2) -> f32,
    tile_at: impl Fn(Vec2) -> u32,
) -> Option<PlacedFeature> {
    let per_row = chunk.instances_per_row.max(1);
    let (ix, iz) = (cell_index % per_row, cell_index / per_row);
    let (gx, gz) = (ix as f32, iz as f32);
    let seed = chunk.noise_seed;
    let jitter = Vec2::new(hash13(gx, gz, seed), hash13(gx, gz, seed + 0.1))
        * chunk.grid_spacing
        * JITTER_FRACTION;
    let surface = Vec2::from(chunk.origin) + Vec2::new(gx, gz) * chunk.grid_spacing + jitter;

    let distance = (surface - Vec2::new(camera.x, camera.z)).length();
    let reach = chunk.max_distance + hash13(gx, gz, seed + 0.2) * chunk.cull_margin;
    if distance > reach || distance < chunk.min_cull_distance {
        return None;
    }
    let alpha = 1.0 - smoothstep(chunk.taper_start, chunk.taper_end, distance);
    if alpha <= ALPHA_CUTOFF {
        return None;
    }
    if hash13(gx, gz, seed + 0.3) > chunk.density * density_falloff(distance, chunk.max_distance) {
        return None;
    }
    let h = height_at(surface);
    if !chunk.accepts(tile_at(surface)) || h < WATER_LEVEL {
        return None;
    }
    let base = Vec3::new(surface.x, h, surface.y);
    let probe = base + Vec3::Y * chunk.height * 0.5;
    if !clip_visible(view_proj, probe, chunk.height.max(chunk.width)) {
        return None;
    }
    Some(PlacedFeature {
        cell: (ix, iz),
        base,
        distance,
        alpha,
    })
}

/// Triangle list of a unit cone: base radius 1 at `y = 0`, apex at `y = 1`.
#[must_use]
pub fn cone_mesh(sides: u32) -> Vec<[f32; 3]> {
    let sides = sides.max(3);
    let ring = |i: u32| {
        let a = i as f32 / sides as f32 * std::f32::consts::TAU;
        [a.cos(), 0.0, a.sin()]
    };
    (0..sides)
        .flat_map(|i| [ring(i), [0.0, 1.0, 0.0], ring(i + 1)])
        .collect()
}

const FEATURE_VERTEX_ATTRIBUTES: [VertexAttribute; 1] = [VertexAttribute {
    format: VertexFormat::Float32x3,
    offset: 0,
    location: 0,
}];

pub const FEATURE_VERTEX_LAYOUT: VertexLayout<'static> = VertexLayout {
    stride: 12,
    step: VertexStep::Vertex,
    attributes: &FEATURE_VERTEX_ATTRIBUTES,
};

/// Per-frame inputs of the feature pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureFrameInputs {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    pub time: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureDrawStats {
    pub draws: usize,
    /// Instances submitted, before GPU culling.
    pub instances: u64,
    /// Feature chunks whose terrain chunk had no drawable atlases.
    pub skipped: usize,
}

struct FeatureType {
    config: FeatureTypeConfig,
    vertices: BufferHandle,
    vertex_count: u32,
}

/// Per-chunk, per-type state.
struct FeatureInstance {
    type_index: usize,
    chunk: ChunkId,
    coord: ChunkCoord,
    uniform: FeatureChunkUniform,
    instance_count: u32,
    lod: u8,
    buffer: BufferHandle,
    bind_group: Option<BindGroupHandle>,
    textures: [Option<TextureRef>; 2],
}

/// Read-only view of one feature instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureInstanceInfo {
    pub id: FeatureInstanceId,
    pub type_index: usize,
    pub coord: ChunkCoord,
    pub instance_count: u32,
    pub lod: u8,
    pub max_distance: f32,
}

pub struct FeatureInstancer {
    pipeline: PipelineHandle,
    frame_buffer: BufferHandle,
    environment_buffer: BufferHandle,
    frame_group: BindGroupHandle,
    types: Vec<FeatureType>,
    instances: SlotArena<FeatureInstance>,
    index: HashMap<(usize, ChunkId), FeatureInstanceId>,
    chunks_per_update: usize,
}

impl FeatureInstancer {
    /// Build the shared pipeline and one cone mesh per feature type.
    pub fn new(
        gpu: &mut dyn GpuBackend,
        color_format: TextureFormat,
        types: &[FeatureTypeConfig],
        chunks_per_update: u32,
    ) -> Result<Self, StreamingError> {
        let shader = nebula_render::compose_wgsl(&[
            nebula_terrain::TERRAIN_COMMON_WGSL,
            crate::environment::ENVIRONMENT_WGSL,
            FEATURES_WGSL,
        ]);
        let raw = BindingType::Texture {
            filterable: false,
            array: false,
        };
        let frame_layout = [BindingType::UniformBuffer, BindingType::UniformBuffer];
        let chunk_layout = [BindingType::UniformBuffer, raw, raw];
        let pipeline = gpu.create_render_pipeline(&RenderPipelineDesc {
            label: "features",
            shader: &shader,
            vs_entry: "vs_feature",
            fs_entry: "fs_feature",
            vertex_layouts: &[FEATURE_VERTEX_LAYOUT],
            bind_group_layouts: &[&frame_layout, &chunk_layout],
            color_format,
            depth: Some(DepthState::REVERSE_Z_READ_ONLY),
            blend: BlendMode::PremultipliedAlpha,
            cull_back_faces: false,
        })?;
        let frame_buffer = gpu.create_buffer(
            "feature_frame",
            std::mem::size_of::<FeatureFrameUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let environment_buffer = gpu.create_buffer(
            "feature_environment",
            std::mem::size_of::<EnvironmentUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let frame_group = gpu.create_bind_group(
            pipeline,
            0,
            &[
                BindingResource::Buffer(frame_buffer),
                BindingResource::Buffer(environment_buffer),
            ],
        )?;

        let cone = cone_mesh(CONE_SIDES);
        let bytes: &[u8] = bytemuck::cast_slice(&cone);
        let mut registered = Vec::with_capacity(types.len());
        for config in types {
            let vertices = gpu.create_buffer("feature_mesh", bytes.len() as u64, BufferUsage::VERTEX)?;
            gpu.write_buffer(vertices, 0, bytes)?;
            registered.push(FeatureType {
                config: config.clone(),
                vertices,
                vertex_count: cone.len() as u32,
            });
        }
        info!(
            "Feature instancer ready: {} types ({})",
            registered.len(),
            types.iter().map(|t| t.type_name.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            pipeline,
            frame_buffer,
            environment_buffer,
            frame_group,
            types: registered,
            instances: SlotArena::new(),
            index: HashMap::new(),
            chunks_per_update: chunks_per_update.max(1) as usize,
        })
    }

    /// Live feature instances across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = FeatureInstanceInfo> + '_ {
        self.instances.iter().map(|(i, f)| FeatureInstanceInfo {
            id: FeatureInstanceId(i),
            type_index: f.type_index,
            coord: f.coord,
            instance_count: f.instance_count,
            lod: f.lod,
            max_distance: f.uniform.max_distance,
        })
    }

    #[must_use]
    pub fn type_name(&self, type_index: usize) -> Option<&str> {
        self.types.get(type_index).map(|t| t.config.type_name.as_str())
    }

    /// React to streaming changes: released chunks drop their features, LOD
    /// changes rescale the render distance.
    pub fn handle_events(&mut self, gpu: &mut dyn GpuBackend, events: &[StreamingEvent]) {
        for event in events {
            match event {
                StreamingEvent::ChunkReleased { id, .. } => self.remove_chunk(gpu, *id),
                StreamingEvent::LodChanged { id, lod, .. } => {
                    for type_index in 0..self.types.len() {
                        let Some(fid) = self.index.get(&(type_index, *id)).copied() else {
                            continue;
                        };
                        let cfg = &self.types[type_index].config;
                        if let Some(f) = self.instances.get_mut(fid.0) {
                            f.lod = *lod;
                            f.uniform.lod = u32::from(*lod);
                            f.uniform.max_distance = max_render_distance(cfg, *lod);
                        }
                    }
                }
                StreamingEvent::ChunkActivated { .. } | StreamingEvent::GenerationFailed { .. } => {}
            }
        }
    }

    /// Every [`FEATURE_UPDATE_INTERVAL`] frames: drop features of chunks that
    /// left a type's stream radius and add at most `chunks_per_update` new
    /// ones, nearest first.
    pub fn update(
        &mut self,
        gpu: &mut dyn GpuBackend,
        streaming: &StreamingManager,
        frame: u64,
    ) -> Result<(), StreamingError> {
        if frame % FEATURE_UPDATE_INTERVAL != 0 {
            return Ok(());
        }
        let stale: Vec<u32> = self
            .instances
            .iter()
            .filter(|(_, f)| {
                let radius = f64::from(self.types[f.type_index].config.stream_radius);
                streaming
                    .chunk(f.chunk)
                    .is_none_or(|c| c.coord != f.coord || c.distance > radius)
            })
            .map(|(i, _)| i)
            .collect();
        for index in stale {
            self.remove_instance(gpu, index);
        }

        let mut candidates: Vec<(f64, usize, ChunkId)> = Vec::new();
        for (type_index, t) in self.types.iter().enumerate() {
            let radius = f64::from(t.config.stream_radius);
            for (id, chunk) in streaming.drawable() {
                if chunk.distance <= radius && !self.index.contains_key(&(type_index, id)) {
                    candidates.push((chunk.distance, type_index, id));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        let added = candidates.len().min(self.chunks_per_update);
        for &(_, type_index, id) in candidates.iter().take(added) {
            if let Some(chunk) = streaming.chunk(id) {
                self.add_instance(gpu, streaming, type_index, id, chunk)?;
            }
        }
        if added > 0 {
            debug!(
                "Feature update at frame {frame}: {added} added, {} pending, {} live",
                candidates.len() - added,
                self.instances.len()
            );
        }
        Ok(())
    }

    fn add_instance(
        &mut self,
        gpu: &mut dyn GpuBackend,
        streaming: &StreamingManager,
        type_index: usize,
        id: ChunkId,
        chunk: &ActiveChunk,
    ) -> Result<(), StreamingError> {
        let cfg = streaming.config();
        let (ox, oy) = cfg.chunk_origin(chunk.coord.x, chunk.coord.y);
        let chunk_size = cfg.base_chunk_size() as f32;
        let lod = chunk.display_lod.unwrap_or(chunk.target_lod);
        let config = &self.types[type_index].config;
        let mut uniform =
            FeatureChunkUniform::new(config, Vec2::new(ox as f32, oy as f32), chunk_size, lod);
        uniform.face = chunk.coord.face.map_or(-1, |f| f.index());
        let buffer = gpu.create_buffer(
            "feature_chunk",
            std::mem::size_of::<FeatureChunkUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        let index = self.instances.insert(FeatureInstance {
            type_index,
            chunk: id,
            coord: chunk.coord,
            uniform,
            instance_count: instance_count(chunk_size, config.grid_spacing),
            lod,
            buffer,
            bind_group: None,
            textures: [None; 2],
        });
        self.index.insert((type_index, id), FeatureInstanceId(index));
        Ok(())
    }

    fn remove_chunk(&mut self, gpu: &mut dyn GpuBackend, id: ChunkId) {
        for type_index in 0..self.types.len() {
            if let Some(fid) = self.index.get(&(type_index, id)).copied() {
                self.remove_instance(gpu, fid.0);
            }
        }
    }

    fn remove_instance(&mut self, gpu: &mut dyn GpuBackend, index: u32) {
        if let Some(f) = self.instances.remove(index) {
            self.index.remove(&(f.type_index, f.chunk));
            if let Some(bg) = f.bind_group {
                gpu.destroy_bind_group(bg);
            }
            gpu.destroy_buffer(f.buffer);
        }
    }

    /// Upload the frame uniforms and issue one instanced draw per feature
    /// chunk into the open pass.
    pub fn draw(
        &mut self,
        gpu: &mut dyn GpuBackend,
        inputs: &FeatureFrameInputs,
        environment: &EnvironmentUniform,
        streaming: &StreamingManager,
    ) -> Result<FeatureDrawStats, StreamingError> {
        let (spherical, planet_radius) = match streaming.domain() {
            StreamingDomain::Planar => (0, 0.0),
            StreamingDomain::Spherical(s) => (1, s.radius_m as f32),
        };
        let frame = FeatureFrameUniform {
            view_proj: inputs.view_proj.to_cols_array_2d(),
            camera_position: inputs.camera_position.to_array(),
            time: inputs.time,
            spherical,
            planet_radius,
            _pad: [0; 2],
        };
        gpu.write_buffer(self.frame_buffer, 0, bytemuck::bytes_of(&frame))?;
        gpu.write_buffer(self.environment_buffer, 0, bytemuck::bytes_of(environment))?;

        let mut stats = FeatureDrawStats::default();
        let pipeline = self.pipeline;
        let frame_group = self.frame_group;
        for (_, f) in self.instances.iter_mut() {
            let Some(chunk) = streaming.chunk(f.chunk).filter(|c| c.textures.is_drawable()) else {
                stats.skipped += 1;
                continue;
            };
            let (Some(height), Some(tile)) = (
                chunk.textures.get(AtlasKind::Height),
                chunk.textures.get(AtlasKind::Tile),
            ) else {
                stats.skipped += 1;
                continue;
            };
            let textures = [Some(height.texture), Some(tile.texture)];
            let bind_group = match f.bind_group {
                Some(bg) if f.textures == textures => bg,
                stale => {
                    if let Some(bg) = stale {
                        gpu.destroy_bind_group(bg);
                    }
                    let bg = gpu.create_bind_group(
                        pipeline,
                        1,
                        &[
                            BindingResource::Buffer(f.buffer),
                            BindingResource::Texture {
                                texture: height.texture.texture,
                                layer: height.texture.layer,
                            },
                            BindingResource::Texture {
                                texture: tile.texture.texture,
                                layer: tile.texture.layer,
                            },
                        ],
                    )?;
                    f.bind_group = Some(bg);
                    f.textures = textures;
                    bg
                }
            };
            f.uniform.uv_offset = height.uv_transform.offset;
            f.uniform.uv_scale = height.uv_transform.scale;
            gpu.write_buffer(f.buffer, 0, bytemuck::bytes_of(&f.uniform))?;

            let t = &self.types[f.type_index];
            gpu.draw(&DrawCall {
                pipeline,
                bind_groups: &[frame_group, bind_group],
                vertex_buffers: &[t.vertices],
                index_buffer: None,
                count: t.vertex_count,
                instance_count: f.instance_count,
            })?;
            stats.draws += 1;
            stats.instances += u64::from(f.instance_count);
        }
        Ok(stats)
    }

    /// Free every GPU resource.
    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend) {
        let live: Vec<u32> = self.instances.iter().map(|(i, _)| i).collect();
        for index in live {
            self.remove_instance(gpu, index);
        }
        for t in self.types.drain(..) {
            gpu.destroy_buffer(t.vertices);
        }
        gpu.destroy_bind_group(self.frame_group);
        gpu.destroy_buffer(self.frame_buffer);
        gpu.destroy_buffer(self.environment_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use nebula_config::{StreamingConfig, TerrainConfig};
    use nebula_lod::LodAtlasConfig;
    use nebula_render::{ApiName, BackendCapabilities, PassDesc, SoftwareBackend, TextureDesc, TextureUsage};
    use nebula_terrain::{AtlasGenerator, GeneratorOptions, TerrainParams};

    use crate::streaming::CameraView;

    fn grass(spacing: f32) -> FeatureTypeConfig {
        FeatureTypeConfig {
            grid_spacing: spacing,
            ..FeatureTypeConfig::grass()
        }
    }

    fn wide_view() -> Mat4 {
        Mat4::orthographic_rh(-500.0, 500.0, -500.0, 500.0, -500.0, 500.0)
    }

    fn place_all(chunk: &FeatureChunkUniform, count: u32, height: f32) -> Vec<PlacedFeature> {
        let view = wide_view();
        (0..count)
            .filter_map(|i| place_instance(chunk, i, Vec3::new(0.0, 100.0, 0.0), &view, |_| height, |_| 102))
            .collect()
    }

    /// The composed feature shader parses and validates.
    #[test]
    fn test_feature_shader_validates() {
        let source = nebula_render::compose_wgsl(&[
            nebula_terrain::TERRAIN_COMMON_WGSL,
            crate::environment::ENVIRONMENT_WGSL,
            FEATURES_WGSL,
        ]);
        let module = naga::front::wgsl::parse_str(&source)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(&source)));
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .unwrap_or_else(|e| panic!("{e:?}"));
    }

    /// Instance counts follow `⌊(chunk / spacing)²⌋` with `⌈chunk / spacing⌉` per row.
    #[test]
    fn test_instance_grid() {
        assert_eq!(instance_count(128.0, 0.35), 133_746);
        assert_eq!(instances_per_row(128.0, 0.35), 366);
        assert_eq!(instance_count(128.0, 0.5), 65_536);
        assert_eq!(instances_per_row(128.0, 0.5), 256);
    }

    /// Render distance shrinks per LOD and clamps past the table.
    #[test]
    fn test_lod_distance_multipliers() {
        let cfg = FeatureTypeConfig::grass();
        assert_eq!(max_render_distance(&cfg, 0), 70.0);
        assert!((max_render_distance(&cfg, 2) - 42.0).abs() < 1e-5);
        assert!((max_render_distance(&cfg, 4) - 14.0).abs() < 1e-5);
        assert_eq!(max_render_distance(&cfg, 9), max_render_distance(&cfg, 4));
    }

    /// Nothing beyond render distance plus margin survives, and some cells in
    /// the margin do.
    #[test]
    fn test_distance_cull_with_margin() {
        let cfg = FeatureTypeConfig {
            taper_start_distance: 200.0,
            taper_end_distance: 300.0,
            ..grass(0.35)
        };
        let chunk = FeatureChunkUniform::new(&cfg, Vec2::ZERO, 128.0, 0);
        let placed = place_all(&chunk, instance_count(128.0, 0.35), 20.0);
        assert!(!placed.is_empty());
        let farthest = placed.iter().map(|p| p.distance).fold(0.0f32, f32::max);
        assert!(farthest <= 73.0, "farthest {farthest}");
        assert!(farthest > 70.0, "margin unused: {farthest}");
    }

    /// Grass at 0.35 m spacing with a 70 m render distance: nothing past 73 m,
    /// nothing under water, taper alpha in range.
    #[test]
    fn test_grass_culling_scenario() {
        let chunk = FeatureChunkUniform::new(&grass(0.35), Vec2::ZERO, 128.0, 0);
        let count = instance_count(128.0, 0.35);
        let placed = place_all(&chunk, count, 20.0);
        assert!(!placed.is_empty());
        for p in &placed {
            assert!(p.distance <= 73.0, "cell {:?} at {}", p.cell, p.distance);
            assert!(p.alpha > ALPHA_CUTOFF && p.alpha <= 1.0);
            assert_eq!(p.base.y, 20.0);
        }
        assert!(place_all(&chunk, count, WATER_LEVEL - 3.0).is_empty(), "below water level");
    }

    /// Only tiles the type lists receive instances.
    #[test]
    fn test_valid_tiles_filter() {
        let chunk = FeatureChunkUniform::new(&grass(1.0), Vec2::ZERO, 128.0, 0);
        let view = wide_view();
        let camera = Vec3::new(10.0, 50.0, 10.0);
        let on_grass = (0..instance_count(128.0, 1.0))
            .filter(|&i| place_instance(&chunk, i, camera, &view, |_| 20.0, |_| 102).is_some())
            .count();
        let on_rock = (0..instance_count(128.0, 1.0))
            .filter(|&i| place_instance(&chunk, i, camera, &view, |_| 20.0, |_| 5).is_some())
            .count();
        assert!(on_grass > 0);
        assert_eq!(on_rock, 0);
    }

    /// Instances behind the camera fail the clip test.
    #[test]
    fn test_frustum_cull() {
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0);
        let view = Mat4::look_to_rh(Vec3::new(0.0, 30.0, 0.0), Vec3::X, Vec3::Y);
        let vp = proj * view;
        assert!(clip_visible(&vp, Vec3::new(20.0, 25.0, 0.0), 0.5));
        assert!(!clip_visible(&vp, Vec3::new(-20.0, 25.0, 0.0), 0.5));
    }

    /// Placements are identical between runs for the same seed and camera,
    /// and change with the noise seed.
    #[test]
    fn test_placement_determinism() {
        let chunk = FeatureChunkUniform::new(&grass(0.5), Vec2::new(-64.0, -64.0), 128.0, 0);
        let count = instance_count(128.0, 0.5);
        let a = place_all(&chunk, count, 20.0);
        let b = place_all(&chunk, count, 20.0);
        assert_eq!(a, b);
        let reseeded = FeatureChunkUniform {
            noise_seed: 0.91,
            ..chunk
        };
        assert_ne!(a, place_all(&reseeded, count, 20.0));
    }

    /// Jitter keeps every instance inside its chunk.
    #[test]
    fn test_jitter_within_chunk() {
        let chunk = FeatureChunkUniform {
            max_distance: 1.0e6,
            taper_start: 1.0e6,
            taper_end: 2.0e6,
            density: 2.0,
            ..FeatureChunkUniform::new(&grass(2.0), Vec2::ZERO, 128.0, 0)
        };
        let placed = place_all(&chunk, instance_count(128.0, 2.0), 20.0);
        assert_eq!(placed.len() as u32, instance_count(128.0, 2.0));
        for p in placed {
            assert!(p.base.x >= 0.0 && p.base.x < 128.0 && p.base.z >= 0.0 && p.base.z < 128.0);
        }
    }

    /// Sway is zero at the root and bounded by the wind strength.
    #[test]
    fn test_wind_sway() {
        assert_eq!(wind_sway(3.0, Vec2::new(5.0, 7.0), 0.25, 0.0), 0.0);
        for t in 0..50 {
            let s = wind_sway(t as f32 * 0.3, Vec2::new(12.0, -4.0), 0.25, 1.0);
            assert!(s.abs() <= 0.25 + 1e-6);
        }
    }

    /// The cone has three faces meeting at the apex.
    #[test]
    fn test_cone_mesh() {
        let cone = cone_mesh(3);
        assert_eq!(cone.len(), 9);
        assert_eq!(cone.iter().filter(|v| v[1] == 1.0).count(), 3);
        assert_eq!(std::mem::size_of_val(cone.as_slice()), 9 * FEATURE_VERTEX_LAYOUT.stride as usize);
    }

    /// Uniform fields land where the shader reads them.
    #[test]
    fn test_chunk_uniform_layout() {
        let u = FeatureChunkUniform::new(&FeatureTypeConfig::flowers(), Vec2::new(128.0, 256.0), 128.0, 1);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&u));
        assert_eq!(f32::from_bits(words[6]), 40.0, "max_distance at 24");
        assert_eq!(words[20], 64, "instances_per_row at 80");
        assert_eq!(words[21], 1, "lod at 84");
        assert_eq!(words[22], 1, "valid_count at 88");
        assert_eq!(words[24], 102, "valid_tiles at 96");
    }

    fn streamed(gpu: &mut SoftwareBackend) -> (StreamingManager, CameraView) {
        let settings = StreamingConfig {
            base_texture_size: 64,
            stream_radius: 200.0,
            ..StreamingConfig::default()
        };
        let cfg = LodAtlasConfig::from_streaming(&settings).unwrap();
        let generator = AtlasGenerator::new(
            gpu,
            cfg,
            TerrainParams::planar(settings.seed, &TerrainConfig::default()),
            GeneratorOptions::from_streaming(&settings),
        )
        .unwrap();
        let mut streaming = StreamingManager::new(&settings, generator, StreamingDomain::Planar);
        let view = CameraView::new(DVec3::new(64.0, 10.0, 64.0), DVec3::X);
        streaming.refresh_residency(&view, 0);
        for frame in 0..40 {
            gpu.poll();
            streaming.update(gpu, &view, frame).unwrap();
        }
        (streaming, view)
    }

    /// Updates are throttled, bounded per refresh, and every feature chunk
    /// draws one instanced call.
    #[test]
    fn test_instancer_streams_and_draws() {
        let mut gpu = SoftwareBackend::with_capabilities(ApiName::Native, BackendCapabilities::FULL);
        let (streaming, _) = streamed(&mut gpu);
        let types = [
            FeatureTypeConfig {
                stream_radius: 1000.0,
                ..FeatureTypeConfig::grass()
            },
            FeatureTypeConfig {
                stream_radius: 1000.0,
                ..FeatureTypeConfig::flowers()
            },
        ];
        let mut features = FeatureInstancer::new(&mut gpu, TextureFormat::Rgba8UnormSrgb, &types, 2).unwrap();
        let drawable = streaming.drawable().count();
        assert!(drawable > 0);

        features.update(&mut gpu, &streaming, 3).unwrap();
        assert!(features.is_empty(), "off-cadence frame does nothing");
        features.update(&mut gpu, &streaming, 10).unwrap();
        assert_eq!(features.len(), 2.min(drawable * 2));
        for frame in (20..=400).step_by(10) {
            features.update(&mut gpu, &streaming, frame).unwrap();
        }
        assert_eq!(features.len(), drawable * 2);

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
        gpu.begin_pass(&PassDesc {
            label: "features",
            color,
            depth: None,
            clear_color: None,
            clear_depth: None,
        })
        .unwrap();
        let inputs = FeatureFrameInputs {
            view_proj: wide_view(),
            camera_position: Vec3::new(64.0, 10.0, 64.0),
            time: 1.5,
        };
        let env = EnvironmentUniform::zeroed();
        let stats = features.draw(&mut gpu, &inputs, &env, &streaming).unwrap();
        gpu.end_pass().unwrap();
        assert_eq!(stats.draws, drawable * 2);
        let pass = gpu.passes().last().unwrap();
        let grass_count = instance_count(128.0, 0.5);
        assert!(pass.draws.iter().any(|d| d.instance_count == grass_count && d.count == 9));
    }

    /// Released chunks drop their features; LOD changes rescale the render distance.
    #[test]
    fn test_instancer_events() {
        let mut gpu = SoftwareBackend::with_capabilities(ApiName::Native, BackendCapabilities::FULL);
        let (streaming, _) = streamed(&mut gpu);
        let types = [FeatureTypeConfig {
            stream_radius: 1000.0,
            ..FeatureTypeConfig::grass()
        }];
        let mut features = FeatureInstancer::new(&mut gpu, TextureFormat::Rgba8UnormSrgb, &types, 64).unwrap();
        features.update(&mut gpu, &streaming, 0).unwrap();
        let before = features.len();
        assert!(before > 0);

        let (id, chunk) = streaming.drawable().next().unwrap();
        features.handle_events(
            &mut gpu,
            &[StreamingEvent::LodChanged {
                id,
                coord: chunk.coord,
                previous: Some(0),
                lod: 2,
            }],
        );
        let info = features.instances().find(|f| f.coord == chunk.coord).unwrap();
        assert_eq!(info.lod, 2);
        assert!((info.max_distance - 42.0).abs() < 1e-5);
        assert_eq!(features.type_name(info.type_index), Some("grass"));

        features.handle_events(&mut gpu, &[StreamingEvent::ChunkReleased { id, coord: chunk.coord }]);
        assert_eq!(features.len(), before - 1);
        assert!(features.instances().all(|f| f.coord != chunk.coord));
    }
}
