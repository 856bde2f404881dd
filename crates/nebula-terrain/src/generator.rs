//! Atlas generation: fills all five atlas kinds for one slot.
//!
//! On a backend with compute and storage textures the generator records
//! four terrain dispatches (height, normal, tile, macro) followed by the
//! splat dispatch that reads height and tile back. Without compute it runs
//! the CPU reference and uploads the images. Either way the textures are
//! handed to the [`TextureCache`] only after the submission completes, so a
//! failed build leaves the slot untouched.

use std::collections::HashMap;

use nebula_config::StreamingConfig;
use nebula_lod::{AtlasKey, AtlasKind, LodAtlasConfig, PoolKey, TextureCache, TextureRef};
use nebula_render::{
    BindGroupHandle, BindingResource, BindingType, BufferHandle, BufferUsage, ComputePipelineDesc,
    GpuBackend, PipelineError, PipelineHandle, SubmissionId, SubmissionStatus, TextureDesc,
    TextureFormat, TextureRegion, TextureUsage, compose_wgsl,
};
use tracing::{debug, info, warn};

use crate::cpu::build_atlas_images;
use crate::error::GenerationError;
use crate::sampler::{TerrainParams, TerrainSampler};
use crate::uniforms::{SplatUniform, TerrainUniform};
use crate::{SPLAT_WGSL, TERRAIN_ATLAS_WGSL, TERRAIN_COMMON_WGSL};

const WORKGROUP_SIZE: u32 = 8;

/// Tunables taken from [`StreamingConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Splat kernel side, odd.
    pub kernel_size: u32,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Layers per pooled 2D array; `None` allocates one texture per atlas.
    pub pool_capacity: Option<u32>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            kernel_size: 5,
            max_retries: 3,
            pool_capacity: None,
        }
    }
}

impl GeneratorOptions {
    #[must_use]
    pub fn from_streaming(cfg: &StreamingConfig) -> Self {
        Self {
            kernel_size: cfg.splat_kernel_size | 1,
            max_retries: cfg.max_generation_retries,
            pool_capacity: cfg
                .texture_array_pooling
                .then_some(cfg.array_pool_capacity.max(1)),
        }
    }
}

/// How atlas contents are produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationMode {
    Compute,
    Cpu,
}

/// Result of [`AtlasGenerator::request`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Submitted,
    AlreadyInFlight,
    /// The slot failed more than `max_retries` times and is left empty.
    Exhausted,
}

/// Something that happened to an in-flight build during [`AtlasGenerator::poll`].
#[derive(Debug)]
pub enum GenerationEvent {
    /// All five kinds are now resident in the cache.
    Completed { key: AtlasKey },
    /// The build failed and may be requested again.
    Retrying {
        key: AtlasKey,
        attempts: u32,
        reason: String,
    },
    /// The build failed for the last time.
    Failed { key: AtlasKey, error: PipelineError },
}

/// Counters for the streaming statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed_attempts: u64,
}

struct ComputePipelines {
    terrain_f32: PipelineHandle,
    terrain_f16: PipelineHandle,
    splat: PipelineHandle,
}

impl ComputePipelines {
    fn create(backend: &mut dyn GpuBackend) -> Result<Self, GenerationError> {
        let terrain = |format: TextureFormat, wgsl_format: &str| -> (String, [BindingType; 2]) {
            let pass_src = TERRAIN_ATLAS_WGSL.replace("ATLAS_FORMAT", wgsl_format);
            (
                compose_wgsl(&[TERRAIN_COMMON_WGSL, &pass_src]),
                [BindingType::UniformBuffer, BindingType::StorageTexture { format }],
            )
        };

        let (src_f32, layout_f32) = terrain(TextureFormat::Rgba32Float, "rgba32float");
        let terrain_f32 = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: "terrain_atlas_rgba32f",
            shader: &src_f32,
            entry_point: "cs_main",
            bind_group_layouts: &[&layout_f32],
        })?;

        let (src_f16, layout_f16) = terrain(TextureFormat::Rgba16Float, "rgba16float");
        let terrain_f16 = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: "terrain_atlas_rgba16f",
            shader: &src_f16,
            entry_point: "cs_main",
            bind_group_layouts: &[&layout_f16],
        })?;

        let splat_src = compose_wgsl(&[TERRAIN_COMMON_WGSL, SPLAT_WGSL]);
        let sampled = BindingType::Texture {
            filterable: false,
            array: false,
        };
        let splat = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: "terrain_splat",
            shader: &splat_src,
            entry_point: "cs_main",
            bind_group_layouts: &[&[
                BindingType::UniformBuffer,
                sampled,
                sampled,
                BindingType::StorageTexture {
                    format: AtlasKind::Splat.format(),
                },
            ]],
        })?;

        info!("Created terrain atlas compute pipelines on {:?}", backend.api_name());
        Ok(Self {
            terrain_f32,
            terrain_f16,
            splat,
        })
    }

    fn terrain_for(&self, format: TextureFormat) -> PipelineHandle {
        match format {
            TextureFormat::Rgba16Float => self.terrain_f16,
            _ => self.terrain_f32,
        }
    }
}

/// GPU resources of one build, released when it settles.
#[derive(Default)]
struct Allocation {
    textures: Vec<(AtlasKind, TextureRef)>,
    bind_groups: Vec<BindGroupHandle>,
    buffers: Vec<BufferHandle>,
}

impl Allocation {
    fn texture(&self, kind: AtlasKind) -> Option<TextureRef> {
        self.textures.iter().find(|(k, _)| *k == kind).map(|(_, t)| *t)
    }

    fn release_transient(&mut self, backend: &mut dyn GpuBackend) {
        for bg in self.bind_groups.drain(..) {
            backend.destroy_bind_group(bg);
        }
        for buf in self.buffers.drain(..) {
            backend.destroy_buffer(buf);
        }
    }

    fn release_all(&mut self, backend: &mut dyn GpuBackend, cache: &mut TextureCache) {
        self.release_transient(backend);
        for (_, tex) in self.textures.drain(..) {
            if tex.layer.is_some() {
                cache.return_layer(tex);
            } else {
                backend.destroy_texture(tex.texture);
            }
        }
    }
}

struct InFlight {
    submission: SubmissionId,
    allocation: Allocation,
}

/// Builds atlas slots and publishes them into the texture cache.
pub struct AtlasGenerator {
    cfg: LodAtlasConfig,
    sampler: TerrainSampler,
    options: GeneratorOptions,
    mode: GenerationMode,
    pipelines: Option<ComputePipelines>,
    in_flight: HashMap<AtlasKey, InFlight>,
    failures: HashMap<AtlasKey, u32>,
    stats: GeneratorStats,
}

impl AtlasGenerator {
    /// Create a generator, compiling the compute pipelines when the backend
    /// supports compute generation.
    pub fn new(
        backend: &mut dyn GpuBackend,
        cfg: LodAtlasConfig,
        params: TerrainParams,
        options: GeneratorOptions,
    ) -> Result<Self, GenerationError> {
        let (mode, pipelines) = if backend.capabilities().supports_compute_generation() {
            (GenerationMode::Compute, Some(ComputePipelines::create(backend)?))
        } else {
            info!(
                "Backend {:?} lacks compute generation, using CPU atlas synthesis",
                backend.api_name()
            );
            (GenerationMode::Cpu, None)
        };
        Ok(Self {
            cfg,
            sampler: TerrainSampler::new(params),
            options,
            mode,
            pipelines,
            in_flight: HashMap::new(),
            failures: HashMap::new(),
            stats: GeneratorStats::default(),
        })
    }

    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    #[must_use]
    pub fn config(&self) -> &LodAtlasConfig {
        &self.cfg
    }

    #[must_use]
    pub fn sampler(&self) -> &TerrainSampler {
        &self.sampler
    }

    #[must_use]
    pub fn options(&self) -> GeneratorOptions {
        self.options
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &AtlasKey) -> bool {
        self.in_flight.contains_key(key)
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Failed attempts recorded for `key` since its last success.
    #[must_use]
    pub fn failure_count(&self, key: &AtlasKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_exhausted(&self, key: &AtlasKey) -> bool {
        self.failure_count(key) > self.options.max_retries
    }

    /// Forget the failure history of `key` so it may be requested again.
    pub fn reset_failures(&mut self, key: &AtlasKey) {
        self.failures.remove(key);
    }

    #[must_use]
    pub fn stats(&self) -> GeneratorStats {
        self.stats
    }

    /// Start building every kind of `key`. At most one build per slot is
    /// in flight; the cache is untouched until [`AtlasGenerator::poll`]
    /// sees the submission complete.
    pub fn request(
        &mut self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
        key: AtlasKey,
    ) -> Result<RequestOutcome, GenerationError> {
        if self.in_flight.contains_key(&key) {
            return Ok(RequestOutcome::AlreadyInFlight);
        }
        if self.is_exhausted(&key) {
            return Ok(RequestOutcome::Exhausted);
        }

        let mut allocation = Allocation::default();
        let recorded = match self.mode {
            GenerationMode::Compute => self.record_compute(backend, cache, &key, &mut allocation),
            GenerationMode::Cpu => self.record_cpu(backend, cache, &key, &mut allocation),
        };
        if let Err(e) = recorded {
            allocation.release_all(backend, cache);
            return Err(e);
        }

        let submission = backend.submit();
        debug!("Submitted atlas {key} as {submission:?}");
        self.in_flight.insert(
            key,
            InFlight {
                submission,
                allocation,
            },
        );
        self.stats.submitted += 1;
        Ok(RequestOutcome::Submitted)
    }

    /// Settle finished builds: completed slots are stored in the cache,
    /// failed ones release their textures and count towards the retry limit.
    pub fn poll(
        &mut self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
    ) -> Vec<GenerationEvent> {
        let mut keys: Vec<AtlasKey> = self.in_flight.keys().copied().collect();
        keys.sort();

        let mut events = Vec::new();
        for key in keys {
            let Some(entry) = self.in_flight.get(&key) else {
                continue;
            };
            match backend.submission_status(entry.submission) {
                SubmissionStatus::Pending => {}
                SubmissionStatus::Complete => {
                    let Some(mut done) = self.in_flight.remove(&key) else {
                        continue;
                    };
                    done.allocation.release_transient(backend);
                    for (kind, tex) in done.allocation.textures.drain(..) {
                        let bytes = self.cfg.atlas_bytes(kind, key.lod);
                        if let Some(old) = cache.set_lod(key, kind, tex, bytes) {
                            backend.destroy_texture(old);
                        }
                    }
                    self.failures.remove(&key);
                    self.stats.completed += 1;
                    events.push(GenerationEvent::Completed { key });
                }
                SubmissionStatus::Failed(reason) => {
                    let Some(mut failed) = self.in_flight.remove(&key) else {
                        continue;
                    };
                    failed.allocation.release_all(backend, cache);
                    let attempts = self.failures.entry(key).or_insert(0);
                    *attempts += 1;
                    let attempts = *attempts;
                    self.stats.failed_attempts += 1;
                    if attempts > self.options.max_retries {
                        warn!("Atlas {key} failed after {attempts} attempts: {reason}");
                        events.push(GenerationEvent::Failed {
                            key,
                            error: PipelineError::GenerationFailed {
                                key: key.to_string(),
                                attempts,
                                reason,
                            },
                        });
                    } else {
                        warn!("Atlas {key} failed (attempt {attempts}), will retry: {reason}");
                        events.push(GenerationEvent::Retrying {
                            key,
                            attempts,
                            reason,
                        });
                    }
                }
            }
        }
        events
    }

    /// Release every in-flight build without publishing it.
    pub fn cancel_all(&mut self, backend: &mut dyn GpuBackend, cache: &mut TextureCache) {
        for (_, mut entry) in self.in_flight.drain() {
            entry.allocation.release_all(backend, cache);
        }
    }

    fn allocate(
        &self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
        key: &AtlasKey,
        kind: AtlasKind,
    ) -> Result<TextureRef, GenerationError> {
        let size = self.cfg.texture_extent(kind, key.lod);
        let format = kind.format();
        let usage = match self.mode {
            GenerationMode::Compute => TextureUsage::ATLAS,
            GenerationMode::Cpu => TextureUsage::UPLOAD,
        };

        if let Some(capacity) = self.options.pool_capacity
            && backend.capabilities().texture_arrays
        {
            let pool = PoolKey {
                kind,
                lod: key.lod,
                size,
            };
            if !cache.has_pool(&pool) {
                let label = format!("atlas_pool_{}_lod{}", kind.name(), key.lod);
                let texture = backend.create_texture_2d(&TextureDesc {
                    label: &label,
                    width: size,
                    height: size,
                    layers: capacity,
                    format,
                    usage,
                })?;
                debug!("Created {capacity}-layer pool {label}");
                cache.add_pool(pool, texture, capacity);
            }
            if let Some(layer) = cache.acquire_layer(&pool) {
                return Ok(layer);
            }
            debug!("Pool for {} lod {} is full, allocating standalone", kind.name(), key.lod);
        }

        let label = format!("atlas_{}_{key}", kind.name());
        let texture = backend.create_texture_2d(&TextureDesc {
            label: &label,
            width: size,
            height: size,
            layers: 1,
            format,
            usage,
        })?;
        Ok(TextureRef::standalone(texture))
    }

    fn allocate_all(
        &self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
        key: &AtlasKey,
        allocation: &mut Allocation,
    ) -> Result<(), GenerationError> {
        for kind in AtlasKind::ALL {
            let tex = self.allocate(backend, cache, key, kind)?;
            allocation.textures.push((kind, tex));
        }
        Ok(())
    }

    fn record_compute(
        &self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
        key: &AtlasKey,
        allocation: &mut Allocation,
    ) -> Result<(), GenerationError> {
        let pipelines = self
            .pipelines
            .as_ref()
            .ok_or(PipelineError::BackendUnsupported { missing: "compute" })?;
        self.allocate_all(backend, cache, key, allocation)?;

        let params = self.sampler.params();

        for kind in AtlasKind::ALL {
            let Some(output_kind) = kind.output_kind() else {
                continue;
            };
            let tex = allocation
                .texture(kind)
                .ok_or(GenerationError::Pipeline(PipelineError::MissingTexture {
                    key: key.to_string(),
                    kind: kind.to_string(),
                }))?;
            let side = self.cfg.texture_extent(kind, key.lod);
            let groups = [side.div_ceil(WORKGROUP_SIZE), side.div_ceil(WORKGROUP_SIZE), 1];
            let uniform = TerrainUniform::new(params, &self.cfg, key, output_kind);
            let buffer = backend.create_buffer(
                "terrain_uniforms",
                std::mem::size_of::<TerrainUniform>() as u64,
                BufferUsage::UNIFORM,
            )?;
            allocation.buffers.push(buffer);
            backend.write_buffer(buffer, 0, bytemuck::bytes_of(&uniform))?;

            let pipeline = pipelines.terrain_for(kind.format());
            let bind_group = backend.create_bind_group(
                pipeline,
                0,
                &[
                    BindingResource::Buffer(buffer),
                    BindingResource::StorageTexture {
                        texture: tex.texture,
                        layer: tex.layer,
                    },
                ],
            )?;
            allocation.bind_groups.push(bind_group);
            backend.dispatch_compute(pipeline, &[bind_group], groups)?;
        }

        let missing = |kind: AtlasKind| {
            GenerationError::Pipeline(PipelineError::MissingTexture {
                key: key.to_string(),
                kind: kind.to_string(),
            })
        };
        let height = allocation
            .texture(AtlasKind::Height)
            .ok_or_else(|| missing(AtlasKind::Height))?;
        let tile = allocation
            .texture(AtlasKind::Tile)
            .ok_or_else(|| missing(AtlasKind::Tile))?;
        let splat = allocation
            .texture(AtlasKind::Splat)
            .ok_or_else(|| missing(AtlasKind::Splat))?;

        let uniform = SplatUniform::new(params.seed, &self.cfg, key, self.options.kernel_size);
        let buffer = backend.create_buffer(
            "splat_uniforms",
            std::mem::size_of::<SplatUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        allocation.buffers.push(buffer);
        backend.write_buffer(buffer, 0, bytemuck::bytes_of(&uniform))?;
        let bind_group = backend.create_bind_group(
            pipelines.splat,
            0,
            &[
                BindingResource::Buffer(buffer),
                BindingResource::Texture {
                    texture: height.texture,
                    layer: height.layer,
                },
                BindingResource::Texture {
                    texture: tile.texture,
                    layer: tile.layer,
                },
                BindingResource::StorageTexture {
                    texture: splat.texture,
                    layer: splat.layer,
                },
            ],
        )?;
        allocation.bind_groups.push(bind_group);
        let size = self.cfg.texture_size(key.lod);
        let groups = [size.div_ceil(WORKGROUP_SIZE), size.div_ceil(WORKGROUP_SIZE), 1];
        backend.dispatch_compute(pipelines.splat, &[bind_group], groups)?;
        Ok(())
    }

    fn record_cpu(
        &self,
        backend: &mut dyn GpuBackend,
        cache: &mut TextureCache,
        key: &AtlasKey,
        allocation: &mut Allocation,
    ) -> Result<(), GenerationError> {
        self.allocate_all(backend, cache, key, allocation)?;
        let images = build_atlas_images(&self.sampler, &self.cfg, key, self.options.kernel_size);
        for (kind, tex) in &allocation.textures {
            let side = images.side(*kind);
            let bytes = images.encode(*kind);
            let region = TextureRegion::full(tex.texture, tex.layer.unwrap_or(0), side, side);
            backend.write_texture(&region, &bytes, side * kind.format().bytes_per_texel())?;
        }
        Ok(())
    }
}
