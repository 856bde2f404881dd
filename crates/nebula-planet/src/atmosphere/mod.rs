//! Atmosphere: transmittance and multi-scatter LUTs, the fullscreen sky pass
//! and the aerial-perspective module sampled by the terrain shader.
//!
//! [`Atmosphere`] runs a small state machine. Parameter changes mark the LUTs
//! dirty; the next [`Atmosphere::update`] records the LUT work and submits it,
//! and the sky switches from its gradient fallback to the scattered sky only
//! once that submission has completed. Any number of `mark_dirty` calls in
//! between collapse into a single rebuild.

mod aerial;
mod backend;
mod lut;
mod params;
mod sky;

pub use aerial::{
    AP_FULL_BLEND_DISTANCE, AltitudeFrame, ApResult, ap_apply_with_blend, ap_blend,
    ap_compute_simple,
};
pub(crate) use aerial::smoothstep;
pub use backend::{
    AtmosphereBackend, ComputeAtmosphereBackend, CpuAtmosphereBackend, LutTextures, select_backend,
};
pub use lut::{
    LutImage, TransmittanceLut, build_multi_scatter_lut, integrate_transmittance,
    transmittance_lut_params, transmittance_lut_uv,
};
pub use params::{
    AtmosphereParams, AtmosphereUniform, MULTI_SCATTER_SIZE, TRANSMITTANCE_HEIGHT,
    TRANSMITTANCE_WIDTH, mie_phase, ray_sphere_intersect_f32, rayleigh_phase, tonemap,
};
pub use sky::{SkyInputs, SkyUniform, sky_color, sky_gradient, sky_scatter, view_ray};

use glam::Vec3;
use nebula_config::AtmosphereConfig;
use nebula_render::{
    AddressMode, FilterMode, GpuBackend, SamplerDesc, SamplerHandle, SubmissionId,
    SubmissionStatus, TextureDesc, TextureFormat, TextureHandle, TextureRegion, TextureUsage,
};
use tracing::{debug, info, warn};

use crate::error::AtmosphereError;
use sky::SkyPass;

/// Parameter block, geometry helpers, phase functions and tonemap.
pub const ATMOSPHERE_COMMON_WGSL: &str = include_str!("atmosphere_common.wgsl");

/// Transmittance LUT compute pass.
pub const TRANSMITTANCE_WGSL: &str = include_str!("transmittance.wgsl");

/// Multi-scatter LUT compute pass.
pub const MULTI_SCATTER_WGSL: &str = include_str!("multi_scatter.wgsl");

/// `ap_compute_simple` and friends, for surface shaders.
pub const AERIAL_PERSPECTIVE_WGSL: &str = include_str!("aerial_perspective.wgsl");

/// Fullscreen sky.
pub const SKY_WGSL: &str = include_str!("sky.wgsl");

/// Failed LUT submissions tolerated before the sky stays on its gradient.
const MAX_LUT_ATTEMPTS: u32 = 3;

/// Lifecycle of the LUTs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AtmosphereState {
    /// `initialize` has not run.
    Uninitialized,
    /// LUT work is submitted and the GPU has not finished it.
    Compiling,
    /// The LUTs must be rebuilt on the next update.
    LutDirty,
    Ready,
}

/// LUT ownership, the state machine and the sky pass.
pub struct Atmosphere {
    params: AtmosphereParams,
    enabled: bool,
    multi_scatter: bool,
    sky_samples: u32,
    state: AtmosphereState,
    backend: Option<Box<dyn AtmosphereBackend>>,
    textures: Option<LutTextures>,
    placeholder: Option<TextureHandle>,
    sampler: Option<SamplerHandle>,
    sky: Option<SkyPass>,
    pending: Option<SubmissionId>,
    /// Set when `mark_dirty` arrives while a build is in flight.
    redo: bool,
    lut_ready: bool,
    failures: u32,
    builds: u64,
}

impl Atmosphere {
    #[must_use]
    pub fn new(cfg: &AtmosphereConfig) -> Self {
        Self {
            params: AtmosphereParams::from_config(cfg),
            enabled: cfg.enable_atmosphere,
            multi_scatter: cfg.enable_multi_scatter,
            sky_samples: cfg.sky_samples.max(1),
            state: AtmosphereState::Uninitialized,
            backend: None,
            textures: None,
            placeholder: None,
            sampler: None,
            sky: None,
            pending: None,
            redo: false,
            lut_ready: false,
            failures: 0,
            builds: 0,
        }
    }

    pub fn state(&self) -> AtmosphereState {
        self.state
    }

    pub fn params(&self) -> &AtmosphereParams {
        &self.params
    }

    /// True once a LUT build has completed on the GPU.
    pub fn lut_ready(&self) -> bool {
        self.lut_ready
    }

    /// Completed LUT builds.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn textures(&self) -> Option<LutTextures> {
        self.textures
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// The CPU transmittance table, on backends that build one.
    pub fn cpu_lut(&self) -> Option<&TransmittanceLut> {
        self.backend.as_ref().and_then(|b| b.cpu_lut())
    }

    /// Create the sky pipeline and LUT resources. With the atmosphere
    /// disabled only a 1×1 placeholder LUT is allocated and the sky draws
    /// its gradient.
    pub fn initialize(
        &mut self,
        gpu: &mut dyn GpuBackend,
        color_format: TextureFormat,
    ) -> Result<(), AtmosphereError> {
        if self.state != AtmosphereState::Uninitialized {
            return Ok(());
        }
        let sampler = gpu.create_sampler(&SamplerDesc {
            filter: FilterMode::Linear,
            address: AddressMode::ClampToEdge,
        })?;
        self.sky = Some(SkyPass::new(gpu, color_format)?);
        self.sampler = Some(sampler);

        if !self.enabled {
            self.placeholder = Some(create_placeholder(gpu)?);
            self.set_state(AtmosphereState::Ready);
            return Ok(());
        }

        let mut backend = select_backend(gpu);
        let textures = backend.initialize_resources(gpu, sampler, self.multi_scatter)?;
        info!(
            "Atmosphere initialized with {} LUT backend on {:?}",
            backend.name(),
            gpu.api_name()
        );
        self.backend = Some(backend);
        self.textures = Some(textures);
        self.set_state(AtmosphereState::LutDirty);
        Ok(())
    }

    /// Request a LUT rebuild. Calls made while a rebuild is pending or in
    /// flight coalesce into one.
    pub fn mark_dirty(&mut self) {
        self.failures = 0;
        match self.state {
            AtmosphereState::Ready if self.enabled => self.set_state(AtmosphereState::LutDirty),
            AtmosphereState::Compiling => self.redo = true,
            _ => {}
        }
    }

    /// Replace the parameters; the LUTs are rebuilt only if they changed.
    pub fn set_params(&mut self, params: AtmosphereParams) {
        if params != self.params {
            self.params = params;
            self.mark_dirty();
        }
    }

    /// Advance the state machine. Records and submits LUT work when dirty and
    /// checks the in-flight submission otherwise. Never blocks.
    pub fn update(&mut self, gpu: &mut dyn GpuBackend) -> Result<AtmosphereState, AtmosphereError> {
        match self.state {
            AtmosphereState::Uninitialized => return Err(AtmosphereError::NotInitialized),
            AtmosphereState::LutDirty => {
                let backend = self.backend.as_mut().ok_or(AtmosphereError::NotInitialized)?;
                backend.generate_transmittance(gpu, &self.params)?;
                if self.multi_scatter {
                    backend.generate_multi_scatter(gpu, &self.params)?;
                }
                let id = gpu.submit();
                debug!("Submitted atmosphere LUT build as {id:?}");
                self.pending = Some(id);
                self.set_state(AtmosphereState::Compiling);
            }
            AtmosphereState::Compiling => {
                let Some(id) = self.pending else {
                    self.set_state(AtmosphereState::LutDirty);
                    return Ok(self.state);
                };
                match gpu.submission_status(id) {
                    SubmissionStatus::Pending => {}
                    SubmissionStatus::Complete => {
                        self.pending = None;
                        self.lut_ready = true;
                        self.failures = 0;
                        self.builds += 1;
                        if self.redo {
                            self.redo = false;
                            self.set_state(AtmosphereState::LutDirty);
                        } else {
                            self.set_state(AtmosphereState::Ready);
                        }
                    }
                    SubmissionStatus::Failed(reason) => {
                        self.pending = None;
                        self.failures += 1;
                        if self.failures >= MAX_LUT_ATTEMPTS {
                            warn!("Atmosphere LUT failed {} times, keeping the gradient sky: {reason}", self.failures);
                            self.redo = false;
                            self.set_state(AtmosphereState::Ready);
                            return Err(AtmosphereError::LutFailed(reason));
                        }
                        warn!("Atmosphere LUT build failed (attempt {}), will retry: {reason}", self.failures);
                        self.set_state(AtmosphereState::LutDirty);
                    }
                }
            }
            AtmosphereState::Ready => {}
        }
        Ok(self.state)
    }

    /// Sky uniform for this frame, as the sky pass would upload it.
    #[must_use]
    pub fn sky_uniform(&self, inputs: &SkyInputs) -> SkyUniform {
        let inputs = SkyInputs {
            num_samples: self.sky_samples,
            ..*inputs
        };
        SkyUniform::new(
            &self.params,
            &inputs,
            self.lut_ready,
            [TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT],
        )
    }

    /// Parameter block bound by surface shaders for aerial perspective.
    #[must_use]
    pub fn surface_uniform(&self, planet_center: Vec3, spherical: bool) -> AtmosphereUniform {
        self.params
            .uniform(planet_center, spherical, [TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT])
    }

    /// Draw the sky into the currently open pass. Must come after all
    /// opaque geometry: it only fills texels still at the far plane.
    pub fn draw_sky(&mut self, gpu: &mut dyn GpuBackend, inputs: &SkyInputs) -> Result<(), AtmosphereError> {
        let uniform = self.sky_uniform(inputs);
        let lut = self
            .textures
            .map(|t| t.transmittance)
            .or(self.placeholder)
            .ok_or(AtmosphereError::NotInitialized)?;
        let sampler = self.sampler.ok_or(AtmosphereError::NotInitialized)?;
        let sky = self.sky.as_mut().ok_or(AtmosphereError::NotInitialized)?;
        sky.draw(gpu, &uniform, lut, sampler)
    }

    fn set_state(&mut self, next: AtmosphereState) {
        if self.state != next {
            debug!("Atmosphere {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn create_placeholder(gpu: &mut dyn GpuBackend) -> Result<TextureHandle, AtmosphereError> {
    let texture = gpu.create_texture_2d(&TextureDesc {
        label: "transmittance_placeholder",
        width: 1,
        height: 1,
        layers: 1,
        format: TextureFormat::Rgba16Float,
        usage: TextureUsage::UPLOAD,
    })?;
    let one = half::f16::ONE.to_le_bytes();
    let texel: Vec<u8> = (0..4).flat_map(|_| one).collect();
    gpu.write_texture(&TextureRegion::full(texture, 0, 1, 1), &texel, 8)?;
    Ok(texture)
}
