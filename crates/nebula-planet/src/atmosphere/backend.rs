//! Where the atmosphere LUTs come from: compute dispatches on capable
//! backends, or the CPU reference uploaded as RGBA16F everywhere else.

use glam::Vec3;
use nebula_render::{
    BindGroupHandle, BindingResource, BindingType, BufferHandle, BufferUsage, ComputePipelineDesc,
    GpuBackend, PipelineHandle, SamplerHandle, TextureDesc, TextureFormat, TextureHandle,
    TextureRegion, TextureUsage, compose_wgsl,
};
use tracing::debug;

use super::lut::{LutImage, TransmittanceLut, build_multi_scatter_lut};
use super::params::{AtmosphereParams, MULTI_SCATTER_SIZE, TRANSMITTANCE_HEIGHT, TRANSMITTANCE_WIDTH};
use super::{ATMOSPHERE_COMMON_WGSL, MULTI_SCATTER_WGSL, TRANSMITTANCE_WGSL};
use crate::error::AtmosphereError;

const WORKGROUP_SIZE: u32 = 8;
const LUT_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// LUT textures owned by an [`AtmosphereBackend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LutTextures {
    pub transmittance: TextureHandle,
    pub multi_scatter: Option<TextureHandle>,
}

/// Produces the atmosphere LUTs on a [`GpuBackend`].
///
/// `generate_*` only record work; the caller submits and waits for the
/// submission before sampling the textures.
pub trait AtmosphereBackend {
    fn name(&self) -> &'static str;

    /// Allocate the LUT textures and any pipelines. Called once.
    fn initialize_resources(
        &mut self,
        gpu: &mut dyn GpuBackend,
        sampler: SamplerHandle,
        multi_scatter: bool,
    ) -> Result<LutTextures, AtmosphereError>;

    fn generate_transmittance(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError>;

    fn generate_multi_scatter(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError>;

    /// The CPU copy of the transmittance table, when this backend keeps one.
    fn cpu_lut(&self) -> Option<&TransmittanceLut> {
        None
    }
}

/// Pick the compute backend when the device can write storage textures.
#[must_use]
pub fn select_backend(gpu: &dyn GpuBackend) -> Box<dyn AtmosphereBackend> {
    if gpu.capabilities().supports_compute_generation() {
        Box::new(ComputeAtmosphereBackend::default())
    } else {
        Box::new(CpuAtmosphereBackend::default())
    }
}

struct ComputeResources {
    transmittance_pipeline: PipelineHandle,
    transmittance_uniform: BufferHandle,
    transmittance_bind_group: BindGroupHandle,
    multi_scatter: Option<(PipelineHandle, BufferHandle, BindGroupHandle)>,
}

/// Dispatches `transmittance.wgsl` and `multi_scatter.wgsl`.
#[derive(Default)]
pub struct ComputeAtmosphereBackend {
    resources: Option<ComputeResources>,
}

fn groups(width: u32, height: u32) -> [u32; 3] {
    [width.div_ceil(WORKGROUP_SIZE), height.div_ceil(WORKGROUP_SIZE), 1]
}

impl AtmosphereBackend for ComputeAtmosphereBackend {
    fn name(&self) -> &'static str {
        "compute"
    }

    fn initialize_resources(
        &mut self,
        gpu: &mut dyn GpuBackend,
        sampler: SamplerHandle,
        multi_scatter: bool,
    ) -> Result<LutTextures, AtmosphereError> {
        let transmittance = gpu.create_storage_texture(
            "transmittance_lut",
            TRANSMITTANCE_WIDTH,
            TRANSMITTANCE_HEIGHT,
            LUT_FORMAT,
            1,
        )?;
        let shader = compose_wgsl(&[ATMOSPHERE_COMMON_WGSL, TRANSMITTANCE_WGSL]);
        let layout = [
            BindingType::UniformBuffer,
            BindingType::StorageTexture { format: LUT_FORMAT },
        ];
        let transmittance_pipeline = gpu.create_compute_pipeline(&ComputePipelineDesc {
            label: "atmosphere_transmittance",
            shader: &shader,
            entry_point: "cs_main",
            bind_group_layouts: &[&layout],
        })?;
        let uniform_size = std::mem::size_of::<super::params::AtmosphereUniform>() as u64;
        let transmittance_uniform = gpu.create_buffer("transmittance_uniform", uniform_size, BufferUsage::UNIFORM)?;
        let transmittance_bind_group = gpu.create_bind_group(
            transmittance_pipeline,
            0,
            &[
                BindingResource::Buffer(transmittance_uniform),
                BindingResource::StorageTexture {
                    texture: transmittance,
                    layer: None,
                },
            ],
        )?;

        let mut ms_texture = None;
        let mut ms = None;
        if multi_scatter {
            let texture = gpu.create_storage_texture(
                "multi_scatter_lut",
                MULTI_SCATTER_SIZE,
                MULTI_SCATTER_SIZE,
                LUT_FORMAT,
                1,
            )?;
            let shader = compose_wgsl(&[ATMOSPHERE_COMMON_WGSL, MULTI_SCATTER_WGSL]);
            let layout = [
                BindingType::UniformBuffer,
                BindingType::Texture {
                    filterable: true,
                    array: false,
                },
                BindingType::Sampler { filtering: true },
                BindingType::StorageTexture { format: LUT_FORMAT },
            ];
            let pipeline = gpu.create_compute_pipeline(&ComputePipelineDesc {
                label: "atmosphere_multi_scatter",
                shader: &shader,
                entry_point: "cs_main",
                bind_group_layouts: &[&layout],
            })?;
            let uniform = gpu.create_buffer("multi_scatter_uniform", uniform_size, BufferUsage::UNIFORM)?;
            let bind_group = gpu.create_bind_group(
                pipeline,
                0,
                &[
                    BindingResource::Buffer(uniform),
                    BindingResource::Texture {
                        texture: transmittance,
                        layer: None,
                    },
                    BindingResource::Sampler(sampler),
                    BindingResource::StorageTexture { texture, layer: None },
                ],
            )?;
            ms_texture = Some(texture);
            ms = Some((pipeline, uniform, bind_group));
        }
        debug!("Created atmosphere compute pipelines (multi-scatter: {multi_scatter})");

        self.resources = Some(ComputeResources {
            transmittance_pipeline,
            transmittance_uniform,
            transmittance_bind_group,
            multi_scatter: ms,
        });
        Ok(LutTextures {
            transmittance,
            multi_scatter: ms_texture,
        })
    }

    fn generate_transmittance(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError> {
        let res = self.resources.as_ref().ok_or(AtmosphereError::NotInitialized)?;
        let uniform = params.uniform(Vec3::ZERO, false, [TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT]);
        gpu.write_buffer(res.transmittance_uniform, 0, bytemuck::bytes_of(&uniform))?;
        gpu.dispatch_compute(
            res.transmittance_pipeline,
            &[res.transmittance_bind_group],
            groups(TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT),
        )?;
        Ok(())
    }

    fn generate_multi_scatter(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError> {
        let res = self.resources.as_ref().ok_or(AtmosphereError::NotInitialized)?;
        let Some((pipeline, uniform_buffer, bind_group)) = res.multi_scatter else {
            return Ok(());
        };
        let uniform = params.uniform(Vec3::ZERO, false, [MULTI_SCATTER_SIZE, MULTI_SCATTER_SIZE]);
        gpu.write_buffer(uniform_buffer, 0, bytemuck::bytes_of(&uniform))?;
        gpu.dispatch_compute(pipeline, &[bind_group], groups(MULTI_SCATTER_SIZE, MULTI_SCATTER_SIZE))?;
        Ok(())
    }
}

/// Builds both tables on the CPU and uploads them.
#[derive(Default)]
pub struct CpuAtmosphereBackend {
    textures: Option<LutTextures>,
    transmittance: Option<TransmittanceLut>,
}

fn upload(gpu: &mut dyn GpuBackend, texture: TextureHandle, image: &LutImage) -> Result<(), AtmosphereError> {
    let region = TextureRegion::full(texture, 0, image.width, image.height);
    gpu.write_texture(&region, &image.to_rgba16f(), image.width * LUT_FORMAT.bytes_per_texel())?;
    Ok(())
}

impl AtmosphereBackend for CpuAtmosphereBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn initialize_resources(
        &mut self,
        gpu: &mut dyn GpuBackend,
        _sampler: SamplerHandle,
        multi_scatter: bool,
    ) -> Result<LutTextures, AtmosphereError> {
        let desc = |label, width, height| TextureDesc {
            label,
            width,
            height,
            layers: 1,
            format: LUT_FORMAT,
            usage: TextureUsage::UPLOAD,
        };
        let transmittance = gpu.create_texture_2d(&desc("transmittance_lut", TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT))?;
        let multi_scatter = if multi_scatter {
            Some(gpu.create_texture_2d(&desc("multi_scatter_lut", MULTI_SCATTER_SIZE, MULTI_SCATTER_SIZE))?)
        } else {
            None
        };
        let textures = LutTextures {
            transmittance,
            multi_scatter,
        };
        self.textures = Some(textures);
        Ok(textures)
    }

    fn generate_transmittance(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError> {
        let textures = self.textures.ok_or(AtmosphereError::NotInitialized)?;
        let lut = TransmittanceLut::build(params);
        upload(gpu, textures.transmittance, &lut.image)?;
        self.transmittance = Some(lut);
        Ok(())
    }

    fn generate_multi_scatter(
        &mut self,
        gpu: &mut dyn GpuBackend,
        params: &AtmosphereParams,
    ) -> Result<(), AtmosphereError> {
        let textures = self.textures.ok_or(AtmosphereError::NotInitialized)?;
        let Some(target) = textures.multi_scatter else {
            return Ok(());
        };
        let image = match &self.transmittance {
            Some(lut) if lut.params == *params => build_multi_scatter_lut(params, lut),
            _ => build_multi_scatter_lut(params, &TransmittanceLut::build(params)),
        };
        upload(gpu, target, &image)
    }

    fn cpu_lut(&self) -> Option<&TransmittanceLut> {
        self.transmittance.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_render::{AddressMode, ApiName, BackendCapabilities, FilterMode, SamplerDesc, SoftwareBackend};

    fn sampler(gpu: &mut dyn GpuBackend) -> SamplerHandle {
        gpu.create_sampler(&SamplerDesc {
            filter: FilterMode::Linear,
            address: AddressMode::ClampToEdge,
        })
        .unwrap()
    }

    /// The compute backend records one dispatch per table with full coverage.
    #[test]
    fn test_compute_dispatch_groups() {
        let mut gpu = SoftwareBackend::with_capabilities(ApiName::WebGpu, BackendCapabilities::FULL);
        let s = sampler(&mut gpu);
        let mut backend = select_backend(&gpu);
        assert_eq!(backend.name(), "compute");
        let textures = backend.initialize_resources(&mut gpu, s, true).unwrap();
        assert!(textures.multi_scatter.is_some());
        let params = AtmosphereParams::earth_like(50_000.0);
        backend.generate_transmittance(&mut gpu, &params).unwrap();
        backend.generate_multi_scatter(&mut gpu, &params).unwrap();
        let d = gpu.dispatches();
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].pipeline, "atmosphere_transmittance");
        assert_eq!(d[0].groups, [32, 8, 1]);
        assert_eq!(d[1].pipeline, "atmosphere_multi_scatter");
        assert_eq!(d[1].groups, [4, 4, 1]);
        assert!(backend.cpu_lut().is_none());
    }

    /// Without compute the tables are built on the CPU and uploaded as RGBA16F.
    #[test]
    fn test_cpu_upload_matches_reference() {
        let mut gpu = SoftwareBackend::new();
        let s = sampler(&mut gpu);
        let mut backend = select_backend(&gpu);
        assert_eq!(backend.name(), "cpu");
        let textures = backend.initialize_resources(&mut gpu, s, false).unwrap();
        assert_eq!(textures.multi_scatter, None);
        let params = AtmosphereParams::earth_like(50_000.0);
        backend.generate_transmittance(&mut gpu, &params).unwrap();
        backend.generate_multi_scatter(&mut gpu, &params).unwrap();
        assert!(gpu.dispatches().is_empty());

        let bytes = gpu.texture_data(textures.transmittance, 0).unwrap();
        let uploaded = LutImage::from_rgba16f(TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT, bytes);
        let reference = backend.cpu_lut().unwrap();
        let a = uploaded.texel(100, 20);
        let b = reference.image.texel(100, 20);
        for c in 0..3 {
            assert!((a[c] - b[c]).abs() < 1e-3, "channel {c}: {} vs {}", a[c], b[c]);
        }
    }

    /// Generating before initialisation is an error, not a panic.
    #[test]
    fn test_generate_requires_init() {
        let mut gpu = SoftwareBackend::new();
        let mut backend = CpuAtmosphereBackend::default();
        let params = AtmosphereParams::earth_like(50_000.0);
        assert!(matches!(
            backend.generate_transmittance(&mut gpu, &params),
            Err(AtmosphereError::NotInitialized)
        ));
    }
}
