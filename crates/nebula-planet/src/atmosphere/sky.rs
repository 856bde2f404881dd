//! Fullscreen sky pass and its CPU twin.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use nebula_render::{
    BindGroupHandle, BindingResource, BindingType, BlendMode, BufferHandle, BufferUsage,
    DepthState, DrawCall, GpuBackend, PipelineHandle, RenderPipelineDesc, SamplerHandle,
    TextureFormat, TextureHandle,
};

use super::lut::TransmittanceLut;
use super::params::{
    AtmosphereParams, AtmosphereUniform, mie_phase, ray_sphere_intersect_f32, rayleigh_phase,
    tonemap,
};
use crate::error::AtmosphereError;

/// GPU layout of `SkyUniforms` in `sky.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SkyUniform {
    pub atmosphere: AtmosphereUniform,
    /// (offset 80)
    pub inv_view_proj: [[f32; 4]; 4],
    /// (offset 144)
    pub camera_position: [f32; 3],
    pub lut_ready: u32,
    /// (offset 160)
    pub sun_direction: [f32; 3],
    pub num_samples: u32,
    /// (offset 176)
    pub zenith_color: [f32; 3],
    pub daylight: f32,
    /// (offset 192)
    pub horizon_color: [f32; 3],
    pub _pad: f32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<SkyUniform>(), 208);

/// Per-frame inputs of the sky pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SkyInputs {
    pub inv_view_proj: Mat4,
    pub camera_position: Vec3,
    pub sun_direction: Vec3,
    pub zenith_color: Vec3,
    pub horizon_color: Vec3,
    pub daylight: f32,
    pub num_samples: u32,
    pub spherical: bool,
    /// Only used in spherical mode.
    pub planet_center: Vec3,
}

impl SkyUniform {
    #[must_use]
    pub fn new(params: &AtmosphereParams, inputs: &SkyInputs, lut_ready: bool, lut_size: [u32; 2]) -> Self {
        Self {
            atmosphere: params.uniform(inputs.planet_center, inputs.spherical, lut_size),
            inv_view_proj: inputs.inv_view_proj.to_cols_array_2d(),
            camera_position: inputs.camera_position.to_array(),
            lut_ready: u32::from(lut_ready),
            sun_direction: inputs.sun_direction.normalize_or_zero().to_array(),
            num_samples: inputs.num_samples,
            zenith_color: inputs.zenith_color.to_array(),
            daylight: inputs.daylight,
            horizon_color: inputs.horizon_color.to_array(),
            _pad: 0.0,
        }
    }
}

fn sky_center(params: &AtmosphereParams, inputs: &SkyInputs) -> Vec3 {
    if inputs.spherical {
        inputs.planet_center
    } else {
        Vec3::new(inputs.camera_position.x, -params.planet_radius, inputs.camera_position.z)
    }
}

fn sky_up(inputs: &SkyInputs) -> Vec3 {
    if inputs.spherical {
        (inputs.camera_position - inputs.planet_center)
            .try_normalize()
            .unwrap_or(Vec3::Y)
    } else {
        Vec3::Y
    }
}

/// World-space view ray through `ndc`.
#[must_use]
pub fn view_ray(inputs: &SkyInputs, ndc: Vec2) -> Vec3 {
    let p = inputs.inv_view_proj * Vec4::new(ndc.x, ndc.y, 0.5, 1.0);
    (p.truncate() / p.w - inputs.camera_position).normalize_or_zero()
}

/// Horizon-to-zenith gradient scaled by daylight.
#[must_use]
pub fn sky_gradient(inputs: &SkyInputs, dir: Vec3) -> Vec3 {
    let h = dir.dot(sky_up(inputs)).clamp(0.0, 1.0);
    inputs.horizon_color.lerp(inputs.zenith_color, h.sqrt()) * inputs.daylight
}

/// In-scattered sun light along `dir`, before tonemapping.
#[must_use]
pub fn sky_scatter(params: &AtmosphereParams, inputs: &SkyInputs, lut: &TransmittanceLut, dir: Vec3) -> Vec3 {
    let center = sky_center(params, inputs);
    let origin = inputs.camera_position;
    let (near, far) = ray_sphere_intersect_f32(origin, dir, center, params.atmosphere_radius);
    if far < 0.0 {
        return Vec3::ZERO;
    }
    let t_start = near.max(0.0);
    let mut t_end = far;
    let (ground, _) = ray_sphere_intersect_f32(origin, dir, center, params.planet_radius);
    if ground > 0.0 {
        t_end = t_end.min(ground);
    }
    if t_end <= t_start {
        return Vec3::ZERO;
    }
    let n = inputs.num_samples.max(1);
    let dt = (t_end - t_start) / n as f32;
    let sun = inputs.sun_direction.normalize_or_zero();
    let mu = dir.dot(sun);
    let phase_r = rayleigh_phase(mu);
    let phase_m = mie_phase(mu, params.mie_anisotropy);

    let mut depth = Vec3::ZERO;
    let mut sum = Vec3::ZERO;
    for i in 0..n {
        let pos = origin + dir * (t_start + (i as f32 + 0.5) * dt);
        let rel = pos - center;
        let alt = rel.length() - params.planet_radius;
        let up = rel / rel.length();
        depth += params.extinction(alt) * dt;
        let sun_t = lut.sample(alt, up.dot(sun));
        let scat = Vec3::from(params.rayleigh_scattering) * (-alt / params.rayleigh_scale_height).exp() * phase_r
            + Vec3::splat(params.mie_scattering * (-alt / params.mie_scale_height).exp() * phase_m);
        let view_t = Vec3::new((-depth.x).exp(), (-depth.y).exp(), (-depth.z).exp());
        sum += view_t * sun_t * scat * dt;
    }
    sum * params.sun_intensity
}

/// Final sky colour at `ndc`. Without a LUT only the gradient is drawn.
#[must_use]
pub fn sky_color(
    params: &AtmosphereParams,
    inputs: &SkyInputs,
    lut: Option<&TransmittanceLut>,
    ndc: Vec2,
) -> Vec3 {
    let dir = view_ray(inputs, ndc);
    let floor_color = sky_gradient(inputs, dir);
    let (c, floor_weight) = match lut {
        Some(lut) => {
            let sun_up = sky_up(inputs).dot(inputs.sun_direction.normalize_or_zero());
            (
                sky_scatter(params, inputs, lut, dir),
                0.15 * (sun_up * 5.0).clamp(0.0, 1.0),
            )
        }
        None => (Vec3::ZERO, 1.0),
    };
    tonemap(c.max(floor_color * floor_weight))
}

/// The sky render pipeline and its per-frame uniform.
pub(crate) struct SkyPass {
    pipeline: PipelineHandle,
    uniform: BufferHandle,
    bind_group: Option<(BindGroupHandle, TextureHandle)>,
}

impl SkyPass {
    pub(crate) fn new(gpu: &mut dyn GpuBackend, color_format: TextureFormat) -> Result<Self, AtmosphereError> {
        let shader = nebula_render::compose_wgsl(&[super::ATMOSPHERE_COMMON_WGSL, super::SKY_WGSL]);
        let layout = [
            BindingType::UniformBuffer,
            BindingType::Texture {
                filterable: true,
                array: false,
            },
            BindingType::Sampler { filtering: true },
        ];
        let pipeline = gpu.create_render_pipeline(&RenderPipelineDesc {
            label: "sky",
            shader: &shader,
            vs_entry: "vs_main",
            fs_entry: "fs_main",
            vertex_layouts: &[],
            bind_group_layouts: &[&layout],
            color_format,
            depth: Some(DepthState::REVERSE_Z_READ_ONLY),
            blend: BlendMode::Opaque,
            cull_back_faces: false,
        })?;
        let uniform = gpu.create_buffer(
            "sky_uniform",
            std::mem::size_of::<SkyUniform>() as u64,
            BufferUsage::UNIFORM,
        )?;
        Ok(Self {
            pipeline,
            uniform,
            bind_group: None,
        })
    }

    /// Upload the uniform and issue the fullscreen triangle into the open pass.
    pub(crate) fn draw(
        &mut self,
        gpu: &mut dyn GpuBackend,
        uniform: &SkyUniform,
        lut: TextureHandle,
        sampler: SamplerHandle,
    ) -> Result<(), AtmosphereError> {
        gpu.write_buffer(self.uniform, 0, bytemuck::bytes_of(uniform))?;
        let bind_group = match self.bind_group {
            Some((bg, tex)) if tex == lut => bg,
            stale => {
                if let Some((bg, _)) = stale {
                    gpu.destroy_bind_group(bg);
                }
                let bg = gpu.create_bind_group(
                    self.pipeline,
                    0,
                    &[
                        BindingResource::Buffer(self.uniform),
                        BindingResource::Texture {
                            texture: lut,
                            layer: None,
                        },
                        BindingResource::Sampler(sampler),
                    ],
                )?;
                self.bind_group = Some((bg, lut));
                bg
            }
        };
        gpu.draw(&DrawCall {
            pipeline: self.pipeline,
            bind_groups: &[bind_group],
            vertex_buffers: &[],
            index_buffer: None,
            count: 3,
            instance_count: 1,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(sun: Vec3) -> SkyInputs {
        let view = Mat4::look_to_rh(Vec3::new(0.0, 100.0, 0.0), Vec3::X, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 10_000.0, 0.1);
        SkyInputs {
            inv_view_proj: (proj * view).inverse(),
            camera_position: Vec3::new(0.0, 100.0, 0.0),
            sun_direction: sun.normalize(),
            zenith_color: Vec3::new(0.25, 0.45, 0.9),
            horizon_color: Vec3::new(0.7, 0.8, 0.95),
            daylight: 1.0,
            num_samples: 16,
            spherical: false,
            planet_center: Vec3::ZERO,
        }
    }

    /// View rays through the screen centre follow the camera forward axis,
    /// and rays near the top of the screen point upwards.
    #[test]
    fn test_view_ray() {
        let i = inputs(Vec3::Y);
        let centre = view_ray(&i, Vec2::ZERO);
        assert!((centre - Vec3::X).length() < 1e-3, "centre {centre}");
        assert!(view_ray(&i, Vec2::new(0.0, 0.8)).y > 0.2);
    }

    /// Without a LUT the sky falls back to a tonemapped gradient that is not white.
    #[test]
    fn test_sky_gradient_fallback() {
        let p = AtmosphereParams::earth_like(50_000.0);
        let i = inputs(Vec3::new(0.5, 1.0, 0.3));
        let c = sky_color(&p, &i, None, Vec2::new(0.0, 0.8));
        assert!(c.max_element() < 1.0, "tonemapped {c}");
        assert!(c.min_element() > 0.0, "gradient {c}");
        assert!(c.z > c.x, "fallback sky is blue-ish: {c}");
    }

    /// With a LUT the noon sky is the scattered one: blue, tonemapped and
    /// distinct from the gradient fallback.
    #[test]
    fn test_sky_scatter_with_lut() {
        let p = AtmosphereParams::earth_like(50_000.0);
        let lut = TransmittanceLut::build(&p);
        let noon = inputs(Vec3::Y);
        let ndc = Vec2::new(0.0, 0.95);
        let up = sky_color(&p, &noon, Some(&lut), ndc);
        assert!(up.z > up.x, "noon sky {up}");
        assert!(up.max_element() < 1.0);
        let fallback = sky_color(&p, &noon, None, ndc);
        assert!((up - fallback).length() > 1e-3, "scatter {up} vs gradient {fallback}");
    }

    /// Uniform packing keeps the nested atmosphere block first.
    #[test]
    fn test_sky_uniform_layout() {
        let p = AtmosphereParams::earth_like(50_000.0);
        let u = SkyUniform::new(&p, &inputs(Vec3::Y), true, [256, 64]);
        let words: &[u32] = bytemuck::cast_slice(std::slice::from_ref(&u));
        assert_eq!(words.len() * 4, 208);
        assert_eq!(words[39], 1, "lut_ready at offset 156");
        assert_eq!(f32::from_bits(words[37]), 100.0, "camera y at offset 148");
    }
}
