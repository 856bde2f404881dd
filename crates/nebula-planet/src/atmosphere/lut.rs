//! CPU reference for the transmittance and multi-scatter LUTs.
//!
//! The compute shaders in `transmittance.wgsl` and `multi_scatter.wgsl`
//! evaluate the same formulas per texel. Backends without compute build the
//! tables here and upload them as RGBA16F.

use std::f32::consts::PI;

use glam::{Vec2, Vec3};

use super::params::{
    AtmosphereParams, MULTI_SCATTER_SAMPLES, MULTI_SCATTER_SIZE, TRANSMITTANCE_HEIGHT,
    TRANSMITTANCE_STEPS, TRANSMITTANCE_WIDTH, mie_phase, rayleigh_phase,
};

/// `(altitude, cos θ)` for normalised LUT coordinates.
///
/// `u` spans the distance to the horizon, `v` the distance to the top of
/// the atmosphere between its minimum and the grazing ray.
#[must_use]
pub fn transmittance_lut_params(params: &AtmosphereParams, u: f32, v: f32) -> (f32, f32) {
    let rp = params.planet_radius;
    let ra = params.atmosphere_radius;
    let h = params.horizon_distance();
    let rho = h * u;
    let r = (rho * rho + rp * rp).sqrt();
    let d_min = ra - r;
    let d_max = rho + h;
    let d = d_min + v * (d_max - d_min);
    let cos_theta = if d == 0.0 {
        1.0
    } else {
        ((h * h - rho * rho - d * d) / (2.0 * r * d)).clamp(-1.0, 1.0)
    };
    (r - rp, cos_theta)
}

/// Inverse of [`transmittance_lut_params`].
#[must_use]
pub fn transmittance_lut_uv(params: &AtmosphereParams, altitude: f32, cos_theta: f32) -> Vec2 {
    let rp = params.planet_radius;
    let ra = params.atmosphere_radius;
    let h = params.horizon_distance();
    let r = (rp + altitude.max(0.0)).min(ra);
    let rho = (r * r - rp * rp).max(0.0).sqrt();
    let disc = (r * r * (cos_theta * cos_theta - 1.0) + ra * ra).max(0.0);
    let d = (-r * cos_theta + disc.sqrt()).max(0.0);
    let d_min = ra - r;
    let d_max = rho + h;
    let v = if d_max > d_min {
        (d - d_min) / (d_max - d_min)
    } else {
        0.0
    };
    Vec2::new(
        if h > 0.0 { rho / h } else { 0.0 },
        v.clamp(0.0, 1.0),
    )
}

/// `exp(-optical depth)` from `altitude` along `cos_theta` to the top of the
/// atmosphere, integrated with [`TRANSMITTANCE_STEPS`] midpoint samples.
#[must_use]
pub fn integrate_transmittance(params: &AtmosphereParams, altitude: f32, cos_theta: f32) -> Vec3 {
    let r = params.planet_radius + altitude;
    let ra = params.atmosphere_radius;
    let disc = (r * r * (cos_theta * cos_theta - 1.0) + ra * ra).max(0.0);
    let length = (-r * cos_theta + disc.sqrt()).max(0.0);
    let step = length / TRANSMITTANCE_STEPS as f32;
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let dir = Vec2::new(sin_theta, cos_theta);
    let origin = Vec2::new(0.0, r);

    let mut depth = Vec3::ZERO;
    for i in 0..TRANSMITTANCE_STEPS {
        let t = (i as f32 + 0.5) * step;
        let a = (origin + dir * t).length() - params.planet_radius;
        if a < 0.0 {
            break;
        }
        depth += params.extinction(a) * step;
    }
    Vec3::new((-depth.x).exp(), (-depth.y).exp(), (-depth.z).exp())
}

/// An RGBA float table with bilinear lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct LutImage {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<[f32; 4]>,
}

impl LutImage {
    #[must_use]
    pub fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        self.texels[(y * self.width + x) as usize]
    }

    /// Bilinear sample at normalised `uv` with clamp-to-edge addressing.
    #[must_use]
    pub fn sample(&self, uv: Vec2) -> Vec3 {
        let fx = (uv.x * self.width as f32 - 0.5).clamp(0.0, (self.width - 1) as f32);
        let fy = (uv.y * self.height as f32 - 0.5).clamp(0.0, (self.height - 1) as f32);
        let (x0, y0) = (fx.floor() as u32, fy.floor() as u32);
        let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);
        let rgb = |x, y| Vec3::from_slice(&self.texel(x, y)[..3]);
        let top = rgb(x0, y0).lerp(rgb(x0 + 1, y0), tx);
        let bottom = rgb(x0, y0 + 1).lerp(rgb(x0 + 1, y0 + 1), tx);
        top.lerp(bottom, ty)
    }

    /// Texels as little-endian RGBA16F.
    #[must_use]
    pub fn to_rgba16f(&self) -> Vec<u8> {
        let halves: Vec<half::f16> = self
            .texels
            .iter()
            .flat_map(|t| t.iter().map(|c| half::f16::from_f32(*c)))
            .collect();
        bytemuck::cast_slice(&halves).to_vec()
    }

    /// Decode tightly packed RGBA16F texels.
    #[must_use]
    pub fn from_rgba16f(width: u32, height: u32, bytes: &[u8]) -> Self {
        let texels = bytes
            .chunks_exact(8)
            .take((width * height) as usize)
            .map(|t| {
                let c = |i: usize| half::f16::from_le_bytes([t[2 * i], t[2 * i + 1]]).to_f32();
                [c(0), c(1), c(2), c(3)]
            })
            .collect();
        Self {
            width,
            height,
            texels,
        }
    }
}

/// The transmittance table sampled by altitude and view-zenith cosine.
#[derive(Clone, Debug, PartialEq)]
pub struct TransmittanceLut {
    pub params: AtmosphereParams,
    pub image: LutImage,
}

impl TransmittanceLut {
    /// Evaluate every texel at its centre.
    #[must_use]
    pub fn build(params: &AtmosphereParams) -> Self {
        let (w, h) = (TRANSMITTANCE_WIDTH, TRANSMITTANCE_HEIGHT);
        let mut texels = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let u = (x as f32 + 0.5) / w as f32;
                let v = (y as f32 + 0.5) / h as f32;
                let (altitude, cos_theta) = transmittance_lut_params(params, u, v);
                let t = integrate_transmittance(params, altitude, cos_theta);
                texels.push([t.x, t.y, t.z, 1.0]);
            }
        }
        Self {
            params: params.clone(),
            image: LutImage {
                width: w,
                height: h,
                texels,
            },
        }
    }

    #[must_use]
    pub fn sample(&self, altitude: f32, cos_theta: f32) -> Vec3 {
        self.image
            .sample(transmittance_lut_uv(&self.params, altitude, cos_theta))
    }
}

/// Multi-scatter table indexed by sun-zenith cosine (`u`) and altitude (`v`).
///
/// Each texel integrates [`MULTI_SCATTER_SAMPLES`] directions around a great
/// circle through the zenith, weighting view and sun transmittance by the
/// Rayleigh and Mie phase functions, scaled by `2π / N`.
#[must_use]
pub fn build_multi_scatter_lut(params: &AtmosphereParams, transmittance: &TransmittanceLut) -> LutImage {
    let size = MULTI_SCATTER_SIZE;
    let mut texels = Vec::with_capacity((size * size) as usize);
    for y in 0..size {
        for x in 0..size {
            let u = (x as f32 + 0.5) / size as f32;
            let v = (y as f32 + 0.5) / size as f32;
            let c = multi_scatter_texel(params, transmittance, u, v);
            texels.push([c.x, c.y, c.z, 1.0]);
        }
    }
    LutImage {
        width: size,
        height: size,
        texels,
    }
}

fn multi_scatter_texel(params: &AtmosphereParams, lut: &TransmittanceLut, u: f32, v: f32) -> Vec3 {
    let cos_sun = 2.0 * u - 1.0;
    let altitude = v * (params.atmosphere_radius - params.planet_radius);
    let sun = Vec2::new((1.0 - cos_sun * cos_sun).max(0.0).sqrt(), cos_sun);
    let sun_t = lut.sample(altitude, cos_sun);
    let rayleigh = Vec3::from(params.rayleigh_scattering)
        * (-altitude / params.rayleigh_scale_height).exp();
    let mie = params.mie_scattering * (-altitude / params.mie_scale_height).exp();

    let n = MULTI_SCATTER_SAMPLES;
    let mut sum = Vec3::ZERO;
    for i in 0..n {
        let theta = (i as f32 + 0.5) / n as f32 * 2.0 * PI;
        let dir = Vec2::new(theta.sin(), theta.cos());
        let mu = dir.dot(sun);
        let view_t = lut.sample(altitude, dir.y);
        let scatter = rayleigh * rayleigh_phase(mu) + Vec3::splat(mie * mie_phase(mu, params.mie_anisotropy));
        sum += view_t * sun_t * scatter;
    }
    sum * (2.0 * PI / n as f32)
}
