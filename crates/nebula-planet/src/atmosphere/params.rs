//! Atmosphere parameters, the shared uniform block, and the scattering
//! helpers every atmosphere pass (CPU and WGSL) is built from.

use std::f32::consts::PI;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use nebula_config::AtmosphereConfig;
use serde::Serialize;

/// Transmittance LUT width (view-zenith axis).
pub const TRANSMITTANCE_WIDTH: u32 = 256;
/// Transmittance LUT height (altitude axis).
pub const TRANSMITTANCE_HEIGHT: u32 = 64;
/// Integration steps per transmittance texel.
pub const TRANSMITTANCE_STEPS: u32 = 40;
/// Side of the square multi-scatter LUT.
pub const MULTI_SCATTER_SIZE: u32 = 32;
/// Directions integrated per multi-scatter texel.
pub const MULTI_SCATTER_SAMPLES: u32 = 16;

/// Centre altitude of the ozone layer in meters.
pub const OZONE_CENTER: f32 = 25_000.0;
/// Half-width of the ozone tent profile in meters.
pub const OZONE_HALF_WIDTH: f32 = 15_000.0;

/// Physical description of a planet's atmosphere.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AtmosphereParams {
    /// Surface radius in meters.
    pub planet_radius: f32,
    /// Top of the atmosphere in meters from the planet centre.
    pub atmosphere_radius: f32,
    pub rayleigh_scale_height: f32,
    pub mie_scale_height: f32,
    /// Rayleigh scattering coefficients at sea level (1/m, RGB).
    pub rayleigh_scattering: [f32; 3],
    /// Mie scattering coefficient at sea level (1/m).
    pub mie_scattering: f32,
    /// Ozone absorption coefficients at the layer peak (1/m, RGB).
    pub ozone_absorption: [f32; 3],
    /// Mie phase asymmetry `g`.
    pub mie_anisotropy: f32,
    pub sun_intensity: f32,
}

impl AtmosphereParams {
    #[must_use]
    pub fn from_config(cfg: &AtmosphereConfig) -> Self {
        Self {
            planet_radius: cfg.planet_radius,
            atmosphere_radius: cfg.planet_radius + cfg.atmosphere_height,
            rayleigh_scale_height: cfg.scale_height_rayleigh,
            mie_scale_height: cfg.scale_height_mie,
            rayleigh_scattering: cfg.rayleigh_scattering,
            mie_scattering: cfg.mie_scattering,
            ozone_absorption: cfg.ozone_absorption,
            mie_anisotropy: cfg.mie_anisotropy,
            sun_intensity: cfg.sun_intensity,
        }
    }

    /// Earth-like atmosphere scaled onto a planet of `planet_radius` meters.
    #[must_use]
    pub fn earth_like(planet_radius: f32) -> Self {
        Self {
            planet_radius,
            atmosphere_radius: planet_radius + 60_000.0,
            rayleigh_scale_height: 8000.0,
            mie_scale_height: 1200.0,
            rayleigh_scattering: [5.802e-6, 13.558e-6, 33.1e-6],
            mie_scattering: 3.996e-6,
            ozone_absorption: [0.650e-6, 1.881e-6, 0.085e-6],
            mie_anisotropy: 0.8,
            sun_intensity: 20.0,
        }
    }

    /// `sqrt(Ra² - Rp²)`: length of a ray grazing the ground up to the top
    /// of the atmosphere.
    #[must_use]
    pub fn horizon_distance(&self) -> f32 {
        (self.atmosphere_radius * self.atmosphere_radius
            - self.planet_radius * self.planet_radius)
            .max(0.0)
            .sqrt()
    }

    /// Extinction per meter at `altitude`: Rayleigh, Mie and the ozone tent.
    #[must_use]
    pub fn extinction(&self, altitude: f32) -> Vec3 {
        let rayleigh = Vec3::from(self.rayleigh_scattering)
            * (-altitude / self.rayleigh_scale_height).exp();
        let mie = Vec3::splat(self.mie_scattering * (-altitude / self.mie_scale_height).exp());
        let x = (altitude - OZONE_CENTER) / OZONE_HALF_WIDTH;
        let ozone = Vec3::from(self.ozone_absorption) * (1.0 - x * x).max(0.0);
        rayleigh + mie + ozone
    }

    /// Uniform block for the LUT and sky shaders.
    #[must_use]
    pub fn uniform(&self, planet_center: Vec3, spherical: bool, lut_size: [u32; 2]) -> AtmosphereUniform {
        AtmosphereUniform {
            rayleigh_scattering: self.rayleigh_scattering,
            planet_radius: self.planet_radius,
            ozone_absorption: self.ozone_absorption,
            atmosphere_radius: self.atmosphere_radius,
            planet_center: planet_center.to_array(),
            rayleigh_scale_height: self.rayleigh_scale_height,
            mie_scattering: self.mie_scattering,
            mie_scale_height: self.mie_scale_height,
            mie_anisotropy: self.mie_anisotropy,
            sun_intensity: self.sun_intensity,
            lut_size: [lut_size[0] as f32, lut_size[1] as f32],
            spherical: u32::from(spherical),
            _pad: 0,
        }
    }
}

/// GPU layout of `AtmosphereParams` in `atmosphere_common.wgsl`.
///
/// `vec3<f32>` members are 16-byte aligned; each is followed by a scalar
/// that fills its fourth lane.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct AtmosphereUniform {
    /// (offset 0)
    pub rayleigh_scattering: [f32; 3],
    /// (offset 12)
    pub planet_radius: f32,
    /// (offset 16)
    pub ozone_absorption: [f32; 3],
    /// (offset 28)
    pub atmosphere_radius: f32,
    /// (offset 32)
    pub planet_center: [f32; 3],
    /// (offset 44)
    pub rayleigh_scale_height: f32,
    /// (offset 48)
    pub mie_scattering: f32,
    pub mie_scale_height: f32,
    pub mie_anisotropy: f32,
    pub sun_intensity: f32,
    /// Output texture size in texels. (offset 64)
    pub lut_size: [f32; 2],
    /// 1 when altitudes are measured from `planet_center`, 0 for `y`. (offset 72)
    pub spherical: u32,
    pub _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<AtmosphereUniform>(), 80);

/// Ray-sphere intersection returning `(t_near, t_far)`, or `(-1, -1)` on miss.
#[must_use]
pub fn ray_sphere_intersect_f32(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> (f32, f32) {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.dot(oc) - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return (-1.0, -1.0);
    }
    let sqrt_disc = disc.sqrt();
    (-b - sqrt_disc, -b + sqrt_disc)
}

#[must_use]
pub fn rayleigh_phase(cos_angle: f32) -> f32 {
    3.0 / (16.0 * PI) * (1.0 + cos_angle * cos_angle)
}

/// Cornette-Shanks phase function.
#[must_use]
pub fn mie_phase(cos_angle: f32, g: f32) -> f32 {
    let g2 = g * g;
    let num = 3.0 * (1.0 - g2) * (1.0 + cos_angle * cos_angle);
    let denom = 8.0 * PI * (2.0 + g2) * (1.0 + g2 - 2.0 * g * cos_angle).max(1e-6).powf(1.5);
    num / denom
}

/// Reinhard tonemap `c / (c + 1)` per channel.
#[must_use]
pub fn tonemap(c: Vec3) -> Vec3 {
    c / (c + Vec3::ONE)
}
