//! Aerial perspective: the CPU twin of `aerial_perspective.wgsl`.

use glam::Vec3;

use super::params::{AtmosphereParams, mie_phase, rayleigh_phase};

/// Distance at which aerial perspective is fully applied.
pub const AP_FULL_BLEND_DISTANCE: f32 = 50_000.0;

/// Transmittance and in-scattered light between camera and a surface point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApResult {
    pub transmittance: Vec3,
    pub inscatter: Vec3,
}

impl ApResult {
    pub const CLEAR: Self = Self {
        transmittance: Vec3::ONE,
        inscatter: Vec3::ZERO,
    };

    #[must_use]
    pub fn mean_transmittance(&self) -> f32 {
        (self.transmittance.x + self.transmittance.y + self.transmittance.z) / 3.0
    }
}

/// How altitude is measured for the aerial segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AltitudeFrame {
    /// Flat world: altitude is `y`.
    Planar,
    /// Altitude is the distance from `center` minus the planet radius.
    Spherical { center: Vec3 },
}

impl AltitudeFrame {
    #[must_use]
    pub fn altitude(&self, params: &AtmosphereParams, p: Vec3) -> f32 {
        match self {
            AltitudeFrame::Planar => p.y,
            AltitudeFrame::Spherical { center } => (p - *center).length() - params.planet_radius,
        }
    }

    #[must_use]
    pub fn up(&self, p: Vec3) -> Vec3 {
        match self {
            AltitudeFrame::Planar => Vec3::Y,
            AltitudeFrame::Spherical { center } => (p - *center).try_normalize().unwrap_or(Vec3::Y),
        }
    }
}

/// Single-segment aerial perspective at the mean altitude of the camera and
/// the surface point.
#[must_use]
pub fn ap_compute_simple(
    world_pos: Vec3,
    camera_pos: Vec3,
    sun_dir: Vec3,
    params: &AtmosphereParams,
    frame: AltitudeFrame,
) -> ApResult {
    let offset = world_pos - camera_pos;
    let distance = offset.length();
    if distance <= 0.0 {
        return ApResult::CLEAR;
    }
    let view_dir = offset / distance;
    let avg_alt = (0.5 * (frame.altitude(params, camera_pos) + frame.altitude(params, world_pos))).max(0.0);
    let scat_r = Vec3::from(params.rayleigh_scattering) * (-avg_alt / params.rayleigh_scale_height).exp();
    let scat_m = params.mie_scattering * (-avg_alt / params.mie_scale_height).exp();
    let extinction = params.extinction(avg_alt).max(Vec3::splat(1e-12));
    let depth = extinction * distance;
    let transmittance = Vec3::new((-depth.x).exp(), (-depth.y).exp(), (-depth.z).exp());

    let mu = view_dir.dot(sun_dir);
    let sun_up = frame.up(world_pos).dot(sun_dir);
    let sun_light = params.sun_intensity * smoothstep(-0.1, 0.1, sun_up);
    let scatter = scat_r * rayleigh_phase(mu) + Vec3::splat(scat_m * mie_phase(mu, params.mie_anisotropy));

    ApResult {
        transmittance,
        inscatter: scatter / extinction * (Vec3::ONE - transmittance) * sun_light,
    }
}

/// `clamp(distance / 50 000, 0, 1)`.
#[must_use]
pub fn ap_blend(distance: f32) -> f32 {
    (distance / AP_FULL_BLEND_DISTANCE).clamp(0.0, 1.0)
}

#[must_use]
pub fn ap_apply_with_blend(color: Vec3, result: &ApResult, blend: f32) -> Vec3 {
    let fogged = color * result.transmittance + result.inscatter;
    color.lerp(fogged, blend)
}

pub(crate) fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}
