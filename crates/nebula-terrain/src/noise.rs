//! Value noise and fractal sums over [`hash13`].
//!
//! Mirrors `value_noise3`, `fbm3` and `ridged_fbm3` in
//! `terrain_common.wgsl`. Octaves are offset by a fixed shift rather than
//! rotated so the CPU and GPU evaluate the same sequence of operations.

use glam::Vec3;

use crate::hash::hash13;

/// Per-octave domain shift.
pub const OCTAVE_SHIFT: Vec3 = Vec3::new(37.1, 17.7, 23.3);

#[inline]
#[must_use]
pub fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// WGSL `smoothstep`.
#[inline]
#[must_use]
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Trilinear value noise with smoothstep fade, in `[0, 1)`.
#[must_use]
pub fn value_noise3(p: Vec3) -> f32 {
    let i = p.floor();
    let f = p - i;
    let u = f * f * (Vec3::splat(3.0) - 2.0 * f);

    let corner = |dx: f32, dy: f32, dz: f32| hash13(i.x + dx, i.y + dy, i.z + dz);
    let x00 = mix(corner(0.0, 0.0, 0.0), corner(1.0, 0.0, 0.0), u.x);
    let x10 = mix(corner(0.0, 1.0, 0.0), corner(1.0, 1.0, 0.0), u.x);
    let x01 = mix(corner(0.0, 0.0, 1.0), corner(1.0, 0.0, 1.0), u.x);
    let x11 = mix(corner(0.0, 1.0, 1.0), corner(1.0, 1.0, 1.0), u.x);
    mix(mix(x00, x10, u.y), mix(x01, x11, u.y), u.z)
}

/// Normalised fractal sum of `octaves` value-noise layers, in `[0, 1)`.
#[must_use]
pub fn fbm3(p: Vec3, octaves: u32) -> f32 {
    let mut sum = 0.0;
    let mut amp = 0.5;
    let mut norm = 0.0;
    let mut q = p;
    for _ in 0..octaves {
        sum += amp * value_noise3(q);
        norm += amp;
        q = q * 2.0 + OCTAVE_SHIFT;
        amp *= 0.5;
    }
    sum / norm
}

/// Ridged fractal: sharp crests where the noise crosses one half.
#[must_use]
pub fn ridged_fbm3(p: Vec3, octaves: u32) -> f32 {
    let mut sum = 0.0;
    let mut amp = 0.5;
    let mut norm = 0.0;
    let mut q = p;
    for _ in 0..octaves {
        let r = 1.0 - (value_noise3(q) * 2.0 - 1.0).abs();
        sum += amp * r * r;
        norm += amp;
        q = q * 2.0 + OCTAVE_SHIFT;
        amp *= 0.5;
    }
    sum / norm
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Noise is continuous: tiny steps give tiny changes.
    #[test]
    fn test_value_noise_continuity() {
        let mut p = Vec3::new(3.2, -1.7, 0.0);
        let mut prev = value_noise3(p);
        for _ in 0..500 {
            p.x += 0.002;
            let next = value_noise3(p);
            assert!((next - prev).abs() < 0.02, "jump {prev} -> {next} at {p}");
            prev = next;
        }
    }

    /// Lattice points return the hash itself.
    #[test]
    fn test_value_noise_at_lattice() {
        let v = value_noise3(Vec3::new(4.0, 9.0, 0.0));
        assert_eq!(v, hash13(4.0, 9.0, 0.0));
    }

    /// Fractal sums stay within the unit range.
    #[test]
    fn test_fbm_range() {
        for i in 0..400 {
            let p = Vec3::new(i as f32 * 0.37, i as f32 * -0.91, 1.5);
            let f = fbm3(p, 5);
            let r = ridged_fbm3(p, 4);
            assert!((0.0..=1.0).contains(&f), "fbm {f}");
            assert!((0.0..=1.0).contains(&r), "ridged {r}");
        }
    }

    #[test]
    fn test_smoothstep_edges() {
        assert_eq!(smoothstep(0.2, 0.8, 0.0), 0.0);
        assert_eq!(smoothstep(0.2, 0.8, 1.0), 1.0);
        assert_eq!(smoothstep(0.0, 1.0, 0.5), 0.5);
    }
}
