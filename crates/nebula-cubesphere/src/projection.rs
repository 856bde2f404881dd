//! Cube-to-sphere mapping and its inverse.
//!
//! The forward mapping spreads each face over the sphere with near-uniform
//! cell area:
//!
//! ```text
//! sx = x * sqrt(1 - y²/2 - z²/2 + y²z²/3)
//! sy = y * sqrt(1 - x²/2 - z²/2 + x²z²/3)
//! sz = z * sqrt(1 - x²/2 - y²/2 + x²y²/3)
//! ```
//!
//! [`face_uv_to_sphere_f32`] is the single-precision twin of the WGSL
//! `cube_to_sphere` helper used by the atlas generator.

use glam::{DVec3, Vec3};

use crate::{CubeFace, FaceCoord};

/// Point on the surface of the `[-1, 1]` cube for a face coordinate.
#[inline]
#[must_use]
pub fn face_coord_to_cube_point(fc: &FaceCoord) -> DVec3 {
    let (s, t) = fc.signed();
    fc.face.normal() + s * fc.face.tangent() + t * fc.face.bitangent()
}

/// Map a cube-surface point onto the unit sphere.
#[inline]
#[must_use]
pub fn cube_to_sphere(p: DVec3) -> DVec3 {
    let (x2, y2, z2) = (p.x * p.x, p.y * p.y, p.z * p.z);
    DVec3::new(
        p.x * (1.0 - 0.5 * (y2 + z2) + y2 * z2 / 3.0).sqrt(),
        p.y * (1.0 - 0.5 * (x2 + z2) + x2 * z2 / 3.0).sqrt(),
        p.z * (1.0 - 0.5 * (x2 + y2) + x2 * y2 / 3.0).sqrt(),
    )
}

/// [`FaceCoord`] → unit sphere.
#[inline]
#[must_use]
pub fn face_coord_to_sphere(fc: &FaceCoord) -> DVec3 {
    cube_to_sphere(face_coord_to_cube_point(fc))
}

/// Single-precision forward mapping, evaluated exactly as the shaders do.
#[must_use]
pub fn face_uv_to_sphere_f32(face: CubeFace, u: f32, v: f32) -> Vec3 {
    let (n, t, b) = face.basis_f32();
    let p = n + t * (2.0 * u - 1.0) + b * (2.0 * v - 1.0);
    let p2 = p * p;
    Vec3::new(
        p.x * (1.0 - 0.5 * (p2.y + p2.z) + p2.y * p2.z / 3.0).sqrt(),
        p.y * (1.0 - 0.5 * (p2.x + p2.z) + p2.x * p2.z / 3.0).sqrt(),
        p.z * (1.0 - 0.5 * (p2.x + p2.y) + p2.x * p2.y / 3.0).sqrt(),
    )
}

/// Which cube face a direction belongs to (largest absolute component).
///
/// Ties resolve X before Y before Z, positive before negative.
#[must_use]
pub fn direction_to_face(dir: DVec3) -> CubeFace {
    let a = dir.abs();
    if a.x >= a.y && a.x >= a.z {
        if dir.x >= 0.0 { CubeFace::PosX } else { CubeFace::NegX }
    } else if a.y >= a.z {
        if dir.y >= 0.0 { CubeFace::PosY } else { CubeFace::NegY }
    } else if dir.z >= 0.0 {
        CubeFace::PosZ
    } else {
        CubeFace::NegZ
    }
}

/// Inverse of [`face_coord_to_sphere`].
///
/// Starts from the gnomonic projection of `dir` onto the face plane and
/// refines with Gauss-Newton steps on the forward mapping.
#[must_use]
pub fn sphere_to_face_coord(dir: DVec3) -> FaceCoord {
    let face = direction_to_face(dir);
    let n = face.normal();
    let d = dir.dot(n);
    if d.abs() < 1e-30 {
        return FaceCoord::new(face, 0.5, 0.5);
    }
    let target = dir.normalize();
    let plane = dir / d;
    let mut u = (plane.dot(face.tangent()) + 1.0) * 0.5;
    let mut v = (plane.dot(face.bitangent()) + 1.0) * 0.5;

    const H: f64 = 1e-7;
    for _ in 0..12 {
        let current = face_coord_to_sphere(&FaceCoord { face, u, v });
        let err = target - current;
        if err.length_squared() < 1e-28 {
            break;
        }
        let du = (face_coord_to_sphere(&FaceCoord { face, u: u + H, v }) - current) / H;
        let dv = (face_coord_to_sphere(&FaceCoord { face, u, v: v + H }) - current) / H;
        let (a11, a12, a22) = (du.dot(du), du.dot(dv), dv.dot(dv));
        let det = a11 * a22 - a12 * a12;
        if det.abs() < 1e-20 {
            break;
        }
        let (b1, b2) = (du.dot(err), dv.dot(err));
        u = (u + (a22 * b1 - a12 * b2) / det).clamp(0.0, 1.0);
        v = (v + (a11 * b2 - a12 * b1) / det).clamp(0.0, 1.0);
    }
    FaceCoord::new(face, u, v)
}
