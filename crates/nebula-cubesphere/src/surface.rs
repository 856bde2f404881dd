//! Face-local meter coordinates on a planet of a given radius.
//!
//! Terrain is generated and streamed in face-local meters `(x, y)`; a face
//! spans `[0, face_size_m)` on both axes, where `face_size_m` is a quarter
//! of the great circle.

use std::f64::consts::FRAC_PI_2;

use glam::DVec3;

use crate::{CubeFace, FaceCoord, face_coord_to_sphere, sphere_to_face_coord};

/// A point on a cube face expressed in face-local meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FacePoint {
    pub face: CubeFace,
    pub x_m: f64,
    pub y_m: f64,
}

/// Sphere of a fixed radius with face-local meter parameterisation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlanetSurface {
    pub radius_m: f64,
}

impl PlanetSurface {
    #[must_use]
    pub fn new(radius_m: f64) -> Self {
        Self { radius_m }
    }

    /// Side length of one face in face-local meters.
    #[must_use]
    pub fn face_size_m(&self) -> f64 {
        self.radius_m * FRAC_PI_2
    }

    /// Unit direction for a face-local point.
    #[must_use]
    pub fn direction(&self, p: &FacePoint) -> DVec3 {
        let size = self.face_size_m();
        face_coord_to_sphere(&FaceCoord::new(p.face, p.x_m / size, p.y_m / size))
    }

    /// World-space position on the sphere surface (altitude zero).
    #[must_use]
    pub fn to_world(&self, p: &FacePoint) -> DVec3 {
        self.direction(p) * self.radius_m
    }

    /// Project a world position onto the surface and express it in
    /// face-local meters.
    #[must_use]
    pub fn to_face_point(&self, world: DVec3) -> FacePoint {
        let fc = sphere_to_face_coord(world);
        let size = self.face_size_m();
        FacePoint {
            face: fc.face,
            x_m: fc.u * size,
            y_m: fc.v * size,
        }
    }

    /// Great-circle distance between the surface projections of two points.
    #[must_use]
    pub fn arc_distance(&self, a: DVec3, b: DVec3) -> f64 {
        let cos = a.normalize_or_zero().dot(b.normalize_or_zero()).clamp(-1.0, 1.0);
        cos.acos() * self.radius_m
    }

    /// Height of a world position above the surface.
    #[must_use]
    pub fn altitude(&self, world: DVec3) -> f64 {
        world.length() - self.radius_m
    }
}
