//! View-frustum tests against planes extracted from a view-projection matrix.
//!
//! Chunks are tested as AABBs, feature instances as spheres. The WGSL
//! feature shader performs the same sphere test in clip space.

use glam::{Mat4, Vec3, Vec4};

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }
}

/// Six inward-facing planes: left, right, bottom, top, and the two depth
/// planes `z >= 0` and `z <= w`.
///
/// Depth planes are the same set for standard and reverse-Z projections in
/// a `[0, 1]` depth range. With an infinite reverse-Z projection the far
/// plane degenerates and is skipped.
#[derive(Clone, Debug)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract planes with the Griggs-Hartmann method.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);

        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 1e-12 {
                *plane /= len;
            } else {
                // Degenerate plane: accept everything.
                *plane = Vec4::new(0.0, 0.0, 0.0, 1.0);
            }
        }
        Self { planes }
    }

    /// Conservative AABB test (p-vertex method).
    pub fn is_visible(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let n = plane.truncate();
            let p = Vec3::select(n.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            n.dot(p) + plane.w >= 0.0
        })
    }

    /// True when a sphere touches the frustum.
    pub fn sphere_visible(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }
}
