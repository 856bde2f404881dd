//! The six faces of a cubesphere and their basis vectors.

use glam::{DVec3, Vec3};
use serde::{Deserialize, Serialize};

/// The six faces of the cube that forms the cubesphere.
///
/// Each variant corresponds to a face whose outward normal points
/// along the named axis direction. The discriminant is the face index
/// written into GPU uniforms (`-1` is reserved for planar mode).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CubeFace {
    /// +X face
    PosX = 0,
    /// −X face
    NegX = 1,
    /// +Y face
    PosY = 2,
    /// −Y face
    NegY = 3,
    /// +Z face
    PosZ = 4,
    /// −Z face
    NegZ = 5,
}

impl CubeFace {
    /// All six faces in canonical order.
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PosX,
        CubeFace::NegX,
        CubeFace::PosY,
        CubeFace::NegY,
        CubeFace::PosZ,
        CubeFace::NegZ,
    ];

    /// Index used in shader uniforms.
    #[must_use]
    pub fn index(self) -> i32 {
        self as i32
    }

    /// Inverse of [`CubeFace::index`]. Returns `None` for planar (`-1`) or
    /// out-of-range values.
    #[must_use]
    pub fn from_index(index: i32) -> Option<CubeFace> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// The opposite face (e.g., `PosX` → `NegX`).
    #[must_use]
    pub fn opposite(self) -> CubeFace {
        match self {
            CubeFace::PosX => CubeFace::NegX,
            CubeFace::NegX => CubeFace::PosX,
            CubeFace::PosY => CubeFace::NegY,
            CubeFace::NegY => CubeFace::PosY,
            CubeFace::PosZ => CubeFace::NegZ,
            CubeFace::NegZ => CubeFace::PosZ,
        }
    }

    /// Outward-pointing unit normal for this face.
    #[must_use]
    pub fn normal(self) -> DVec3 {
        match self {
            CubeFace::PosX => DVec3::X,
            CubeFace::NegX => DVec3::NEG_X,
            CubeFace::PosY => DVec3::Y,
            CubeFace::NegY => DVec3::NEG_Y,
            CubeFace::PosZ => DVec3::Z,
            CubeFace::NegZ => DVec3::NEG_Z,
        }
    }

    /// Tangent vector: direction of increasing `u` on this face.
    #[must_use]
    pub fn tangent(self) -> DVec3 {
        match self {
            CubeFace::PosX => DVec3::NEG_Z,
            CubeFace::NegX => DVec3::Z,
            CubeFace::PosY => DVec3::X,
            CubeFace::NegY => DVec3::X,
            CubeFace::PosZ => DVec3::X,
            CubeFace::NegZ => DVec3::NEG_X,
        }
    }

    /// Bitangent vector: direction of increasing `v` on this face.
    #[must_use]
    pub fn bitangent(self) -> DVec3 {
        match self {
            CubeFace::PosX => DVec3::Y,
            CubeFace::NegX => DVec3::Y,
            CubeFace::PosY => DVec3::NEG_Z,
            CubeFace::NegY => DVec3::Z,
            CubeFace::PosZ => DVec3::Y,
            CubeFace::NegZ => DVec3::Y,
        }
    }

    /// Single-precision `(normal, tangent, bitangent)`, as laid out in
    /// the WGSL `face_basis` lookup.
    #[must_use]
    pub fn basis_f32(self) -> (Vec3, Vec3, Vec3) {
        (
            self.normal().as_vec3(),
            self.tangent().as_vec3(),
            self.bitangent().as_vec3(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Indices round-trip and planar/out-of-range indices map to `None`.
    #[test]
    fn test_index_round_trip() {
        for face in CubeFace::ALL {
            assert_eq!(CubeFace::from_index(face.index()), Some(face));
        }
        assert_eq!(CubeFace::from_index(-1), None);
        assert_eq!(CubeFace::from_index(6), None);
    }

    /// The basis of every face is right-handed: tangent × bitangent = normal.
    #[test]
    fn test_tangent_cross_bitangent_equals_normal() {
        for face in CubeFace::ALL {
            let cross = face.tangent().cross(face.bitangent());
            assert!(
                (cross - face.normal()).length() < 1e-12,
                "tangent x bitangent != normal for {face:?}: got {cross:?}"
            );
        }
    }

    /// Opposite faces have antiparallel normals.
    #[test]
    fn test_opposite_face_normals_are_antiparallel() {
        for face in CubeFace::ALL {
            let n = face.normal();
            let opp = face.opposite().normal();
            assert!((n + opp).length() < 1e-12, "{face:?} not antiparallel");
            assert_eq!(face.opposite().opposite(), face);
        }
    }
}
