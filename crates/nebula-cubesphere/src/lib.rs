//! Cube-sphere geometry: face bases, face-local meters, and the cube-to-sphere
//! mapping shared by terrain generation, streaming, and shaders.

mod cube_face;
mod face_coord;
mod projection;
mod surface;

pub use cube_face::CubeFace;
pub use face_coord::FaceCoord;
pub use projection::{
    cube_to_sphere, direction_to_face, face_coord_to_cube_point, face_coord_to_sphere,
    face_uv_to_sphere_f32, sphere_to_face_coord,
};
pub use surface::{FacePoint, PlanetSurface};
