//! CPU reference of the terrain field.
//!
//! [`TerrainSampler`] evaluates the same height, biome and tile functions as
//! the compute shaders, in the same order and in single precision. It backs
//! atlas generation on backends without compute, fills chunk rims beyond an
//! atlas edge, and is what the tests check invariants against.

use glam::{Vec2, Vec3};
use nebula_config::TerrainConfig;
use nebula_cubesphere::{CubeFace, face_uv_to_sphere_f32};

use crate::hash::{hash13, seed_offset};
use crate::noise::{fbm3, mix, ridged_fbm3, smoothstep};

/// Height below which a texel is water, in meters.
pub const WATER_LEVEL: f32 = 8.0;

/// Share of vegetated texels promoted to feature-placement tiles.
pub const FEATURE_TILE_CHANCE: f32 = 0.6;

/// Offset added to a biome id to mark a feature-placement tile.
pub const FEATURE_TILE_BASE: u32 = 100;

/// Biome tile ids stored in the tile atlas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Biome {
    Water = 0,
    Beach = 1,
    Grass = 2,
    Forest = 3,
    Meadow = 4,
    Rock = 5,
    Tundra = 6,
    Snow = 7,
    Desert = 8,
}

impl Biome {
    pub const COUNT: usize = 9;

    #[must_use]
    pub fn from_id(id: u32) -> Option<Biome> {
        Some(match id {
            0 => Biome::Water,
            1 => Biome::Beach,
            2 => Biome::Grass,
            3 => Biome::Forest,
            4 => Biome::Meadow,
            5 => Biome::Rock,
            6 => Biome::Tundra,
            7 => Biome::Snow,
            8 => Biome::Desert,
            _ => return None,
        })
    }

    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Biomes that can host streamed features.
    #[must_use]
    pub fn is_vegetated(self) -> bool {
        matches!(self, Biome::Grass | Biome::Forest | Biome::Meadow)
    }
}

/// Strip the feature marker from a tile id.
#[inline]
#[must_use]
pub fn base_tile(tile: u32) -> u32 {
    tile % FEATURE_TILE_BASE
}

/// Whether a tile id marks a feature-placement texel.
#[inline]
#[must_use]
pub fn is_feature_tile(tile: u32) -> bool {
    tile >= FEATURE_TILE_BASE
}

/// How face-local meters map into the noise domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TerrainDomain {
    /// `(x, y, 0) · world_scale`.
    Planar { world_scale: f32 },
    /// Cube-sphere direction scaled by the planet radius.
    Spherical { radius: f32 },
}

/// Seed and noise scales of one world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainParams {
    pub seed: i32,
    pub elevation_scale: f32,
    pub height_scale: f32,
    pub biome_scale: f32,
    pub region_scale: f32,
    pub detail_scale: f32,
    pub ridge_scale: f32,
    pub valley_scale: f32,
    pub plateau_scale: f32,
    pub domain: TerrainDomain,
}

impl TerrainParams {
    /// Planar parameters from the terrain config section.
    #[must_use]
    pub fn planar(seed: i32, cfg: &TerrainConfig) -> Self {
        Self::with_domain(
            seed,
            cfg,
            TerrainDomain::Planar {
                world_scale: cfg.world_scale,
            },
        )
    }

    /// Spherical parameters for a planet of `radius` meters.
    #[must_use]
    pub fn spherical(seed: i32, cfg: &TerrainConfig, radius: f32) -> Self {
        Self::with_domain(seed, cfg, TerrainDomain::Spherical { radius })
    }

    fn with_domain(seed: i32, cfg: &TerrainConfig, domain: TerrainDomain) -> Self {
        Self {
            seed,
            elevation_scale: cfg.elevation_scale,
            height_scale: cfg.height_scale,
            biome_scale: cfg.biome_scale,
            region_scale: cfg.region_scale,
            detail_scale: cfg.detail_scale,
            ridge_scale: cfg.ridge_scale,
            valley_scale: cfg.valley_scale,
            plateau_scale: cfg.plateau_scale,
            domain,
        }
    }

    /// The uniform `worldScale`: the planar multiplier, or the planet radius
    /// in spherical mode.
    #[must_use]
    pub fn world_scale(&self) -> f32 {
        match self.domain {
            TerrainDomain::Planar { world_scale } => world_scale,
            TerrainDomain::Spherical { radius } => radius,
        }
    }
}

/// Every field the atlas kinds derive from one world position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TerrainSample {
    /// Meters above the datum.
    pub height: f32,
    /// Large-scale climate mask in `[0, 1]`.
    pub biome: f32,
    /// Regional moisture in `[0, 1]`.
    pub moisture: f32,
    /// Ridge strength in `[0, 1]`.
    pub rock: f32,
}

/// Evaluates the terrain field on the CPU.
#[derive(Clone, Debug)]
pub struct TerrainSampler {
    params: TerrainParams,
    offset: Vec3,
}

impl TerrainSampler {
    #[must_use]
    pub fn new(params: TerrainParams) -> Self {
        let [ox, oy] = seed_offset(params.seed);
        Self {
            params,
            offset: Vec3::new(ox, oy, 0.0),
        }
    }

    #[must_use]
    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    /// Noise-domain position of face-local meters `world`; `face` is ignored
    /// in planar mode.
    #[must_use]
    pub fn domain_point(&self, face: Option<CubeFace>, world: Vec2) -> Vec3 {
        match (self.params.domain, face) {
            (TerrainDomain::Spherical { radius }, Some(face)) => {
                let face_size = radius * std::f32::consts::FRAC_PI_2;
                let dir = face_uv_to_sphere_f32(face, world.x / face_size, world.y / face_size);
                dir * radius
            }
            (TerrainDomain::Planar { world_scale }, _) => {
                Vec3::new(world.x, world.y, 0.0) * world_scale
            }
            (TerrainDomain::Spherical { .. }, None) => Vec3::new(world.x, world.y, 0.0),
        }
    }

    /// Full terrain sample at a noise-domain point.
    #[must_use]
    pub fn sample_point(&self, p: Vec3) -> TerrainSample {
        let t = &self.params;
        let o = self.offset;

        let biome = fbm3(p * t.biome_scale + o, 4);
        let moisture = fbm3(p * t.region_scale + o + Vec3::new(17.3, 5.1, 2.9), 3);
        let base = fbm3(p * t.elevation_scale + o, 5);

        let plains = smoothstep(0.35, 0.65, 1.0 - biome);
        let mountain = smoothstep(0.55, 0.8, biome);

        let warp = Vec3::new(
            fbm3(p * t.ridge_scale + o + Vec3::new(5.2, 1.3, 0.0), 3),
            fbm3(p * t.ridge_scale + o + Vec3::new(1.7, 9.2, 0.0), 3),
            0.0,
        ) * 2.0
            - Vec3::new(1.0, 1.0, 0.0);
        let ridged = ridged_fbm3((p + warp * 400.0) * t.ridge_scale + o, 4);
        let valley = fbm3(p * t.valley_scale + o + Vec3::new(9.1, 3.7, 0.0), 3);
        let plateau = smoothstep(0.6, 0.7, fbm3(p * t.plateau_scale + o + Vec3::new(3.3, 7.9, 0.0), 3));
        let detail = fbm3(p * t.detail_scale + o + Vec3::new(11.0, 4.4, 0.0), 3) - 0.5;
        let roughness = mix(0.3, 1.0, moisture);

        let mut h = (base - 0.4) * t.height_scale;
        h = mix(h, h * 0.4, plains);
        h += mountain * ridged * t.height_scale * 2.5;
        h -= smoothstep(0.6, 0.9, valley) * t.height_scale * 0.3;
        h += plateau * t.height_scale * 0.3;
        h += detail * 4.0 * roughness;

        TerrainSample {
            height: h,
            biome,
            moisture,
            rock: mountain * ridged,
        }
    }

    #[must_use]
    pub fn sample(&self, face: Option<CubeFace>, world: Vec2) -> TerrainSample {
        self.sample_point(self.domain_point(face, world))
    }

    #[must_use]
    pub fn height(&self, face: Option<CubeFace>, world: Vec2) -> f32 {
        self.sample(face, world).height
    }

    /// Tile id of a sample at noise-domain point `p`.
    #[must_use]
    pub fn classify(&self, s: &TerrainSample, p: Vec3) -> u32 {
        let t = &self.params;
        let biome = if s.height < WATER_LEVEL {
            Biome::Water
        } else if s.height < WATER_LEVEL + 2.0 {
            Biome::Beach
        } else if s.height > t.height_scale * 2.2 {
            Biome::Snow
        } else if s.height > t.height_scale * 1.6 || s.rock > 0.5 {
            Biome::Rock
        } else if s.biome > 0.7 && s.height > t.height_scale * 0.8 {
            Biome::Tundra
        } else if s.biome < 0.3 {
            Biome::Desert
        } else if s.moisture > 0.62 {
            Biome::Forest
        } else if s.moisture < 0.4 {
            Biome::Meadow
        } else {
            Biome::Grass
        };
        if biome.is_vegetated() {
            let cell = p.floor() + self.offset;
            if hash13(cell.x, cell.y, cell.z) < FEATURE_TILE_CHANCE {
                return FEATURE_TILE_BASE + biome.id();
            }
        }
        biome.id()
    }

    /// Tile id at face-local meters.
    #[must_use]
    pub fn tile(&self, face: Option<CubeFace>, world: Vec2) -> u32 {
        let p = self.domain_point(face, world);
        let s = self.sample_point(p);
        self.classify(&s, p)
    }

    /// Low-frequency macro mask: `(signal, moisture, biome, 1)`.
    #[must_use]
    pub fn macro_mask(&self, s: &TerrainSample, p: Vec3) -> [f32; 4] {
        let t = &self.params;
        let signal = fbm3(p * (t.biome_scale * 4.0) + self.offset + Vec3::new(2.3, 6.1, 0.0), 3);
        [signal, s.moisture, s.biome, 1.0]
    }
}

/// Unit normal from central differences of four neighbouring heights,
/// `spacing` meters apart. `+Y` is up; face-local `x` maps to `X` and `y`
/// to `Z`.
#[must_use]
pub fn central_difference_normal(left: f32, right: f32, down: f32, up: f32, spacing: f32) -> Vec3 {
    Vec3::new(left - right, 2.0 * spacing, down - up).normalize()
}

/// Encode a unit normal into `[0, 1]` RGB.
#[must_use]
pub fn encode_normal(n: Vec3) -> [f32; 4] {
    [n.x * 0.5 + 0.5, n.y * 0.5 + 0.5, n.z * 0.5 + 0.5, 1.0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler(seed: i32) -> TerrainSampler {
        TerrainSampler::new(TerrainParams::planar(seed, &TerrainConfig::default()))
    }

    /// The same inputs give bit-identical heights.
    #[test]
    fn test_height_deterministic() {
        let a = sampler(42);
        let b = sampler(42);
        for i in 0..200 {
            let w = Vec2::new(i as f32 * 37.5, i as f32 * -11.25);
            assert_eq!(a.height(None, w).to_bits(), b.height(None, w).to_bits());
        }
    }

    /// Different seeds give different worlds.
    #[test]
    fn test_seed_changes_terrain() {
        let a = sampler(1);
        let b = sampler(2);
        let differing = (0..100)
            .filter(|i| {
                let w = Vec2::new(*i as f32 * 61.0, 500.0);
                a.height(None, w) != b.height(None, w)
            })
            .count();
        assert!(differing > 90);
    }

    /// Tile ids are always a biome or a feature-marked vegetated biome.
    #[test]
    fn test_tile_ids_in_range() {
        let s = sampler(7);
        let mut seen_feature = false;
        for i in 0..60 {
            for j in 0..60 {
                let tile = s.tile(None, Vec2::new(i as f32 * 53.0, j as f32 * 47.0));
                let base = Biome::from_id(base_tile(tile));
                assert!(base.is_some(), "tile {tile}");
                if is_feature_tile(tile) {
                    seen_feature = true;
                    assert!(base.is_some_and(Biome::is_vegetated), "tile {tile}");
                    assert!(tile <= FEATURE_TILE_BASE + Biome::Desert.id());
                }
            }
        }
        assert!(seen_feature);
    }

    /// Spherical sampling agrees along an edge shared by two faces.
    #[test]
    fn test_spherical_face_edge_continuity() {
        let radius = 50_000.0;
        let s = TerrainSampler::new(TerrainParams::spherical(
            3,
            &TerrainConfig::default(),
            radius,
        ));
        let face_size = radius * std::f32::consts::FRAC_PI_2;
        // u = 1 on +X meets the matching edge of +Y at the same direction.
        for k in 0..10 {
            let v = 0.05 + k as f32 * 0.09;
            let a = s.domain_point(Some(CubeFace::PosX), Vec2::new(face_size, v * face_size));
            let dir = a.normalize();
            let fp = nebula_cubesphere::sphere_to_face_coord(dir.as_dvec3());
            let b = s.domain_point(
                Some(fp.face),
                Vec2::new(fp.u as f32 * face_size, fp.v as f32 * face_size),
            );
            assert!((a - b).length() < 1.0, "edge points {a} vs {b}");
        }
    }

    /// Flat ground points straight up.
    #[test]
    fn test_flat_normal_is_up() {
        let n = central_difference_normal(5.0, 5.0, 5.0, 5.0, 1.0);
        assert_eq!(n, Vec3::Y);
        assert_eq!(encode_normal(n), [0.5, 1.0, 0.5, 1.0]);
    }
}
