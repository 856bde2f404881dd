//! CPU atlas synthesis.
//!
//! Produces the same five images the compute passes write, texel for
//! texel, from a [`TerrainSampler`]. Heights are evaluated once on a grid
//! with a one-texel border so normals use the same neighbour positions as
//! the shader. The border's far row and column double as the height apron.

use glam::Vec2;
use nebula_lod::{AtlasKey, AtlasKind, LodAtlasConfig};

use crate::sampler::{TerrainSample, TerrainSampler, central_difference_normal, encode_normal};
use crate::splat::compute_splat;

/// The five atlas images of one slot, row-major RGBA. Height is
/// `size + 1` texels per side, the rest `size`.
#[derive(Clone, Debug, PartialEq)]
pub struct AtlasImages {
    pub size: u32,
    pub height: Vec<[f32; 4]>,
    pub normal: Vec<[f32; 4]>,
    pub tile: Vec<[f32; 4]>,
    pub macro_mask: Vec<[f32; 4]>,
    pub splat: Vec<[f32; 4]>,
}

impl AtlasImages {
    #[must_use]
    pub fn texels(&self, kind: AtlasKind) -> &[[f32; 4]] {
        match kind {
            AtlasKind::Height => &self.height,
            AtlasKind::Normal => &self.normal,
            AtlasKind::Tile => &self.tile,
            AtlasKind::Macro => &self.macro_mask,
            AtlasKind::Splat => &self.splat,
        }
    }

    /// Row length of `kind`'s image.
    #[must_use]
    pub fn side(&self, kind: AtlasKind) -> u32 {
        self.size + kind.apron()
    }

    /// Texel bytes in the atlas format of `kind`.
    #[must_use]
    pub fn encode(&self, kind: AtlasKind) -> Vec<u8> {
        encode_texels(self.texels(kind), kind)
    }
}

/// Convert RGBA texels to the byte layout of `kind`'s texture format.
#[must_use]
pub fn encode_texels(texels: &[[f32; 4]], kind: AtlasKind) -> Vec<u8> {
    match kind.format() {
        nebula_render::TextureFormat::Rgba16Float => {
            let halves: Vec<half::f16> = texels
                .iter()
                .flat_map(|t| t.map(half::f16::from_f32))
                .collect();
            bytemuck::cast_slice(&halves).to_vec()
        }
        _ => bytemuck::cast_slice(texels).to_vec(),
    }
}

/// Decode `Rgba32Float` texture bytes into texels.
#[must_use]
pub fn decode_rgba32f(bytes: &[u8]) -> Vec<[f32; 4]> {
    bytes
        .chunks_exact(16)
        .map(|c| {
            let mut t = [0.0f32; 4];
            for (i, v) in t.iter_mut().enumerate() {
                let mut b = [0u8; 4];
                b.copy_from_slice(&c[i * 4..i * 4 + 4]);
                *v = f32::from_le_bytes(b);
            }
            t
        })
        .collect()
}

/// Synthesize every kind for `key`.
#[must_use]
pub fn build_atlas_images(
    sampler: &TerrainSampler,
    cfg: &LodAtlasConfig,
    key: &AtlasKey,
    kernel_size: u32,
) -> AtlasImages {
    let size = cfg.texture_size(key.lod);
    let spacing = cfg.world_coverage() as f32 / size as f32;
    let bounds = cfg.atlas_world_bounds(key);
    let origin = Vec2::new(bounds.min_x as f32, bounds.min_y as f32);

    // (size + 2)² grid, index (i, j) is texel (i - 1, j - 1).
    let grid = size as usize + 2;
    let mut samples: Vec<TerrainSample> = Vec::with_capacity(grid * grid);
    let mut points = Vec::with_capacity(grid * grid);
    for j in 0..grid {
        for i in 0..grid {
            let tx = i as f32 - 1.0;
            let ty = j as f32 - 1.0;
            let world = Vec2::new(origin.x + tx * spacing, origin.y + ty * spacing);
            let p = sampler.domain_point(key.face, world);
            points.push(p);
            samples.push(sampler.sample_point(p));
        }
    }

    let n = (size * size) as usize;
    let apron_side = size as usize + 1;
    let height = (0..apron_side * apron_side)
        .map(|t| {
            let s = samples[(t / apron_side + 1) * grid + t % apron_side + 1];
            [s.height, s.biome, s.moisture, 1.0]
        })
        .collect();
    let mut normal = Vec::with_capacity(n);
    let mut tile = Vec::with_capacity(n);
    let mut macro_mask = Vec::with_capacity(n);
    let mut tile_ids = Vec::with_capacity(n);
    let mut heights = Vec::with_capacity(n);

    let at = |i: usize, j: usize| j * grid + i;
    for y in 0..size as usize {
        for x in 0..size as usize {
            let c = at(x + 1, y + 1);
            let s = samples[c];
            heights.push(s.height);

            let n = central_difference_normal(
                samples[at(x, y + 1)].height,
                samples[at(x + 2, y + 1)].height,
                samples[at(x + 1, y)].height,
                samples[at(x + 1, y + 2)].height,
                spacing,
            );
            normal.push(encode_normal(n));

            let id = sampler.classify(&s, points[c]);
            tile_ids.push(id);
            tile.push([id as f32 / 255.0, 0.0, 0.0, 1.0]);

            macro_mask.push(sampler.macro_mask(&s, points[c]));
        }
    }

    let splat = compute_splat(&tile_ids, &heights, size, kernel_size)
        .iter()
        .map(|t| t.encode())
        .collect();

    AtlasImages {
        size,
        height,
        normal,
        tile,
        macro_mask,
        splat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::TerrainParams;
    use crate::splat::{SplatTexel, decode_id};
    use nebula_config::TerrainConfig;

    fn small_cfg() -> LodAtlasConfig {
        LodAtlasConfig::new(256, 32, 128, 3, &[300.0, 900.0]).unwrap()
    }

    fn sampler() -> TerrainSampler {
        TerrainSampler::new(TerrainParams::planar(42, &TerrainConfig::default()))
    }

    /// Image texels match direct sampler evaluation at texel positions.
    #[test]
    fn test_images_match_sampler() {
        let cfg = small_cfg();
        let s = sampler();
        let key = AtlasKey::new(None, 1, -1, 0);
        let images = build_atlas_images(&s, &cfg, &key, 5);
        assert_eq!(images.size, 128);
        assert_eq!(images.side(AtlasKind::Height), 129);
        assert_eq!(images.height.len(), 129 * 129);
        for (x, y) in [(0u32, 0u32), (5, 90), (127, 127), (64, 3)] {
            let world = Vec2::new(256.0 + x as f32 * 2.0, -256.0 + y as f32 * 2.0);
            let h = (y * 129 + x) as usize;
            let t = (y * 128 + x) as usize;
            assert_eq!(images.height[h][0].to_bits(), s.height(None, world).to_bits());
            assert_eq!(decode_id(images.tile[t][0]), s.tile(None, world));
        }
    }

    /// The height apron repeats the first row and column of the next atlas.
    #[test]
    fn test_height_apron_matches_neighbours() {
        let cfg = small_cfg();
        let s = sampler();
        let here = build_atlas_images(&s, &cfg, &AtlasKey::new(None, 0, 0, 1), 5);
        let east = build_atlas_images(&s, &cfg, &AtlasKey::new(None, 1, 0, 1), 5);
        let north = build_atlas_images(&s, &cfg, &AtlasKey::new(None, 0, 1, 1), 5);
        let size = here.size as usize;
        let side = size + 1;
        for i in 0..side {
            let edge = here.height[i * side + size][0];
            let first = east.height[i * side][0];
            assert_eq!(edge.to_bits(), first.to_bits(), "east row {i}");
            let edge = here.height[size * side + i][0];
            let first = north.height[i][0];
            assert_eq!(edge.to_bits(), first.to_bits(), "north column {i}");
        }
    }

    /// Bilinear height lookup the terrain vertex shader performs, with
    /// texel `size` read from the apron.
    fn vertex_height(images: &AtlasImages, uv: Vec2) -> f32 {
        let side = images.side(AtlasKind::Height);
        let hi = (side - 1) as f32;
        let p = uv * images.size as f32;
        let i0 = p.floor();
        let f = p - i0;
        let load = |x: f32, y: f32| {
            let (x, y) = (x.clamp(0.0, hi) as u32, y.clamp(0.0, hi) as u32);
            images.height[(y * side + x) as usize][0]
        };
        let a = load(i0.x, i0.y);
        let b = load(i0.x + 1.0, i0.y);
        let c = load(i0.x, i0.y + 1.0);
        let d = load(i0.x + 1.0, i0.y + 1.0);
        let top = a + (b - a) * f.x;
        let bottom = c + (d - c) * f.x;
        top + (bottom - top) * f.y
    }

    /// Rim vertices of chunks on either side of an atlas boundary resolve
    /// to the same height.
    #[test]
    fn test_rim_vertices_agree_across_atlases() {
        let cfg = small_cfg();
        let s = sampler();
        for lod in 0..cfg.max_lod_levels() {
            let left = build_atlas_images(&s, &cfg, &AtlasKey::new(None, 0, 0, lod), 5);
            let right = build_atlas_images(&s, &cfg, &AtlasKey::new(None, 1, 0, lod), 5);
            let n = cfg.chunks_per_atlas() as i32;
            let last = cfg.uv_transform(n - 1, 0);
            let first = cfg.uv_transform(n, 0);
            for v in 0..=8 {
                let v = v as f32 / 8.0;
                let l = vertex_height(&left, Vec2::from(last.apply([1.0, v])));
                let r = vertex_height(&right, Vec2::from(first.apply([0.0, v])));
                assert_eq!(l.to_bits(), r.to_bits(), "lod {lod} v {v}");
            }
        }
    }

    /// Heights at shared world positions agree across every pair of LODs.
    #[test]
    fn test_height_equal_across_lods() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;
        use std::collections::HashMap;

        let cfg = LodAtlasConfig::new(256, 32, 256, 3, &[300.0, 900.0]).unwrap();
        let s = sampler();
        let lods: Vec<u8> = (0..cfg.max_lod_levels()).collect();
        let coarsest = cfg.texture_size(lods[lods.len() - 1]);
        let mut atlases: HashMap<AtlasKey, AtlasImages> = HashMap::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for _ in 0..1000 {
            let ax = rng.random_range(-1..=0);
            let ay = rng.random_range(-1..=0);
            // Shared positions are the coarsest grid points, apron included.
            let cx = rng.random_range(0..=coarsest);
            let cy = rng.random_range(0..=coarsest);
            let mut values = Vec::with_capacity(lods.len());
            for &lod in &lods {
                let key = AtlasKey::new(None, ax, ay, lod);
                let images = atlases
                    .entry(key)
                    .or_insert_with(|| build_atlas_images(&s, &cfg, &key, 5));
                let ratio = images.size / coarsest;
                let side = images.side(AtlasKind::Height);
                let (x, y) = (cx * ratio, cy * ratio);
                values.push(images.height[(y * side + x) as usize][0]);
            }
            for a in 0..lods.len() {
                for b in a + 1..lods.len() {
                    assert_eq!(
                        values[a].to_bits(),
                        values[b].to_bits(),
                        "lod {a} vs {b} at ({cx},{cy}) of atlas ({ax},{ay})"
                    );
                }
            }
        }
    }

    /// Splat texel (0, 0) of chunk (0, 0) for seed 42 and a 5×5 kernel,
    /// recorded at 1 m texel spacing. Any change to the hashes, terrain
    /// functions or kernel shows up here.
    #[test]
    fn test_splat_snapshot_seed_42() {
        let cfg = LodAtlasConfig::new(64, 32, 64, 2, &[100.0]).unwrap();
        let key = cfg.atlas_key_from_chunk(0, 0, 0, None);
        let images = build_atlas_images(&sampler(), &cfg, &key, 5);
        let texel = SplatTexel::decode(images.splat[0]);
        assert_eq!(texel.id0, 2);
        assert_eq!(texel.id1, 2);
        assert_eq!(texel.w0.to_bits(), 1.0f32.to_bits());
        assert_eq!(texel.w1.to_bits(), 0.0f32.to_bits());
    }

    /// Splat texels satisfy the packing invariants.
    #[test]
    fn test_splat_packing() {
        let images = build_atlas_images(&sampler(), &small_cfg(), &AtlasKey::new(None, 0, 0, 1), 5);
        for texel in &images.splat {
            let t = SplatTexel::decode(*texel);
            assert!((t.w0 + t.w1 - 1.0).abs() <= 1e-4);
            assert!(t.w0 >= t.w1);
            assert!(t.id0 <= 8 && t.id1 <= 8);
        }
    }

    /// Normals are unit length after decoding.
    #[test]
    fn test_normals_unit() {
        let images = build_atlas_images(&sampler(), &small_cfg(), &AtlasKey::new(None, 0, 0, 2), 5);
        for t in &images.normal {
            let n = glam::Vec3::new(t[0] * 2.0 - 1.0, t[1] * 2.0 - 1.0, t[2] * 2.0 - 1.0);
            assert!((n.length() - 1.0).abs() < 1e-4);
            assert!(n.y > 0.0);
        }
    }

    /// Half-float kinds encode to 8 bytes per texel.
    #[test]
    fn test_encoded_sizes() {
        let images = build_atlas_images(&sampler(), &small_cfg(), &AtlasKey::new(None, 0, 0, 2), 3);
        let texels = (images.size * images.size) as usize;
        let side = images.side(AtlasKind::Height) as usize;
        assert_eq!(images.encode(AtlasKind::Height).len(), side * side * 16);
        assert_eq!(images.encode(AtlasKind::Normal).len(), texels * 8);
        assert_eq!(decode_rgba32f(&images.encode(AtlasKind::Height)), images.height);
    }
}
