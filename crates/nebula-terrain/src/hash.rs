//! Deterministic hashes shared with the WGSL shaders.
//!
//! Each function is a line-for-line twin of the shader helper with the same
//! name in `terrain_common.wgsl`. The constants are part of the world format:
//! changing any of them changes every generated planet.

/// WGSL `fract`: `x - floor(x)`.
#[inline]
#[must_use]
pub fn fract(x: f32) -> f32 {
    x - x.floor()
}

/// Hash a 2D point to `[0, 1)`.
#[inline]
#[must_use]
pub fn hash12(x: f32, y: f32) -> f32 {
    let mut p3 = [fract(x * 0.1031), fract(y * 0.1031), fract(x * 0.1031)];
    let d = p3[0] * (p3[1] + 33.33) + p3[1] * (p3[2] + 33.33) + p3[2] * (p3[0] + 33.33);
    p3[0] += d;
    p3[1] += d;
    p3[2] += d;
    fract((p3[0] + p3[1]) * p3[2])
}

/// Hash a 3D point to `[0, 1)`.
#[inline]
#[must_use]
pub fn hash13(x: f32, y: f32, z: f32) -> f32 {
    let mut p3 = [fract(x * 0.1031), fract(y * 0.1031), fract(z * 0.1031)];
    let d = p3[0] * (p3[2] + 31.32) + p3[1] * (p3[1] + 31.32) + p3[2] * (p3[0] + 31.32);
    p3[0] += d;
    p3[1] += d;
    p3[2] += d;
    fract((p3[0] + p3[1]) * p3[2])
}

/// Tile variant hash of `(world tile coordinate, tile id, season)`.
///
/// Returns two independent values in `[0, 1)`: the first selects the
/// variant, the second the quarter-turn rotation.
#[must_use]
pub fn good_tile_hash(tile_x: f32, tile_y: f32, tile_id: f32, season: f32) -> [f32; 2] {
    let a = tile_x * 127.1 + tile_y * 311.7 + tile_id * 269.5 + season * 19.17;
    let b = tile_x * 183.3 + tile_y * 47.21 + tile_id * 101.9 + season * 233.7;
    [
        fract(libm::sinf(a) * 43758.5453123),
        fract(libm::sinf(b) * 43758.5453123),
    ]
}

/// Variant index and rotation in degrees for a tile.
#[must_use]
pub fn tile_variant(
    tile_x: f32,
    tile_y: f32,
    tile_id: u32,
    season: u32,
    variant_count: u32,
) -> (u32, u32) {
    let [a, b] = good_tile_hash(tile_x, tile_y, tile_id as f32, season as f32);
    let variant = ((a * variant_count as f32) as u32).min(variant_count.saturating_sub(1));
    let rotation = ((b * 4.0) as u32).min(3) * 90;
    (variant, rotation)
}

/// Per-seed offset added to every noise lookup.
///
/// Truncating `%` matches WGSL's integer remainder for negative seeds.
#[must_use]
pub fn seed_offset(seed: i32) -> [f32; 2] {
    [(seed % 10007) as f32 * 0.137, (seed % 7919) as f32 * 0.211]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hash outputs stay in `[0, 1)` over a wide input range.
    #[test]
    fn test_hash_range() {
        for i in -200..200 {
            for j in -20..20 {
                let x = i as f32 * 13.7;
                let y = j as f32 * 71.3;
                let a = hash12(x, y);
                let b = hash13(x, y, (i + j) as f32);
                assert!((0.0..1.0).contains(&a), "hash12({x},{y}) = {a}");
                assert!((0.0..1.0).contains(&b), "hash13 = {b}");
            }
        }
    }

    /// Repeated evaluation is bit-identical.
    #[test]
    fn test_hash_deterministic() {
        for i in 0..100 {
            let x = i as f32 * 0.731;
            assert_eq!(hash12(x, 5.0).to_bits(), hash12(x, 5.0).to_bits());
            assert_eq!(
                good_tile_hash(x, 2.0, 3.0, 1.0),
                good_tile_hash(x, 2.0, 3.0, 1.0)
            );
        }
    }

    /// Neighbouring lattice points decorrelate.
    #[test]
    fn test_hash12_spread() {
        let mut buckets = [0u32; 10];
        for i in 0..100 {
            for j in 0..100 {
                let h = hash12(i as f32, j as f32);
                buckets[(h * 10.0) as usize] += 1;
            }
        }
        for (i, &count) in buckets.iter().enumerate() {
            assert!(
                (600..1400).contains(&count),
                "bucket {i} has {count} of 10000"
            );
        }
    }

    /// Tile variants and rotations land in their ranges.
    #[test]
    fn test_tile_variant_ranges() {
        for x in 0..64 {
            let (variant, rotation) = tile_variant(x as f32, 7.0, 2, 1, 4);
            assert!(variant < 4);
            assert!(matches!(rotation, 0 | 90 | 180 | 270));
        }
    }

    /// Negative seeds keep the sign like a truncating remainder.
    #[test]
    fn test_seed_offset_negative() {
        let [x, y] = seed_offset(-42);
        assert!(x < 0.0 && y < 0.0);
        assert_eq!(seed_offset(42), [42.0 * 0.137, 42.0 * 0.211]);
        assert_eq!(seed_offset(10007), [0.0, (10007 % 7919) as f32 * 0.211]);
    }
}
