//! Splat kernel: the two dominant tile types around a texel.
//!
//! Each tap of an `N × N` kernel contributes a tent weight
//! `(h + 1 - |dx|) · (h + 1 - |dy|)` with `h = N / 2` to its biome id (the
//! tile id without the feature marker). Taps outside the atlas clamp to the
//! edge. Water taps count half when the centre texel is dry.

use crate::sampler::{Biome, WATER_LEVEL, base_tile};

/// Decoded splat texel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplatTexel {
    pub w0: f32,
    pub id0: u32,
    pub w1: f32,
    pub id1: u32,
}

impl SplatTexel {
    /// Pack as `(w0, id0 / 255, w1, id1 / 255)`.
    #[must_use]
    pub fn encode(&self) -> [f32; 4] {
        [
            self.w0,
            self.id0 as f32 / 255.0,
            self.w1,
            self.id1 as f32 / 255.0,
        ]
    }

    #[must_use]
    pub fn decode(texel: [f32; 4]) -> Self {
        Self {
            w0: texel[0],
            id0: decode_id(texel[1]),
            w1: texel[2],
            id1: decode_id(texel[3]),
        }
    }
}

/// Tile id from a `[0, 1]` channel holding `id / 255`.
#[inline]
#[must_use]
pub fn decode_id(channel: f32) -> u32 {
    (channel * 255.0).round().max(0.0) as u32
}

/// Splat value of texel `(x, y)` in a `size × size` grid of tile ids and
/// heights.
#[must_use]
pub fn splat_texel(tiles: &[u32], heights: &[f32], size: u32, x: u32, y: u32, kernel: u32) -> SplatTexel {
    let half = (kernel / 2) as i32;
    let max = size as i32 - 1;
    let center_height = heights[(y * size + x) as usize];
    let mut weights = [0.0f32; Biome::COUNT];
    for dy in -half..=half {
        for dx in -half..=half {
            let cx = (x as i32 + dx).clamp(0, max);
            let cy = (y as i32 + dy).clamp(0, max);
            let id = base_tile(tiles[(cy * size as i32 + cx) as usize]).min(8) as usize;
            let mut w = (half + 1 - dx.abs()) as f32 * (half + 1 - dy.abs()) as f32;
            if id == Biome::Water as usize && center_height >= WATER_LEVEL {
                w *= 0.5;
            }
            weights[id] += w;
        }
    }

    let mut id0 = 0;
    let mut w0 = -1.0;
    for (i, &w) in weights.iter().enumerate() {
        if w > w0 {
            w0 = w;
            id0 = i;
        }
    }
    let mut id1 = id0;
    let mut w1 = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        if i != id0 && w > w1 {
            w1 = w;
            id1 = i;
        }
    }
    let total = w0 + w1;
    SplatTexel {
        w0: w0 / total,
        id0: id0 as u32,
        w1: w1 / total,
        id1: id1 as u32,
    }
}

/// Splat values for a whole `size × size` atlas, row-major.
#[must_use]
pub fn compute_splat(tiles: &[u32], heights: &[f32], size: u32, kernel: u32) -> Vec<SplatTexel> {
    let mut out = Vec::with_capacity((size * size) as usize);
    for y in 0..size {
        for x in 0..size {
            out.push(splat_texel(tiles, heights, size, x, y, kernel));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A uniform region yields one id with full weight.
    #[test]
    fn test_uniform_region() {
        let tiles = vec![102; 16];
        let heights = vec![20.0; 16];
        let t = splat_texel(&tiles, &heights, 4, 1, 1, 5);
        assert_eq!(t.id0, 2);
        assert_eq!(t.id1, 2);
        assert_eq!(t.w0, 1.0);
        assert_eq!(t.w1, 0.0);
    }

    /// A half-and-half split produces the tent-weighted shares.
    #[test]
    fn test_tent_weights() {
        // Column 0..2 forest, 3.. rock, 8 wide.
        let size = 8;
        let tiles: Vec<u32> = (0..size * size)
            .map(|i| if i % size < 3 { 3 } else { 5 })
            .collect();
        let heights = vec![50.0; (size * size) as usize];
        let t = splat_texel(&tiles, &heights, size, 3, 4, 5);
        // dx = -2..-1 hit forest (weights 1 and 2 per row factor), dx = 0..2
        // hit rock (3, 2, 1); the row factors (1+2+3+2+1 = 9) cancel.
        assert_eq!(t.id0, 5);
        assert_eq!(t.id1, 3);
        assert!((t.w0 - 6.0 / 9.0).abs() < 1e-6);
        assert!((t.w1 - 3.0 / 9.0).abs() < 1e-6);
    }

    /// Weights always sum to one, are ordered, and ids are biomes.
    #[test]
    fn test_packing_invariants() {
        let size = 16;
        let tiles: Vec<u32> = (0..size * size).map(|i| (i * 7 + i / 5) % 9 + (i % 3) * 50).collect();
        let heights: Vec<f32> = (0..size * size).map(|i| (i % 13) as f32).collect();
        for t in compute_splat(&tiles, &heights, size, 5) {
            assert!((t.w0 + t.w1 - 1.0).abs() <= 1e-4);
            assert!(t.w0 >= t.w1);
            assert!(t.id0 <= 8 && t.id1 <= 8);
        }
    }

    /// Ids survive the `/ 255` encoding.
    #[test]
    fn test_encode_decode() {
        let t = SplatTexel {
            w0: 0.75,
            id0: 8,
            w1: 0.25,
            id1: 1,
        };
        assert_eq!(SplatTexel::decode(t.encode()), t);
    }

    /// Water taps weigh half around dry texels.
    #[test]
    fn test_water_half_weight() {
        let tiles = vec![0, 0, 2, 0, 2, 2, 2, 2, 2];
        let dry = vec![10.0; 9];
        let t = splat_texel(&tiles, &dry, 3, 1, 1, 3);
        // Tent weights: corners 1, edges 2, centre 4. Water at (0,0), (1,0),
        // (0,1): 1 + 2 + 2 = 5, halved to 2.5; grass: 16 - 5 = 11.
        assert_eq!(t.id0, 2);
        assert!((t.w1 - 2.5 / 13.5).abs() < 1e-6);
    }
}
