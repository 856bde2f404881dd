//! LOD index strips with a full-resolution rim.
//!
//! Every chunk shares one `(n + 1)²` vertex grid. A LOD only changes which
//! grid vertices the index buffer references:
//!
//! 1. **Interior**: cells of side `step = 1 << lod` (1, 2, 4, 8), covering
//!    `[step, n - step]²`.
//! 2. **Rim band**: four trapezoids between the full-resolution boundary
//!    and the coarse interior boundary, zipped along each side.
//!
//! The boundary is always emitted at full resolution, so two neighbouring
//! chunks reference identical rim vertex positions whatever their LODs are,
//! and the band introduces no T-junctions.

/// Finest interior step used for LOD strips; coarser LODs reuse the last strip.
pub const MAX_STRIP_LOD: u8 = 3;

/// Interior step for `lod`, clamped so the interior still fits in the grid.
#[must_use]
pub fn interior_step(segments: u32, lod: u8) -> u32 {
    let mut step = (1u32 << lod.min(MAX_STRIP_LOD)).min(segments / 2).max(1);
    while step > 1 && segments % step != 0 {
        step /= 2;
    }
    step
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Bottom,
    Top,
    Left,
    Right,
}

impl Side {
    const ALL: [Side; 4] = [Side::Bottom, Side::Top, Side::Left, Side::Right];

    /// Grid point at parameter `t` along this side, `inset` cells inwards.
    fn point(self, n: u32, t: u32, inset: u32) -> (u32, u32) {
        match self {
            Side::Bottom => (t, inset),
            Side::Top => (t, n - inset),
            Side::Left => (inset, t),
            Side::Right => (n - inset, t),
        }
    }
}

/// Collects triangles over the grid, normalising winding so every triangle
/// faces +Y (grid x maps to X, grid y to Z).
struct TriangleSink {
    side: u32,
    indices: Vec<u32>,
}

impl TriangleSink {
    fn new(segments: u32) -> Self {
        Self {
            side: segments + 1,
            indices: Vec::new(),
        }
    }

    fn index(&self, (x, y): (u32, u32)) -> u32 {
        y * self.side + x
    }

    fn push(&mut self, a: (u32, u32), b: (u32, u32), c: (u32, u32)) {
        let (b, c) = if grid_cross(a, b, c) > 0 { (c, b) } else { (b, c) };
        let tri = [self.index(a), self.index(b), self.index(c)];
        self.indices.extend_from_slice(&tri);
    }

    fn quad(&mut self, x: u32, y: u32, step: u32) {
        let a = (x, y);
        let b = (x + step, y);
        let c = (x + step, y + step);
        let d = (x, y + step);
        self.push(a, b, c);
        self.push(a, c, d);
    }
}

/// Twice the signed area of a grid triangle. Negative is front-facing.
#[must_use]
pub fn grid_cross(a: (u32, u32), b: (u32, u32), c: (u32, u32)) -> i64 {
    let (ax, ay) = (i64::from(a.0), i64::from(a.1));
    let (bx, by) = (i64::from(b.0), i64::from(b.1));
    let (cx, cy) = (i64::from(c.0), i64::from(c.1));
    (bx - ax) * (cy - ay) - (by - ay) * (cx - ax)
}

/// Triangle list for a chunk of `segments` cells per side at `lod`.
#[must_use]
pub fn build_lod_indices(segments: u32, lod: u8) -> Vec<u32> {
    let n = segments;
    let step = interior_step(n, lod);
    let mut sink = TriangleSink::new(n);

    if step == 1 {
        for y in 0..n {
            for x in 0..n {
                sink.quad(x, y, 1);
            }
        }
        return sink.indices;
    }

    let mut y = step;
    while y < n - step {
        let mut x = step;
        while x < n - step {
            sink.quad(x, y, step);
            x += step;
        }
        y += step;
    }

    for side in Side::ALL {
        stitch_side(&mut sink, n, step, side);
    }
    sink.indices
}

/// Zip one rim trapezoid: the outer edge `t ∈ [0, n]` at full resolution
/// against the inner edge `t ∈ [step, n - step]` at `step` spacing.
fn stitch_side(sink: &mut TriangleSink, n: u32, step: u32, side: Side) {
    let outer_last = n;
    let inner_last = (n - 2 * step) / step;
    let outer_t = |i: u32| i;
    let inner_t = |i: u32| step + i * step;

    let (mut a, mut b) = (0u32, 0u32);
    while a < outer_last || b < inner_last {
        let advance_outer = if a == outer_last {
            false
        } else if b == inner_last {
            true
        } else {
            // Advance whichever next segment has the lower midpoint.
            outer_t(a) + outer_t(a + 1) <= inner_t(b) + inner_t(b + 1)
        };
        let o = side.point(n, outer_t(a), 0);
        let i = side.point(n, inner_t(b), step);
        if advance_outer {
            sink.push(o, side.point(n, outer_t(a + 1), 0), i);
            a += 1;
        } else {
            sink.push(o, i, side.point(n, inner_t(b + 1), step));
            b += 1;
        }
    }
}
