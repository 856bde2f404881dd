//! Distance-based LOD selection with hysteresis.

use crate::error::LodError;

/// Fraction of a threshold a chunk must come within before it refines.
pub const REFINE_HYSTERESIS: f64 = 0.9;

/// Monotonic LOD distance thresholds.
///
/// `thresholds[i]` is the distance below which LOD `i` is selected; the last
/// entry is usually infinite.
#[derive(Clone, Debug, PartialEq)]
pub struct LodThresholds {
    thresholds: Vec<f64>,
}

impl LodThresholds {
    /// Build thresholds, rejecting empty, non-positive or non-increasing
    /// lists.
    pub fn custom(thresholds: Vec<f64>) -> Result<Self, LodError> {
        if thresholds.is_empty() || thresholds.len() > usize::from(u8::MAX) {
            return Err(LodError::InvalidConfig {
                field: "lod_distances",
                reason: format!("{} thresholds", thresholds.len()),
            });
        }
        for (i, &t) in thresholds.iter().enumerate() {
            if t.is_nan() || t <= 0.0 {
                return Err(LodError::InvalidConfig {
                    field: "lod_distances",
                    reason: format!("threshold {i} ({t}) must be positive"),
                });
            }
            if i > 0 && t <= thresholds[i - 1] {
                return Err(LodError::InvalidConfig {
                    field: "lod_distances",
                    reason: "thresholds must be strictly increasing".into(),
                });
            }
        }
        Ok(Self { thresholds })
    }

    /// Number of LOD levels.
    #[must_use]
    pub fn levels(&self) -> u8 {
        self.thresholds.len() as u8
    }

    #[must_use]
    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// First `i` with `distance < thresholds[i]`, clamped to the coarsest
    /// level.
    #[must_use]
    pub fn select_lod(&self, distance: f64) -> u8 {
        self.select_scaled(distance, 1.0)
    }

    fn select_scaled(&self, distance: f64, factor: f64) -> u8 {
        self.thresholds
            .iter()
            .position(|&t| distance < t * factor)
            .unwrap_or(self.thresholds.len() - 1) as u8
    }

    /// LOD for a chunk currently shown at `current`.
    ///
    /// Coarsening uses the plain thresholds; refining requires the distance
    /// to drop below `threshold · 0.9`, so a chunk sitting on a boundary
    /// does not flap between levels.
    #[must_use]
    pub fn select_with_hysteresis(&self, current: u8, distance: f64) -> u8 {
        let target = self.select_lod(distance);
        if target >= current {
            return target;
        }
        self.select_scaled(distance, REFINE_HYSTERESIS).min(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> LodThresholds {
        LodThresholds::custom(vec![1200.0, 3200.0, 8000.0, 16000.0, f64::INFINITY]).unwrap()
    }

    /// Selection at and around the boundaries.
    #[test]
    fn test_threshold_boundary_behavior() {
        let t = thresholds();
        assert_eq!(t.select_lod(0.0), 0);
        assert_eq!(t.select_lod(1199.9), 0);
        assert_eq!(t.select_lod(1200.0), 1);
        assert_eq!(t.select_lod(3199.0), 1);
        assert_eq!(t.select_lod(f64::MAX), 4);
    }

    /// LOD is non-decreasing over an increasing distance sequence.
    #[test]
    fn test_monotonically_increasing_with_distance() {
        let t = thresholds();
        let mut prev = 0;
        let mut d = 0.0;
        while d < 40_000.0 {
            let lod = t.select_lod(d);
            assert!(lod >= prev, "LOD must not decrease: d={d}, lod={lod}, prev={prev}");
            prev = lod;
            d += 37.5;
        }
    }

    /// Finite-only thresholds clamp to the last level.
    #[test]
    fn test_clamps_to_last_level() {
        let t = LodThresholds::custom(vec![100.0, 200.0]).unwrap();
        assert_eq!(t.select_lod(500.0), 1);
    }

    /// Refining waits until the distance is 10% inside the threshold.
    #[test]
    fn test_hysteresis_refine() {
        let t = thresholds();
        assert_eq!(t.select_with_hysteresis(1, 1150.0), 1);
        assert_eq!(t.select_with_hysteresis(1, 1079.0), 0);
        assert_eq!(t.select_with_hysteresis(2, 3000.0), 2);
        assert_eq!(t.select_with_hysteresis(2, 2000.0), 1);
    }

    /// Coarsening happens at the plain threshold.
    #[test]
    fn test_hysteresis_coarsen() {
        let t = thresholds();
        assert_eq!(t.select_with_hysteresis(0, 1199.0), 0);
        assert_eq!(t.select_with_hysteresis(0, 1200.0), 1);
        assert_eq!(t.select_with_hysteresis(0, 9000.0), 3);
    }

    /// A distance oscillating across a boundary does not flap.
    #[test]
    fn test_hysteresis_no_flapping() {
        let t = thresholds();
        let mut lod = 0;
        let mut changes = 0;
        for i in 0..100 {
            let d = if i % 2 == 0 { 1195.0 } else { 1205.0 };
            let next = t.select_with_hysteresis(lod, d);
            if next != lod {
                changes += 1;
            }
            lod = next;
        }
        assert_eq!(changes, 1);
    }

    /// Non-increasing thresholds are rejected.
    #[test]
    fn test_non_increasing_thresholds_rejected() {
        assert!(LodThresholds::custom(vec![100.0, 50.0, 200.0]).is_err());
        assert!(LodThresholds::custom(vec![]).is_err());
        assert!(LodThresholds::custom(vec![-1.0]).is_err());
    }
}
