//! Per-plane sample reduction strategies.
//!
//! A plane's filter decides two things: how a new sample folds into
//! the plane's per-pixel state at insert time, and how that state
//! reduces to a final pixel value when the plane is read out.
//! Accumulating filters sum components; vetting filters keep exactly
//! one winning sample per pixel and replace it when a better candidate
//! arrives.

/// Reduction strategy for one image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFilter {
    /// Arithmetic mean of all inserted samples.
    Mean,
    /// The sample with the smallest component average wins.
    Minimum,
    /// The sample with the largest component average wins.
    Maximum,
    /// The sample farthest from the running mean wins.
    MostDistinct,
    /// Debug view: per-pixel inserted sample count.
    SampleCount,
    /// Debug view: means aggregated over `2^level` pixel blocks.
    BlockMean { level: u8 },
    /// Debug view: per-pixel relative noise estimate.
    NoiseRatio,
}

impl PixelFilter {
    /// Whether the filter keeps a single winning sample instead of
    /// accumulating.
    pub fn is_vetting(self) -> bool {
        matches!(
            self,
            PixelFilter::Minimum | PixelFilter::Maximum | PixelFilter::MostDistinct
        )
    }

    /// Fold `sample` into the current pick for one pixel.
    ///
    /// `running_mean` is the pixel's component-average mean including
    /// this sample; only [`PixelFilter::MostDistinct`] looks at it.
    /// `first` marks the pixel's first sample, which always wins.
    /// No-op for non-vetting filters.
    pub fn combine_sample(self, picks: &mut [f32], sample: &[f32], running_mean: f64, first: bool) {
        if !self.is_vetting() {
            return;
        }
        if first {
            picks.copy_from_slice(sample);
            return;
        }
        let candidate = scalar_of(sample);
        let incumbent = scalar_of(picks);
        let replace = match self {
            PixelFilter::Minimum => candidate < incumbent,
            PixelFilter::Maximum => candidate > incumbent,
            PixelFilter::MostDistinct => {
                (candidate - running_mean).abs() > (incumbent - running_mean).abs()
            }
            _ => false,
        };
        if replace {
            picks.copy_from_slice(sample);
        }
    }
}

/// Component average of one sample, the scalar all vetting
/// comparisons run on.
pub(crate) fn scalar_of(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vetting_classification() {
        assert!(PixelFilter::Minimum.is_vetting());
        assert!(PixelFilter::Maximum.is_vetting());
        assert!(PixelFilter::MostDistinct.is_vetting());
        assert!(!PixelFilter::Mean.is_vetting());
        assert!(!PixelFilter::SampleCount.is_vetting());
        assert!(!PixelFilter::BlockMean { level: 2 }.is_vetting());
        assert!(!PixelFilter::NoiseRatio.is_vetting());
    }

    #[test]
    fn first_sample_always_wins() {
        let mut picks = [0.0f32; 2];
        PixelFilter::Minimum.combine_sample(&mut picks, &[5.0, 7.0], 6.0, true);
        assert_eq!(picks, [5.0, 7.0]);
    }

    #[test]
    fn minimum_keeps_the_smallest_scalar() {
        let mut picks = [4.0f32, 6.0];
        PixelFilter::Minimum.combine_sample(&mut picks, &[5.0, 9.0], 0.0, false);
        assert_eq!(picks, [4.0, 6.0]);
        PixelFilter::Minimum.combine_sample(&mut picks, &[1.0, 2.0], 0.0, false);
        assert_eq!(picks, [1.0, 2.0]);
    }

    #[test]
    fn maximum_keeps_the_largest_scalar() {
        let mut picks = [4.0f32];
        PixelFilter::Maximum.combine_sample(&mut picks, &[3.0], 0.0, false);
        assert_eq!(picks, [4.0]);
        PixelFilter::Maximum.combine_sample(&mut picks, &[8.0], 0.0, false);
        assert_eq!(picks, [8.0]);
    }

    #[test]
    fn most_distinct_compares_distance_from_mean() {
        let mut picks = [1.2f32];
        // Mean 1.0: 1.2 is 0.2 away; 0.5 is 0.5 away and wins.
        PixelFilter::MostDistinct.combine_sample(&mut picks, &[0.5], 1.0, false);
        assert_eq!(picks, [0.5]);
        // 1.3 is only 0.3 away; the incumbent stays.
        PixelFilter::MostDistinct.combine_sample(&mut picks, &[1.3], 1.0, false);
        assert_eq!(picks, [0.5]);
    }

    #[test]
    fn accumulating_filters_never_touch_picks() {
        let mut picks = [9.0f32];
        PixelFilter::Mean.combine_sample(&mut picks, &[1.0], 0.0, false);
        PixelFilter::SampleCount.combine_sample(&mut picks, &[1.0], 0.0, true);
        assert_eq!(picks, [9.0]);
    }

    #[test]
    fn scalar_is_the_component_average() {
        assert_eq!(scalar_of(&[1.0, 3.0]), 2.0);
        assert_eq!(scalar_of(&[]), 0.0);
    }
}
