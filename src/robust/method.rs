//! Robust estimation policies: how candidates are scored, how inliers are
//! selected, and when the outer loop may stop early.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Consistency constant turning a median absolute deviation into a Gaussian
/// standard deviation estimate.
const MAD_SCALE: f64 = 1.4826;
/// Inlier acceptance band around the MAD-based scale, in standard
/// deviations.
const MAD_INLIER_FACTOR: f64 = 2.5;

/// The five supported robust methods.
///
/// All methods share one outer loop; they differ only in scoring, inlier
/// test, stop criterion and whether sampling is biased by per-reading
/// quality scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RobustMethod {
    /// Maximize the count of residuals under the threshold.
    Ransac,
    /// Like RANSAC but scoring the truncated quadratic loss, which prefers
    /// tight fits among equal inlier counts.
    Msac,
    /// Minimize the median of squared residuals; needs no threshold and
    /// tolerates up to 50% outliers.
    Lmeds,
    /// RANSAC scoring with quality-ordered progressive sampling.
    Prosac,
    /// LMedS scoring with quality-ordered progressive sampling.
    Promeds,
}

impl RobustMethod {
    /// Whether the method biases subset sampling with per-reading quality
    /// scores (and therefore requires them).
    pub fn requires_quality_scores(&self) -> bool {
        matches!(self, Self::Prosac | Self::Promeds)
    }

    /// Whether the caller-supplied residual threshold participates in
    /// scoring and inlier selection.
    pub fn uses_threshold(&self) -> bool {
        matches!(self, Self::Ransac | Self::Msac | Self::Prosac)
    }

    /// Candidate score; lower is better for every method.
    pub(crate) fn score(&self, residuals: &[f64], threshold: f64) -> f64 {
        match self {
            Self::Ransac | Self::Prosac => {
                -(residuals.iter().filter(|r| **r < threshold).count() as f64)
            }
            Self::Msac => residuals
                .iter()
                .map(|r| (r * r).min(threshold * threshold))
                .sum(),
            Self::Lmeds | Self::Promeds => median_of_squares(residuals),
        }
    }

    /// Inlier mask of `residuals` against a candidate already scored by this
    /// method.
    pub(crate) fn inlier_mask(&self, residuals: &[f64], threshold: f64) -> Vec<bool> {
        match self {
            Self::Ransac | Self::Msac | Self::Prosac => {
                residuals.iter().map(|r| *r < threshold).collect()
            }
            Self::Lmeds | Self::Promeds => {
                let sigma = MAD_SCALE * median_of_squares(residuals).sqrt();
                let bound = MAD_INLIER_FACTOR * sigma;
                residuals.iter().map(|r| *r <= bound).collect()
            }
        }
    }

    /// Whether `best_score` is good enough to stop before the iteration
    /// bound (median-of-residuals methods only).
    pub(crate) fn stops_on_score(&self, best_score: f64, stop_threshold: f64) -> bool {
        matches!(self, Self::Lmeds | Self::Promeds) && best_score < stop_threshold
    }
}

/// Median of the squared residuals; the lower median for even counts, which
/// keeps the estimator's breakdown point at one half of the readings. Zero
/// for an empty slice.
pub(crate) fn median_of_squares(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    let mut squares: Vec<f64> = residuals.iter().map(|r| r * r).collect();
    squares.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    squares[(squares.len() - 1) / 2]
}
