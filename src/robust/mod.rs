//! Method-agnostic robust outer loop.
//!
//! The loop repeatedly draws a reading subset, solves it with an inner
//! estimator, scores every reading's residual against the candidate and
//! keeps the best candidate under the method's comparison rule, until the
//! confidence-driven iteration bound (or an early-stop criterion) is met.

mod method;

pub use method::RobustMethod;

use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cancel::CancelToken;
use crate::errors::{PositioningError, Result};
use crate::listener::EstimatorListener;

/// Iterations over which the PROSAC/PROMedS sampling pool grows from just
/// above the subset size to the full reading set.
const PROSAC_GROWTH_ITERATIONS: usize = 100;

/// Tuning of one robust run. Field defaults live on the public estimators;
/// by the time settings reach the driver they are validated.
pub(crate) struct RobustSettings {
    pub method: RobustMethod,
    /// Residual threshold τ, in normalized residual units.
    pub threshold: f64,
    pub confidence: f64,
    pub max_iterations: usize,
    /// Early-stop bound on the median of squared residuals (LMedS family).
    pub stop_threshold: f64,
    pub progress_delta: f64,
    pub subset_size: usize,
    pub seed: u64,
}

pub(crate) struct RobustOutcome<T> {
    pub candidate: T,
    pub inliers: Vec<bool>,
    pub iterations: usize,
}

/// Iterations needed to draw at least one all-inlier subset of size
/// `subset_size` with probability `confidence`, given the current inlier
/// ratio.
pub(crate) fn confidence_iteration_bound(
    confidence: f64,
    inlier_ratio: f64,
    subset_size: usize,
) -> Option<usize> {
    if !(0.0..1.0).contains(&inlier_ratio) || inlier_ratio == 0.0 {
        return if inlier_ratio >= 1.0 { Some(1) } else { None };
    }
    let p_good = inlier_ratio.powi(subset_size as i32);
    if p_good <= 0.0 {
        return None;
    }
    if p_good >= 1.0 {
        return Some(1);
    }
    let needed = (1.0 - confidence).ln() / (1.0 - p_good).ln();
    Some(needed.ceil().max(1.0) as usize)
}

/// Sampling pool size for quality-biased methods at `iteration`: starts just
/// above the subset size and grows linearly to the whole set, so every
/// subset stays reachable with positive probability.
fn prosac_pool(num_readings: usize, subset_size: usize, iteration: usize) -> usize {
    if num_readings <= subset_size {
        return num_readings;
    }
    let span = num_readings - subset_size - 1;
    let grown = subset_size
        + 1
        + span * iteration.min(PROSAC_GROWTH_ITERATIONS) / PROSAC_GROWTH_ITERATIONS;
    grown.min(num_readings)
}

/// Run the outer loop.
///
/// `solve_subset` builds a candidate from the reading indices it is given;
/// `residuals` scores a candidate against every reading (one normalized
/// residual per reading). Failures of either only discard the current
/// sample.
pub(crate) fn run_loop<T>(
    settings: &RobustSettings,
    num_readings: usize,
    quality_scores: Option<&[f64]>,
    solve_subset: &mut dyn FnMut(&[usize]) -> Result<T>,
    residuals: &mut dyn FnMut(&T) -> Result<Vec<f64>>,
    listener: Option<&Arc<dyn EstimatorListener>>,
    cancel: Option<&CancelToken>,
) -> Result<RobustOutcome<T>> {
    let subset_size = settings.subset_size;
    if subset_size == 0 || subset_size > num_readings {
        return Err(PositioningError::NotReady(format!(
            "subset size {subset_size} incompatible with {num_readings} readings"
        )));
    }

    // Quality-biased methods walk a quality-sorted index order; the others
    // sample the identity order uniformly.
    let order: Vec<usize> = match quality_scores {
        Some(scores) if settings.method.requires_quality_scores() => {
            let mut indices: Vec<usize> = (0..num_readings).collect();
            indices.sort_by(|&a, &b| {
                scores[b]
                    .partial_cmp(&scores[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            indices
        }
        _ => (0..num_readings).collect(),
    };

    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut best: Option<(f64, T, Vec<bool>)> = None;
    let mut bound = settings.max_iterations;
    let mut iteration = 0usize;
    let mut discarded = 0usize;
    let mut last_progress = 0.0f64;

    while iteration < bound {
        if let Some(cancel) = cancel {
            if cancel.is_cancelled() {
                return Err(PositioningError::Cancelled);
            }
        }
        if let Some(listener) = listener {
            listener.on_iteration(iteration);
            let progress = (iteration + 1) as f64 / bound as f64;
            if progress - last_progress >= settings.progress_delta {
                last_progress = progress;
                listener.on_progress(progress.min(1.0));
            }
        }

        let pool = if settings.method.requires_quality_scores() {
            prosac_pool(num_readings, subset_size, iteration)
        } else {
            num_readings
        };
        let subset: Vec<usize> = rand::seq::index::sample(&mut rng, pool, subset_size)
            .iter()
            .map(|i| order[i])
            .collect();

        iteration += 1;

        let candidate = match solve_subset(&subset) {
            Ok(candidate) => candidate,
            Err(e) => {
                discarded += 1;
                debug!("sample discarded at iteration {}: {e}", iteration - 1);
                continue;
            }
        };
        let sample_residuals = match residuals(&candidate) {
            Ok(r) if r.len() == num_readings && r.iter().all(|v| v.is_finite()) => r,
            Ok(_) => {
                discarded += 1;
                debug!("non-finite residuals at iteration {}", iteration - 1);
                continue;
            }
            Err(e) => {
                discarded += 1;
                debug!("residual evaluation failed at iteration {}: {e}", iteration - 1);
                continue;
            }
        };

        let score = settings
            .method
            .score(&sample_residuals, settings.threshold);
        let improved = best.as_ref().map_or(true, |(s, _, _)| score < *s);
        if improved {
            let mask = settings
                .method
                .inlier_mask(&sample_residuals, settings.threshold);
            let inlier_count = mask.iter().filter(|m| **m).count();
            debug!(
                "iteration {}: new best score {score:.6e} ({inlier_count}/{num_readings} inliers)",
                iteration - 1
            );
            best = Some((score, candidate, mask));

            let ratio = inlier_count as f64 / num_readings as f64;
            if let Some(needed) = confidence_iteration_bound(
                settings.confidence,
                ratio.min(1.0),
                subset_size,
            ) {
                bound = needed.max(iteration).min(settings.max_iterations);
            }
            if settings.method.stops_on_score(score, settings.stop_threshold) {
                debug!("early stop at iteration {}: score below stop threshold", iteration - 1);
                break;
            }
        }
    }

    if let Some(listener) = listener {
        listener.on_progress(1.0);
    }

    match best {
        Some((_, candidate, inliers)) => Ok(RobustOutcome {
            candidate,
            inliers,
            iterations: iteration,
        }),
        None => Err(PositioningError::RobustFailure(format!(
            "no acceptable candidate after {iteration} iterations ({discarded} samples discarded)"
        ))),
    }
}
