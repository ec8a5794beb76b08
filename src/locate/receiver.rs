//! Receiver position estimation against located sources.
//!
//! Every reading is reduced to an effective distance to its source (RSSI
//! readings through the inverse path-loss law), then the receiver is
//! multilaterated. A robust variant wraps the lateration in the shared
//! outer loop.

use std::sync::Arc;

use log::debug;
use nalgebra::DMatrix;

use crate::cancel::CancelToken;
use crate::constants::{
    DEFAULT_CONFIDENCE, DEFAULT_MAX_ITERATIONS, DEFAULT_PROGRESS_DELTA,
    DEFAULT_RESIDUAL_THRESHOLD, DEFAULT_RNG_SEED, DEFAULT_STOP_THRESHOLD,
};
use crate::errors::{PositioningError, Result};
use crate::fitting::{nonlinear_lateration, LaterationSolution};
use crate::geometry::Point;
use crate::listener::EstimatorListener;
use crate::propagation::{distance_from_rssi, distance_std_from_rssi_std};
use crate::robust::{run_loop, RobustMethod, RobustOutcome, RobustSettings};
use crate::schema::{LocatedSource, Reading};

/// One reading reduced to an effective range against a known anchor.
struct RangeRow {
    anchor: Point,
    distance: f64,
    sigma: f64,
}

/// Reduce a reading against its located source. Combined readings blend the
/// two channels by inverse-variance weighting.
fn effective_range(reading: &Reading, source: &LocatedSource) -> Result<(f64, f64)> {
    let ranging = reading
        .distance()
        .map(|d| (d, reading.effective_ranging_std().unwrap_or(1.0)));
    let rssi = match reading.rssi_dbm() {
        Some(rssi_dbm) => {
            let distance = distance_from_rssi(
                rssi_dbm,
                source.transmitted_power_dbm(),
                source.path_loss_exponent(),
                source.source().frequency_hz(),
            )?;
            let sigma = distance_std_from_rssi_std(
                distance,
                source.path_loss_exponent(),
                reading.effective_rssi_std().unwrap_or(1.0),
            );
            Some((distance, sigma.max(f64::MIN_POSITIVE)))
        }
        None => None,
    };

    Ok(match (ranging, rssi) {
        (Some((dr, sr)), Some((dp, sp))) => {
            let wr = 1.0 / (sr * sr);
            let wp = 1.0 / (sp * sp);
            ((dr * wr + dp * wp) / (wr + wp), (1.0 / (wr + wp)).sqrt())
        }
        (Some(r), None) => r,
        (None, Some(p)) => p,
        (None, None) => {
            return Err(PositioningError::InvalidArgument(
                "reading carries neither a ranging nor an RSSI channel".into(),
            ))
        }
    })
}

/// Pair readings with their sources and reduce them to range rows. Readings
/// against unknown sources are skipped; the returned mapping gives the
/// original index of each kept row.
fn build_rows(
    sources: &[LocatedSource],
    readings: &[Reading],
) -> Result<(Vec<RangeRow>, Vec<usize>)> {
    let mut rows = Vec::with_capacity(readings.len());
    let mut kept = Vec::with_capacity(readings.len());
    for (index, reading) in readings.iter().enumerate() {
        let Some(source) = sources.iter().find(|s| s.source() == reading.source()) else {
            debug!("reading {index} references an unknown source; skipped");
            continue;
        };
        let (distance, sigma) = effective_range(reading, source)?;
        rows.push(RangeRow {
            anchor: source.position().clone(),
            distance,
            sigma,
        });
        kept.push(index);
    }
    Ok((rows, kept))
}

/// Receiver position estimate.
#[derive(Debug, Clone)]
pub struct ReceiverEstimate {
    pub position: Point,
    pub covariance: Option<DMatrix<f64>>,
    pub residual_norm: f64,
}

impl From<LaterationSolution> for ReceiverEstimate {
    fn from(solution: LaterationSolution) -> Self {
        Self {
            position: solution.position,
            covariance: solution.covariance,
            residual_norm: solution.residual_norm,
        }
    }
}

/// Plain receiver estimator: one weighted multilateration over every reading
/// that matches a located source.
#[derive(Default)]
pub struct ReceiverEstimator {
    sources: Vec<LocatedSource>,
    readings: Vec<Reading>,
    initial_position: Option<Point>,
    result: Option<ReceiverEstimate>,
}

impl ReceiverEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(mut self, sources: Vec<LocatedSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_readings(mut self, readings: Vec<Reading>) -> Self {
        self.readings = readings;
        self
    }

    pub fn with_initial_position(mut self, position: Point) -> Self {
        self.initial_position = Some(position);
        self
    }

    /// Minimum matched readings: D+1, or `None` while no source fixes the
    /// dimension.
    pub fn min_readings(&self) -> Option<usize> {
        self.sources.first().map(|s| s.position().dim() + 1)
    }

    pub fn is_ready(&self) -> bool {
        match (self.min_readings(), build_rows(&self.sources, &self.readings)) {
            (Some(min), Ok((rows, _))) => rows.len() >= min,
            _ => false,
        }
    }

    pub fn estimate(&mut self) -> Result<ReceiverEstimate> {
        let (rows, _) = build_rows(&self.sources, &self.readings)?;
        let anchors: Vec<Point> = rows.iter().map(|r| r.anchor.clone()).collect();
        let distances: Vec<f64> = rows.iter().map(|r| r.distance).collect();
        let stds: Vec<f64> = rows.iter().map(|r| r.sigma).collect();
        let solution = nonlinear_lateration(
            &anchors,
            &distances,
            Some(&stds),
            self.initial_position.as_ref(),
        )?;
        let estimate = ReceiverEstimate::from(solution);
        self.result = Some(estimate.clone());
        Ok(estimate)
    }

    pub fn estimated(&self) -> Option<&ReceiverEstimate> {
        self.result.as_ref()
    }
}

/// Robust receiver estimator: the shared outer loop around subset
/// multilateration.
pub struct RobustReceiverEstimator {
    method: RobustMethod,
    sources: Vec<LocatedSource>,
    readings: Vec<Reading>,
    quality_scores: Option<Vec<f64>>,
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    stop_threshold: f64,
    progress_delta: f64,
    refine_result: bool,
    keep_covariance: bool,
    preliminary_subset_size: Option<usize>,
    seed: u64,
    listener: Option<Arc<dyn EstimatorListener>>,
    cancel: Option<CancelToken>,
    running: bool,
    result: Option<ReceiverEstimate>,
    inliers: Option<Vec<bool>>,
    iterations: Option<usize>,
}

impl RobustReceiverEstimator {
    pub fn new(method: RobustMethod) -> Self {
        Self {
            method,
            sources: Vec::new(),
            readings: Vec::new(),
            quality_scores: None,
            threshold: DEFAULT_RESIDUAL_THRESHOLD,
            confidence: DEFAULT_CONFIDENCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stop_threshold: DEFAULT_STOP_THRESHOLD,
            progress_delta: DEFAULT_PROGRESS_DELTA,
            refine_result: true,
            keep_covariance: true,
            preliminary_subset_size: None,
            seed: DEFAULT_RNG_SEED,
            listener: None,
            cancel: None,
            running: false,
            result: None,
            inliers: None,
            iterations: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<LocatedSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_readings(mut self, readings: Vec<Reading>) -> Self {
        self.readings = readings;
        self
    }

    pub fn with_quality_scores(mut self, scores: Vec<f64>) -> Self {
        self.quality_scores = Some(scores);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EstimatorListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn check_unlocked(&self) -> Result<()> {
        if self.running {
            Err(PositioningError::Locked)
        } else {
            Ok(())
        }
    }

    pub fn set_sources(&mut self, sources: Vec<LocatedSource>) -> Result<()> {
        self.check_unlocked()?;
        self.sources = sources;
        Ok(())
    }

    pub fn set_readings(&mut self, readings: Vec<Reading>) -> Result<()> {
        self.check_unlocked()?;
        self.readings = readings;
        Ok(())
    }

    pub fn set_quality_scores(&mut self, scores: Option<Vec<f64>>) -> Result<()> {
        self.check_unlocked()?;
        self.quality_scores = scores;
        Ok(())
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<()> {
        self.check_unlocked()?;
        if !(threshold > 0.0) || !threshold.is_finite() {
            return Err(PositioningError::InvalidArgument(format!(
                "threshold must be finite and positive, got {threshold}"
            )));
        }
        self.threshold = threshold;
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: f64) -> Result<()> {
        self.check_unlocked()?;
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(PositioningError::InvalidArgument(format!(
                "confidence must be in (0, 1), got {confidence}"
            )));
        }
        self.confidence = confidence;
        Ok(())
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        self.check_unlocked()?;
        if max_iterations == 0 {
            return Err(PositioningError::InvalidArgument(
                "max iterations must be at least 1".into(),
            ));
        }
        self.max_iterations = max_iterations;
        Ok(())
    }

    pub fn set_stop_threshold(&mut self, stop_threshold: f64) -> Result<()> {
        self.check_unlocked()?;
        if !(stop_threshold > 0.0) {
            return Err(PositioningError::InvalidArgument(
                "stop threshold must be positive".into(),
            ));
        }
        self.stop_threshold = stop_threshold;
        Ok(())
    }

    pub fn set_progress_delta(&mut self, progress_delta: f64) -> Result<()> {
        self.check_unlocked()?;
        if !(progress_delta > 0.0 && progress_delta <= 1.0) {
            return Err(PositioningError::InvalidArgument(format!(
                "progress delta must be in (0, 1], got {progress_delta}"
            )));
        }
        self.progress_delta = progress_delta;
        Ok(())
    }

    pub fn set_refine_result(&mut self, refine: bool) -> Result<()> {
        self.check_unlocked()?;
        self.refine_result = refine;
        Ok(())
    }

    pub fn set_keep_covariance(&mut self, keep: bool) -> Result<()> {
        self.check_unlocked()?;
        self.keep_covariance = keep;
        Ok(())
    }

    pub fn set_preliminary_subset_size(&mut self, size: Option<usize>) -> Result<()> {
        self.check_unlocked()?;
        if size == Some(0) {
            return Err(PositioningError::InvalidArgument(
                "preliminary subset size must be at least 1".into(),
            ));
        }
        self.preliminary_subset_size = size;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) -> Result<()> {
        self.check_unlocked()?;
        self.seed = seed;
        Ok(())
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn EstimatorListener>>) -> Result<()> {
        self.check_unlocked()?;
        self.listener = listener;
        Ok(())
    }

    pub fn set_cancel_token(&mut self, token: Option<CancelToken>) -> Result<()> {
        self.check_unlocked()?;
        self.cancel = token;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.running
    }

    pub fn min_readings(&self) -> Option<usize> {
        self.sources.first().map(|s| s.position().dim() + 1)
    }

    fn subset_size(&self, min_readings: usize) -> usize {
        self.preliminary_subset_size
            .unwrap_or(min_readings)
            .max(min_readings)
    }

    pub fn is_ready(&self) -> bool {
        self.prepare().is_ok()
    }

    /// Validate the configuration and reduce the readings to range rows.
    fn prepare(&self) -> Result<(Vec<RangeRow>, Vec<f64>)> {
        if let Some(scores) = &self.quality_scores {
            if scores.len() != self.readings.len() {
                return Err(PositioningError::InvalidArgument(format!(
                    "{} quality scores for {} readings",
                    scores.len(),
                    self.readings.len()
                )));
            }
        }
        if self.method.requires_quality_scores() && self.quality_scores.is_none() {
            return Err(PositioningError::NotReady(format!(
                "{:?} requires per-reading quality scores",
                self.method
            )));
        }
        let min = self
            .min_readings()
            .ok_or_else(|| PositioningError::NotReady("no located sources".into()))?;
        let dim = self.sources[0].position().dim();
        if self.sources.iter().any(|s| s.position().dim() != dim) {
            return Err(PositioningError::InvalidArgument(
                "all source positions must share one dimension".into(),
            ));
        }

        let (rows, kept) = build_rows(&self.sources, &self.readings)?;
        if rows.len() < self.subset_size(min) {
            return Err(PositioningError::NotReady(format!(
                "{} matched readings required, got {}",
                self.subset_size(min),
                rows.len()
            )));
        }
        // Quality scores follow the readings that survived source matching.
        let quality: Vec<f64> = match &self.quality_scores {
            Some(scores) => kept.iter().map(|&i| scores[i]).collect(),
            None => Vec::new(),
        };
        Ok((rows, quality))
    }

    pub fn estimate(&mut self) -> Result<ReceiverEstimate> {
        if self.running {
            return Err(PositioningError::Locked);
        }
        let (rows, quality) = self.prepare()?;
        self.result = None;
        self.inliers = None;
        self.iterations = None;

        self.running = true;
        if let Some(listener) = &self.listener {
            listener.on_start();
        }
        let outcome = self.run_robust(&rows, &quality);
        self.running = false;
        if let Some(listener) = &self.listener {
            listener.on_end();
        }

        let (estimate, inliers, iterations) = outcome?;
        self.result = Some(estimate.clone());
        self.inliers = Some(inliers);
        self.iterations = Some(iterations);
        Ok(estimate)
    }

    fn run_robust(
        &self,
        rows: &[RangeRow],
        quality: &[f64],
    ) -> Result<(ReceiverEstimate, Vec<bool>, usize)> {
        let min = self
            .min_readings()
            .expect("validated: sources are non-empty");
        let settings = RobustSettings {
            method: self.method,
            threshold: self.threshold,
            confidence: self.confidence,
            max_iterations: self.max_iterations,
            stop_threshold: self.stop_threshold,
            progress_delta: self.progress_delta,
            subset_size: self.subset_size(min),
            seed: self.seed,
        };

        let mut solve = |subset: &[usize]| -> Result<LaterationSolution> {
            let anchors: Vec<Point> =
                subset.iter().map(|&i| rows[i].anchor.clone()).collect();
            let distances: Vec<f64> = subset.iter().map(|&i| rows[i].distance).collect();
            let stds: Vec<f64> = subset.iter().map(|&i| rows[i].sigma).collect();
            nonlinear_lateration(&anchors, &distances, Some(&stds), None)
        };
        let mut residuals = |candidate: &LaterationSolution| -> Result<Vec<f64>> {
            Ok(rows
                .iter()
                .map(|row| {
                    (row.distance - candidate.position.distance_to(&row.anchor)).abs()
                        / row.sigma
                })
                .collect())
        };

        let RobustOutcome {
            candidate,
            inliers,
            iterations,
        } = run_loop(
            &settings,
            rows.len(),
            (!quality.is_empty()).then_some(quality),
            &mut solve,
            &mut residuals,
            self.listener.as_ref(),
            self.cancel.as_ref(),
        )?;

        let (estimate, inliers) = self.refine(rows, candidate, inliers, min)?;
        Ok((estimate, inliers, iterations))
    }

    fn refine(
        &self,
        rows: &[RangeRow],
        preliminary: LaterationSolution,
        inliers: Vec<bool>,
        min: usize,
    ) -> Result<(ReceiverEstimate, Vec<bool>)> {
        let chosen: Vec<&RangeRow> = rows
            .iter()
            .zip(&inliers)
            .filter(|(_, keep)| **keep)
            .map(|(row, _)| row)
            .collect();

        if !self.refine_result || chosen.len() < min {
            let mut estimate = ReceiverEstimate::from(preliminary);
            estimate.covariance = None;
            return Ok((estimate, inliers));
        }

        let anchors: Vec<Point> = chosen.iter().map(|r| r.anchor.clone()).collect();
        let distances: Vec<f64> = chosen.iter().map(|r| r.distance).collect();
        let stds: Vec<f64> = chosen.iter().map(|r| r.sigma).collect();
        match nonlinear_lateration(
            &anchors,
            &distances,
            Some(&stds),
            Some(&preliminary.position),
        ) {
            Ok(refined) => {
                let residuals: Vec<f64> = rows
                    .iter()
                    .map(|row| {
                        (row.distance - refined.position.distance_to(&row.anchor)).abs()
                            / row.sigma
                    })
                    .collect();
                let inliers = self.method.inlier_mask(&residuals, self.threshold);
                let mut estimate = ReceiverEstimate::from(refined);
                if !self.keep_covariance {
                    estimate.covariance = None;
                }
                Ok((estimate, inliers))
            }
            Err(e) => {
                debug!("refinement failed, keeping preliminary candidate: {e}");
                let mut estimate = ReceiverEstimate::from(preliminary);
                estimate.covariance = None;
                Ok((estimate, inliers))
            }
        }
    }

    pub fn estimated(&self) -> Option<&ReceiverEstimate> {
        self.result.as_ref()
    }

    pub fn estimated_position(&self) -> Option<&Point> {
        self.result.as_ref().map(|e| &e.position)
    }

    pub fn position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.result.as_ref().and_then(|e| e.covariance.as_ref())
    }

    /// Inlier mask over the readings that matched a located source, in
    /// reading order.
    pub fn inliers(&self) -> Option<&[bool]> {
        self.inliers.as_deref()
    }

    pub fn iterations(&self) -> Option<usize> {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::received_power_dbm;
    use crate::schema::{Bssid, RadioSource};
    use approx::assert_relative_eq;

    const FREQUENCY: f64 = 2.4e9;

    fn ap(last: u8) -> RadioSource {
        RadioSource::access_point(Bssid::new([0, 0, 0, 0, 0, last]), FREQUENCY)
    }

    fn square_sources() -> Vec<LocatedSource> {
        [
            (1, Point::xy(0.0, 0.0)),
            (2, Point::xy(10.0, 0.0)),
            (3, Point::xy(0.0, 10.0)),
            (4, Point::xy(10.0, 10.0)),
        ]
        .into_iter()
        .map(|(id, p)| LocatedSource::new(ap(id), p, -10.0, 2.0).unwrap())
        .collect()
    }

    fn ranging_readings(sources: &[LocatedSource], truth: &Point) -> Vec<Reading> {
        sources
            .iter()
            .map(|s| {
                let d = truth.distance_to(s.position());
                Reading::ranging_with_std(s.source().clone(), d, Some(0.01), 1, 1).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_ranging_receiver_position() {
        let sources = square_sources();
        let truth = Point::xy(5.0, 5.0);
        let readings = ranging_readings(&sources, &truth);
        let mut estimator = ReceiverEstimator::new()
            .with_sources(sources)
            .with_readings(readings);
        assert!(estimator.is_ready());

        let estimate = estimator.estimate().unwrap();
        assert_relative_eq!(estimate.position.get(0), 5.0, epsilon = 1e-6);
        assert_relative_eq!(estimate.position.get(1), 5.0, epsilon = 1e-6);
        let cov = estimate.covariance.expect("covariance");
        assert!(cov.trace() < 1e-3);
    }

    #[test]
    fn test_rssi_readings_reduce_to_distances() {
        let sources = square_sources();
        let truth = Point::xy(3.0, 4.0);
        let readings: Vec<Reading> = sources
            .iter()
            .map(|s| {
                let d = truth.distance_to(s.position());
                let rssi = received_power_dbm(d, -10.0, 2.0, FREQUENCY).unwrap();
                Reading::rssi(s.source().clone(), rssi).unwrap()
            })
            .collect();
        let mut estimator = ReceiverEstimator::new()
            .with_sources(sources)
            .with_readings(readings);
        let estimate = estimator.estimate().unwrap();
        assert_relative_eq!(estimate.position.get(0), 3.0, epsilon = 1e-5);
        assert_relative_eq!(estimate.position.get(1), 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_combined_reading_blends_channels() {
        let source =
            LocatedSource::new(ap(1), Point::xy(0.0, 0.0), -10.0, 2.0).unwrap();
        // Ranging says 4 m (σ 1 m), RSSI says the power seen at 5 m
        // (σ 1 dB → σ_d ≈ 0.58 m at 5 m). The blend lands between, closer
        // to the tighter RSSI-implied distance.
        let rssi = received_power_dbm(5.0, -10.0, 2.0, FREQUENCY).unwrap();
        let reading =
            Reading::ranging_and_rssi(ap(1), 4.0, None, 1, 1, rssi, None).unwrap();
        let (distance, sigma) = effective_range(&reading, &source).unwrap();
        assert!(distance > 4.0 && distance < 5.0);
        assert!(distance > 4.5);
        assert!(sigma < 1.0);
    }

    #[test]
    fn test_unknown_sources_are_skipped() {
        let sources = square_sources();
        let truth = Point::xy(5.0, 5.0);
        let mut readings = ranging_readings(&sources, &truth);
        readings.push(Reading::ranging(ap(99), 1.0).unwrap());
        let mut estimator = ReceiverEstimator::new()
            .with_sources(sources)
            .with_readings(readings);
        let estimate = estimator.estimate().unwrap();
        assert_relative_eq!(estimate.position.get(0), 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_matched_readings_not_ready() {
        let sources = square_sources();
        let readings = vec![Reading::ranging(ap(1), 5.0).unwrap()];
        let mut estimator = RobustReceiverEstimator::new(RobustMethod::Ransac)
            .with_sources(sources)
            .with_readings(readings);
        assert!(!estimator.is_ready());
        assert!(matches!(
            estimator.estimate(),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_robust_receiver_rejects_outlier_ranges() {
        let sources: Vec<LocatedSource> = (0..8)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::FRAC_PI_4;
                LocatedSource::new(
                    ap(i as u8 + 1),
                    Point::xy(10.0 * angle.cos(), 10.0 * angle.sin()),
                    -10.0,
                    2.0,
                )
                .unwrap()
            })
            .collect();
        let truth = Point::xy(1.0, 2.0);
        let mut readings = ranging_readings(&sources, &truth);
        // Corrupt two readings with gross range errors.
        readings[1] =
            Reading::ranging_with_std(sources[1].source().clone(), 40.0, Some(0.01), 1, 1)
                .unwrap();
        readings[5] =
            Reading::ranging_with_std(sources[5].source().clone(), 33.0, Some(0.01), 1, 1)
                .unwrap();

        let mut estimator = RobustReceiverEstimator::new(RobustMethod::Ransac)
            .with_sources(sources)
            .with_readings(readings);
        let estimate = estimator.estimate().unwrap();
        assert_relative_eq!(estimate.position.get(0), 1.0, epsilon = 1e-3);
        assert_relative_eq!(estimate.position.get(1), 2.0, epsilon = 1e-3);

        let inliers = estimator.inliers().unwrap();
        assert!(!inliers[1]);
        assert!(!inliers[5]);
        assert_eq!(inliers.iter().filter(|m| **m).count(), 6);
    }
}
