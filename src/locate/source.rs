//! Radio-source estimation from located readings, with and without a robust
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
use crate::fitting::{fit_source, reading_residual, SourceFit, SourceFitConfig};
use crate::geometry::Point;
use crate::listener::EstimatorListener;
use crate::robust::{run_loop, RobustMethod, RobustOutcome, RobustSettings};
use crate::schema::LocatedReading;

/// Plain (non-robust) source estimator: one least-squares fit over all
/// readings.
#[derive(Default)]
pub struct SourceEstimator {
    readings: Vec<LocatedReading>,
    config: SourceFitConfig,
    result: Option<SourceFit>,
}

impl SourceEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(mut self, readings: Vec<LocatedReading>) -> Self {
        self.readings = readings;
        self
    }

    pub fn with_config(mut self, config: SourceFitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn readings(&self) -> &[LocatedReading] {
        &self.readings
    }

    pub fn config(&self) -> &SourceFitConfig {
        &self.config
    }

    /// Minimum readings for the configured switches, or `None` while no
    /// reading fixes the dimension.
    pub fn min_readings(&self) -> Option<usize> {
        self.readings
            .first()
            .map(|r| self.config.min_readings(r.position().dim()))
    }

    pub fn is_ready(&self) -> bool {
        self.min_readings()
            .is_some_and(|min| self.readings.len() >= min)
    }

    pub fn estimate(&mut self) -> Result<SourceFit> {
        let fit = fit_source(&self.readings, &self.config)?;
        self.result = Some(fit.clone());
        Ok(fit)
    }

    pub fn estimated(&self) -> Option<&SourceFit> {
        self.result.as_ref()
    }
}

/// Robust source estimator: samples reading subsets, fits each with the
/// inner estimator, keeps the best candidate under the configured method and
/// optionally refines it over the consensus set.
///
/// The estimator is a state machine: mutation is rejected with
/// [`PositioningError::Locked`] while `estimate()` runs, and results are
/// cleared at the start of every run.
pub struct RobustSourceEstimator {
    method: RobustMethod,
    readings: Vec<LocatedReading>,
    fit_config: SourceFitConfig,
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
    result: Option<SourceFit>,
    inliers: Option<Vec<bool>>,
    iterations: Option<usize>,
}

impl RobustSourceEstimator {
    pub fn new(method: RobustMethod) -> Self {
        Self {
            method,
            readings: Vec::new(),
            fit_config: SourceFitConfig::default(),
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

    pub fn with_readings(mut self, readings: Vec<LocatedReading>) -> Self {
        self.readings = readings;
        self
    }

    pub fn with_config(mut self, config: SourceFitConfig) -> Self {
        self.fit_config = config;
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

    pub fn method(&self) -> RobustMethod {
        self.method
    }

    pub fn set_readings(&mut self, readings: Vec<LocatedReading>) -> Result<()> {
        self.check_unlocked()?;
        self.readings = readings;
        Ok(())
    }

    pub fn set_fit_config(&mut self, config: SourceFitConfig) -> Result<()> {
        self.check_unlocked()?;
        self.fit_config = config;
        Ok(())
    }

    pub fn set_quality_scores(&mut self, scores: Option<Vec<f64>>) -> Result<()> {
        self.check_unlocked()?;
        self.quality_scores = scores;
        Ok(())
    }

    /// Residual threshold τ in normalized residual units; must be positive.
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

    /// Size of the subsets handed to the inner estimator. Values below the
    /// inner minimum are raised to it at run time.
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

    /// Minimum readings for the configured switches, or `None` while no
    /// reading fixes the dimension.
    pub fn min_readings(&self) -> Option<usize> {
        self.readings
            .first()
            .map(|r| self.fit_config.min_readings(r.position().dim()))
    }

    fn subset_size(&self, min_readings: usize) -> usize {
        self.preliminary_subset_size
            .unwrap_or(min_readings)
            .max(min_readings)
    }

    fn validate_ready(&self) -> Result<()> {
        if let Some(scores) = &self.quality_scores {
            if scores.len() != self.readings.len() {
                return Err(PositioningError::InvalidArgument(format!(
                    "{} quality scores for {} readings",
                    scores.len(),
                    self.readings.len()
                )));
            }
        }
        let min = self.min_readings().ok_or_else(|| {
            PositioningError::NotReady("no readings".into())
        })?;
        let needed = self.subset_size(min);
        if self.readings.len() < needed {
            return Err(PositioningError::NotReady(format!(
                "{needed} readings required, got {}",
                self.readings.len()
            )));
        }
        if self.method.requires_quality_scores() && self.quality_scores.is_none() {
            return Err(PositioningError::NotReady(format!(
                "{:?} requires per-reading quality scores",
                self.method
            )));
        }
        let dim = self.readings[0].position().dim();
        if self.readings.iter().any(|r| r.position().dim() != dim) {
            return Err(PositioningError::InvalidArgument(
                "all reading positions must share one dimension".into(),
            ));
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.validate_ready().is_ok()
    }

    /// Run the robust loop. Clears previous results first; on failure all
    /// accessors stay empty.
    pub fn estimate(&mut self) -> Result<SourceFit> {
        if self.running {
            return Err(PositioningError::Locked);
        }
        self.validate_ready()?;
        self.result = None;
        self.inliers = None;
        self.iterations = None;

        self.running = true;
        if let Some(listener) = &self.listener {
            listener.on_start();
        }
        let outcome = self.run_robust();
        self.running = false;
        if let Some(listener) = &self.listener {
            listener.on_end();
        }

        let (fit, inliers, iterations) = outcome?;
        self.result = Some(fit.clone());
        self.inliers = Some(inliers);
        self.iterations = Some(iterations);
        Ok(fit)
    }

    fn run_robust(&self) -> Result<(SourceFit, Vec<bool>, usize)> {
        let min = self
            .min_readings()
            .expect("validated: readings are non-empty");
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

        // Subsets are solved without the chi-squared gate; outlier rejection
        // is the outer loop's job.
        let mut subset_config = self.fit_config.clone();
        subset_config.chi_squared_threshold = None;

        let readings = &self.readings;
        let use_covariances = self.fit_config.use_reading_position_covariances;
        let mut solve = |subset: &[usize]| -> Result<SourceFit> {
            let sample: Vec<LocatedReading> =
                subset.iter().map(|&i| readings[i].clone()).collect();
            fit_source(&sample, &subset_config)
        };
        let mut residuals = |fit: &SourceFit| -> Result<Vec<f64>> {
            readings
                .iter()
                .map(|r| {
                    reading_residual(
                        r,
                        &fit.position,
                        fit.transmitted_power_dbm,
                        fit.path_loss_exponent,
                        use_covariances,
                    )
                })
                .collect()
        };

        let RobustOutcome {
            candidate,
            inliers,
            iterations,
        } = run_loop(
            &settings,
            readings.len(),
            self.quality_scores.as_deref(),
            &mut solve,
            &mut residuals,
            self.listener.as_ref(),
            self.cancel.as_ref(),
        )?;

        let (fit, inliers) = self.refine(candidate, inliers)?;
        Ok((fit, inliers, iterations))
    }

    fn refine(&self, preliminary: SourceFit, inliers: Vec<bool>) -> Result<(SourceFit, Vec<bool>)> {
        let min = self
            .min_readings()
            .expect("validated: readings are non-empty");
        let inlier_readings: Vec<LocatedReading> = self
            .readings
            .iter()
            .zip(&inliers)
            .filter(|(_, keep)| **keep)
            .map(|(r, _)| r.clone())
            .collect();

        if !self.refine_result || inlier_readings.len() < min {
            return Ok((strip_covariance(preliminary), inliers));
        }

        let mut config = self.fit_config.clone();
        config.initial_position = Some(preliminary.position.clone());
        config.initial_transmitted_power_dbm = Some(preliminary.transmitted_power_dbm);
        config.initial_path_loss_exponent = preliminary.path_loss_exponent;

        match fit_source(&inlier_readings, &config) {
            Ok(mut refined) => {
                // Re-evaluate the consensus against the refined candidate so
                // the reported inliers satisfy the method's test on the
                // returned estimate.
                let residuals: Result<Vec<f64>> = self
                    .readings
                    .iter()
                    .map(|r| {
                        reading_residual(
                            r,
                            &refined.position,
                            refined.transmitted_power_dbm,
                            refined.path_loss_exponent,
                            self.fit_config.use_reading_position_covariances,
                        )
                    })
                    .collect();
                let inliers = match residuals {
                    Ok(r) => self.method.inlier_mask(&r, self.threshold),
                    Err(_) => inliers,
                };
                if !self.keep_covariance {
                    refined = strip_covariance(refined);
                }
                Ok((refined, inliers))
            }
            Err(e) => {
                debug!("refinement failed, keeping preliminary candidate: {e}");
                Ok((strip_covariance(preliminary), inliers))
            }
        }
    }

    pub fn estimated(&self) -> Option<&SourceFit> {
        self.result.as_ref()
    }

    pub fn estimated_position(&self) -> Option<&Point> {
        self.result.as_ref().map(|f| &f.position)
    }

    pub fn estimated_transmitted_power_dbm(&self) -> Option<f64> {
        self.result.as_ref().map(|f| f.transmitted_power_dbm)
    }

    pub fn estimated_path_loss_exponent(&self) -> Option<f64> {
        self.result.as_ref().map(|f| f.path_loss_exponent)
    }

    pub fn position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.result.as_ref().and_then(|f| f.position_covariance.as_ref())
    }

    /// Per-reading inlier mask of the last successful run.
    pub fn inliers(&self) -> Option<&[bool]> {
        self.inliers.as_deref()
    }

    /// Outer-loop iterations of the last successful run.
    pub fn iterations(&self) -> Option<usize> {
        self.iterations
    }
}

fn strip_covariance(mut fit: SourceFit) -> SourceFit {
    fit.covariance = None;
    fit.position_covariance = None;
    fit.transmitted_power_variance = None;
    fit.path_loss_exponent_variance = None;
    fit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::received_power_dbm;
    use crate::schema::{Bssid, RadioSource, Reading};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const FREQUENCY: f64 = 2.4e9;

    fn source() -> RadioSource {
        RadioSource::access_point(Bssid::new([0xaa, 0, 0, 0, 0, 7]), FREQUENCY)
    }

    fn clean_readings_2d(truth: &Point, power: f64, n: f64, count: usize) -> Vec<LocatedReading> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..count)
            .map(|_| {
                let p = Point::xy(rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0));
                let d = truth.distance_to(&p);
                let rssi = received_power_dbm(d, power, n, FREQUENCY).unwrap();
                LocatedReading::new(Reading::rssi(source(), rssi).unwrap(), p)
            })
            .collect()
    }

    fn with_outliers(mut readings: Vec<LocatedReading>, count: usize) -> Vec<LocatedReading> {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..count {
            let p = Point::xy(rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0));
            let rssi = rng.gen_range(-30.0..-20.0);
            readings.push(LocatedReading::new(
                Reading::rssi(source(), rssi).unwrap(),
                p,
            ));
        }
        readings
    }

    #[test]
    fn test_ransac_rejects_outliers_2d() {
        let truth = Point::xy(2.0, -1.0);
        let readings = with_outliers(clean_readings_2d(&truth, -10.0, 2.0, 30), 10);
        let mut estimator =
            RobustSourceEstimator::new(RobustMethod::Ransac).with_readings(readings);

        let fit = estimator.estimate().unwrap();
        assert_relative_eq!(fit.position.get(0), 2.0, epsilon = 0.05);
        assert_relative_eq!(fit.position.get(1), -1.0, epsilon = 0.05);
        assert_relative_eq!(fit.transmitted_power_dbm, -10.0, epsilon = 0.2);

        let inliers = estimator.inliers().unwrap();
        assert_eq!(inliers.len(), 40);
        assert!(inliers[..30].iter().all(|m| *m));
        assert!(estimator.iterations().unwrap() >= 1);
        assert!(estimator.position_covariance().is_some());
    }

    #[test]
    fn test_not_ready_below_min_readings() {
        let truth = Point::xy(2.0, -1.0);
        // Position + power in 2D needs four readings.
        let readings = clean_readings_2d(&truth, -10.0, 2.0, 3);
        let mut estimator =
            RobustSourceEstimator::new(RobustMethod::Ransac).with_readings(readings);
        assert!(!estimator.is_ready());
        assert!(matches!(
            estimator.estimate(),
            Err(PositioningError::NotReady(_))
        ));
        assert!(estimator.estimated_position().is_none());
    }

    #[test]
    fn test_quality_score_length_mismatch_is_invalid() {
        let truth = Point::xy(2.0, -1.0);
        let readings = clean_readings_2d(&truth, -10.0, 2.0, 10);
        let mut estimator = RobustSourceEstimator::new(RobustMethod::Prosac)
            .with_readings(readings)
            .with_quality_scores(vec![1.0; 4]);
        assert!(matches!(
            estimator.estimate(),
            Err(PositioningError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_prosac_without_scores_is_not_ready() {
        let truth = Point::xy(2.0, -1.0);
        let readings = clean_readings_2d(&truth, -10.0, 2.0, 10);
        let mut estimator =
            RobustSourceEstimator::new(RobustMethod::Promeds).with_readings(readings);
        assert!(matches!(
            estimator.estimate(),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_estimate_twice_is_identical() {
        let truth = Point::xy(2.0, -1.0);
        let readings = with_outliers(clean_readings_2d(&truth, -10.0, 2.0, 20), 5);
        let mut estimator =
            RobustSourceEstimator::new(RobustMethod::Msac).with_readings(readings);

        let first = estimator.estimate().unwrap();
        let first_inliers = estimator.inliers().unwrap().to_vec();
        let second = estimator.estimate().unwrap();

        assert_eq!(
            first.position.get(0).to_bits(),
            second.position.get(0).to_bits()
        );
        assert_eq!(
            first.transmitted_power_dbm.to_bits(),
            second.transmitted_power_dbm.to_bits()
        );
        assert_eq!(first_inliers, estimator.inliers().unwrap());
    }

    #[test]
    fn test_setters_validate_ranges() {
        let mut estimator = RobustSourceEstimator::new(RobustMethod::Ransac);
        assert!(estimator.set_confidence(0.0).is_err());
        assert!(estimator.set_confidence(1.0).is_err());
        assert!(estimator.set_confidence(0.95).is_ok());
        assert!(estimator.set_threshold(-1.0).is_err());
        assert!(estimator.set_max_iterations(0).is_err());
        assert!(estimator.set_progress_delta(0.0).is_err());
        assert!(estimator.set_progress_delta(1.0).is_ok());
        assert!(estimator.set_preliminary_subset_size(Some(0)).is_err());
        assert!(!estimator.is_locked());
    }

    #[test]
    fn test_refinement_disabled_drops_covariance() {
        let truth = Point::xy(2.0, -1.0);
        let readings = clean_readings_2d(&truth, -10.0, 2.0, 20);
        let mut estimator =
            RobustSourceEstimator::new(RobustMethod::Ransac).with_readings(readings);
        estimator.set_refine_result(false).unwrap();
        let fit = estimator.estimate().unwrap();
        assert!(fit.position_covariance.is_none());
        assert_relative_eq!(fit.position.get(0), 2.0, epsilon = 0.05);
    }
}
