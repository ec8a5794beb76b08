//! Least-squares fit of a radio source's position, transmitted power and
//! path-loss exponent to a set of located readings.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::constants::{DEFAULT_PATH_LOSS_EXPONENT, MIN_DISTANCE};
use crate::errors::{PositioningError, Result};
use crate::fitting::lateration;
use crate::fitting::levenberg::{solve_least_squares, LeastSquaresProblem};
use crate::geometry::{centroid, Point};
use crate::propagation::{
    d_power_d_coordinate, d_power_d_exponent, distance_from_rssi, frequency_constant_db,
};
use crate::schema::LocatedReading;

/// Which source parameters the fit estimates, and where it starts from.
///
/// At least one switch must be on; a switched-off parameter is held fixed at
/// its initial value. Estimating all three at once is allowed but the joint
/// position/power/exponent problem is poorly conditioned on typical indoor
/// data; prefer fixing one of them.
#[derive(Debug, Clone)]
pub struct SourceFitConfig {
    pub position_estimation_enabled: bool,
    pub transmitted_power_estimation_enabled: bool,
    pub path_loss_estimation_enabled: bool,
    /// Seed (or fixed value, when position estimation is off).
    pub initial_position: Option<Point>,
    /// Seed (or fixed value, when power estimation is off). When absent it
    /// is derived from the RSSI readings.
    pub initial_transmitted_power_dbm: Option<f64>,
    /// Seed (or fixed value, when exponent estimation is off).
    pub initial_path_loss_exponent: f64,
    /// Propagate per-reading location covariance into the residual weights
    /// by first-order linearization around the initial estimate.
    pub use_reading_position_covariances: bool,
    /// When set, readings whose squared normalized residual exceeds this
    /// value after the first fit are dropped and the fit re-run once.
    pub chi_squared_threshold: Option<f64>,
}

impl Default for SourceFitConfig {
    fn default() -> Self {
        Self {
            position_estimation_enabled: true,
            transmitted_power_estimation_enabled: true,
            path_loss_estimation_enabled: false,
            initial_position: None,
            initial_transmitted_power_dbm: None,
            initial_path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            use_reading_position_covariances: false,
            chi_squared_threshold: None,
        }
    }
}

impl SourceFitConfig {
    /// Number of scalar parameters the fit estimates for dimension `dim`.
    pub fn estimated_param_count(&self, dim: usize) -> usize {
        let mut count = 0;
        if self.position_estimation_enabled {
            count += dim;
        }
        if self.transmitted_power_estimation_enabled {
            count += 1;
        }
        if self.path_loss_estimation_enabled {
            count += 1;
        }
        count
    }

    /// Minimum number of readings required for dimension `dim`.
    pub fn min_readings(&self, dim: usize) -> usize {
        self.estimated_param_count(dim) + 1
    }
}

/// Result of a source fit.
#[derive(Debug, Clone)]
pub struct SourceFit {
    pub position: Point,
    pub transmitted_power_dbm: f64,
    pub path_loss_exponent: f64,
    /// Covariance over the estimated parameters, ordered position
    /// coordinates first, then power, then exponent.
    pub covariance: Option<DMatrix<f64>>,
    /// D×D block of [`covariance`](Self::covariance) for the position, when
    /// position was estimated.
    pub position_covariance: Option<DMatrix<f64>>,
    pub transmitted_power_variance: Option<f64>,
    pub path_loss_exponent_variance: Option<f64>,
    pub residual_norm: f64,
    pub chi2: f64,
    pub iterations: usize,
}

#[derive(Clone, Copy)]
struct ParamLayout {
    dim: usize,
    position: bool,
    power: bool,
    exponent: bool,
}

impl ParamLayout {
    fn count(&self) -> usize {
        (if self.position { self.dim } else { 0 })
            + usize::from(self.power)
            + usize::from(self.exponent)
    }

    fn power_index(&self) -> Option<usize> {
        self.power
            .then(|| if self.position { self.dim } else { 0 })
    }

    fn exponent_index(&self) -> Option<usize> {
        self.exponent.then(|| {
            (if self.position { self.dim } else { 0 }) + usize::from(self.power)
        })
    }
}

enum Row {
    Ranging {
        anchor: DVector<f64>,
        distance: f64,
        sigma: f64,
    },
    Rssi {
        anchor: DVector<f64>,
        rssi_dbm: f64,
        k_db: f64,
        sigma: f64,
    },
}

struct SourceModel {
    rows: Vec<Row>,
    layout: ParamLayout,
    fixed_position: DVector<f64>,
    fixed_power: f64,
    fixed_exponent: f64,
}

impl SourceModel {
    fn unpack(&self, params: &DVector<f64>) -> (DVector<f64>, f64, f64) {
        let layout = &self.layout;
        let position = if layout.position {
            params.rows(0, layout.dim).into_owned()
        } else {
            self.fixed_position.clone()
        };
        let power = layout
            .power_index()
            .map_or(self.fixed_power, |i| params[i]);
        let exponent = layout
            .exponent_index()
            .map_or(self.fixed_exponent, |i| params[i]);
        (position, power, exponent)
    }
}

impl LeastSquaresProblem for SourceModel {
    fn num_residuals(&self) -> usize {
        self.rows.len()
    }

    fn num_params(&self) -> usize {
        self.layout.count()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let (position, power, exponent) = self.unpack(params);
        DVector::from_iterator(
            self.rows.len(),
            self.rows.iter().map(|row| match row {
                Row::Ranging {
                    anchor,
                    distance,
                    sigma,
                } => {
                    let predicted = (&position - anchor).norm().max(MIN_DISTANCE);
                    (distance - predicted) / sigma
                }
                Row::Rssi {
                    anchor,
                    rssi_dbm,
                    k_db,
                    sigma,
                } => {
                    let d = (&position - anchor).norm().max(MIN_DISTANCE);
                    let predicted = power + k_db - 10.0 * exponent * d.log10();
                    (rssi_dbm - predicted) / sigma
                }
            }),
        )
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let (position, _power, exponent) = self.unpack(params);
        let layout = &self.layout;
        let mut jacobian = DMatrix::zeros(self.rows.len(), layout.count());
        for (i, row) in self.rows.iter().enumerate() {
            match row {
                Row::Ranging { anchor, sigma, .. } => {
                    let delta = &position - anchor;
                    let d = delta.norm().max(MIN_DISTANCE);
                    if layout.position {
                        for j in 0..layout.dim {
                            // r = (y − ‖s − a‖)/σ
                            jacobian[(i, j)] = -delta[j] / (d * sigma);
                        }
                    }
                }
                Row::Rssi { anchor, sigma, .. } => {
                    let delta = &position - anchor;
                    let d = delta.norm().max(MIN_DISTANCE);
                    if layout.position {
                        for j in 0..layout.dim {
                            jacobian[(i, j)] =
                                -d_power_d_coordinate(delta[j], d, exponent) / sigma;
                        }
                    }
                    if let Some(k) = layout.power_index() {
                        jacobian[(i, k)] = -1.0 / sigma;
                    }
                    if let Some(k) = layout.exponent_index() {
                        jacobian[(i, k)] = -d_power_d_exponent(d) / sigma;
                    }
                }
            }
        }
        jacobian
    }
}

fn check_dimensions(readings: &[LocatedReading]) -> Result<usize> {
    let first = readings.first().ok_or_else(|| {
        PositioningError::NotReady("no readings".into())
    })?;
    let dim = first.position().dim();
    if readings.iter().any(|r| r.position().dim() != dim) {
        return Err(PositioningError::InvalidArgument(
            "all reading positions must share one dimension".into(),
        ));
    }
    Ok(dim)
}

/// Variance added to a row's measurement by the reading's own location
/// uncertainty, linearized at the current estimate.
fn location_variance(
    covariance: &DMatrix<f64>,
    gradient: &DVector<f64>,
) -> f64 {
    (gradient.transpose() * covariance * gradient)[(0, 0)].max(0.0)
}

fn build_rows(
    readings: &[LocatedReading],
    config: &SourceFitConfig,
    seed_position: &DVector<f64>,
    seed_exponent: f64,
) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(readings.len());
    for reading in readings {
        let anchor = reading.position().coords().clone_owned();
        let delta = seed_position - &anchor;
        let d = delta.norm().max(MIN_DISTANCE);

        if let Some(distance) = reading.reading().distance() {
            let mut variance = reading
                .reading()
                .effective_ranging_std()
                .map(|s| s * s)
                .unwrap_or(1.0);
            if config.use_reading_position_covariances {
                if let Some(cov) = reading.covariance() {
                    let gradient = delta.map(|c| c / d);
                    variance += location_variance(cov, &gradient);
                }
            }
            rows.push(Row::Ranging {
                anchor: anchor.clone(),
                distance,
                sigma: variance.sqrt(),
            });
        }

        if let Some(rssi_dbm) = reading.reading().rssi_dbm() {
            let k_db = frequency_constant_db(reading.source().frequency_hz())?;
            let mut variance = reading
                .reading()
                .effective_rssi_std()
                .map(|s| s * s)
                .unwrap_or(1.0);
            if config.use_reading_position_covariances {
                if let Some(cov) = reading.covariance() {
                    let gradient = DVector::from_iterator(
                        delta.len(),
                        delta.iter().map(|&c| d_power_d_coordinate(c, d, seed_exponent)),
                    );
                    variance += location_variance(cov, &gradient);
                }
            }
            rows.push(Row::Rssi {
                anchor,
                rssi_dbm,
                k_db,
                sigma: variance.sqrt(),
            });
        }
    }
    Ok(rows)
}

/// Seed the source position from the readings when the caller gave none:
/// a closed-form lateration over the implied distances when only the
/// position is estimated, the centroid of the reading locations otherwise.
fn seed_position(
    readings: &[LocatedReading],
    config: &SourceFitConfig,
    dim: usize,
) -> Result<DVector<f64>> {
    if let Some(p) = &config.initial_position {
        if p.dim() != dim {
            return Err(PositioningError::InvalidArgument(
                "initial position dimension does not match the readings".into(),
            ));
        }
        return Ok(p.coords().clone_owned());
    }
    if !config.position_estimation_enabled {
        return Err(PositioningError::NotReady(
            "an initial position is required when position estimation is disabled".into(),
        ));
    }

    let position_only = !config.transmitted_power_estimation_enabled
        && !config.path_loss_estimation_enabled;
    if position_only {
        if let Some(seed) = lateration_seed(readings, config, dim) {
            return Ok(seed);
        }
    }
    let points: Vec<&Point> = readings.iter().map(|r| r.position()).collect();
    Ok(centroid(&points)?.coords().clone_owned())
}

fn lateration_seed(
    readings: &[LocatedReading],
    config: &SourceFitConfig,
    dim: usize,
) -> Option<DVector<f64>> {
    if readings.len() < dim + 1 {
        return None;
    }
    let power = config.initial_transmitted_power_dbm?;
    let exponent = config.initial_path_loss_exponent;
    let mut anchors = Vec::with_capacity(readings.len());
    let mut distances = Vec::with_capacity(readings.len());
    for reading in readings {
        let distance = match reading.reading().distance() {
            Some(d) => d,
            None => {
                let rssi = reading.reading().rssi_dbm()?;
                distance_from_rssi(rssi, power, exponent, reading.source().frequency_hz())
                    .ok()?
            }
        };
        anchors.push(reading.position().clone());
        distances.push(distance);
    }
    match lateration::linear_lateration(&anchors, &distances, None) {
        Ok(point) => Some(point.coords().clone_owned()),
        Err(e) => {
            debug!("lateration seed failed, falling back to centroid: {e}");
            None
        }
    }
}

/// Mean-based transmitted-power seed: invert the path-loss law at the seed
/// position for every RSSI row and average.
fn seed_power(rows: &[Row], seed_position: &DVector<f64>, exponent: f64) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for row in rows {
        if let Row::Rssi {
            anchor,
            rssi_dbm,
            k_db,
            ..
        } = row
        {
            let d = (seed_position - anchor).norm().max(MIN_DISTANCE);
            sum += rssi_dbm - k_db + 10.0 * exponent * d.log10();
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn run_fit(model: &SourceModel, initial: DVector<f64>) -> Result<SourceFit> {
    let solution = solve_least_squares(model, initial)?;
    let (position, power, exponent) = model.unpack(&solution.params);
    let layout = &model.layout;

    let position_covariance = solution.covariance.as_ref().and_then(|cov| {
        layout
            .position
            .then(|| cov.view((0, 0), (layout.dim, layout.dim)).into_owned())
    });
    let transmitted_power_variance = solution
        .covariance
        .as_ref()
        .and_then(|cov| layout.power_index().map(|i| cov[(i, i)]));
    let path_loss_exponent_variance = solution
        .covariance
        .as_ref()
        .and_then(|cov| layout.exponent_index().map(|i| cov[(i, i)]));

    Ok(SourceFit {
        position: Point::from_vector(position),
        transmitted_power_dbm: power,
        path_loss_exponent: exponent,
        covariance: solution.covariance,
        position_covariance,
        transmitted_power_variance,
        path_loss_exponent_variance,
        residual_norm: solution.residual_norm,
        chi2: solution.chi2,
        iterations: solution.iterations,
    })
}

/// Fit the enabled source parameters to `readings`.
///
/// Requires at least `config.min_readings(D)` readings; fewer surface
/// [`PositioningError::NotReady`]. Degenerate geometry or solver divergence
/// surface [`PositioningError::NumericalFailure`].
pub fn fit_source(readings: &[LocatedReading], config: &SourceFitConfig) -> Result<SourceFit> {
    let dim = check_dimensions(readings)?;
    if !config.position_estimation_enabled
        && !config.transmitted_power_estimation_enabled
        && !config.path_loss_estimation_enabled
    {
        return Err(PositioningError::NotReady(
            "no parameter selected for estimation".into(),
        ));
    }
    let min = config.min_readings(dim);
    if readings.len() < min {
        return Err(PositioningError::NotReady(format!(
            "{} readings required, got {}",
            min,
            readings.len()
        )));
    }

    let layout = ParamLayout {
        dim,
        position: config.position_estimation_enabled,
        power: config.transmitted_power_estimation_enabled,
        exponent: config.path_loss_estimation_enabled,
    };

    let exponent0 = config.initial_path_loss_exponent;
    let position0 = seed_position(readings, config, dim)?;
    let rows = build_rows(readings, config, &position0, exponent0)?;
    let power0 = config
        .initial_transmitted_power_dbm
        .unwrap_or_else(|| seed_power(&rows, &position0, exponent0));

    let model = SourceModel {
        rows,
        layout,
        fixed_position: position0.clone(),
        fixed_power: power0,
        fixed_exponent: exponent0,
    };

    let mut initial = DVector::zeros(layout.count());
    if layout.position {
        initial.rows_mut(0, dim).copy_from(&position0);
    }
    if let Some(i) = layout.power_index() {
        initial[i] = power0;
    }
    if let Some(i) = layout.exponent_index() {
        initial[i] = exponent0;
    }

    let fit = run_fit(&model, initial)?;

    // Optional residual-gated refit: drop readings with any row exceeding
    // the chi-squared threshold, then solve once more from the fitted state.
    if let Some(threshold) = config.chi_squared_threshold {
        let kept = filter_readings(readings, &fit, config, threshold)?;
        if kept.len() < readings.len() && kept.len() >= min {
            debug!(
                "chi-squared gate removed {} of {} readings; refitting",
                readings.len() - kept.len(),
                readings.len()
            );
            let mut refit_config = config.clone();
            refit_config.initial_position = Some(fit.position.clone());
            refit_config.initial_transmitted_power_dbm = Some(fit.transmitted_power_dbm);
            refit_config.initial_path_loss_exponent = fit.path_loss_exponent;
            refit_config.chi_squared_threshold = None;
            return fit_source(&kept, &refit_config);
        }
    }

    Ok(fit)
}

fn filter_readings(
    readings: &[LocatedReading],
    fit: &SourceFit,
    config: &SourceFitConfig,
    threshold: f64,
) -> Result<Vec<LocatedReading>> {
    let mut kept = Vec::with_capacity(readings.len());
    for reading in readings {
        let residual = reading_residual(
            reading,
            &fit.position,
            fit.transmitted_power_dbm,
            fit.path_loss_exponent,
            config.use_reading_position_covariances,
        )?;
        if residual * residual <= threshold {
            kept.push(reading.clone());
        }
    }
    Ok(kept)
}

/// Normalized residual of one located reading against a candidate source.
///
/// Ranging and RSSI channels are normalized by their effective standard
/// deviations; a combined reading scores `sqrt((r_rng² + r_rssi²)/2)`.
pub fn reading_residual(
    reading: &LocatedReading,
    position: &Point,
    transmitted_power_dbm: f64,
    path_loss_exponent: f64,
    use_position_covariances: bool,
) -> Result<f64> {
    let delta = position.coords() - reading.position().coords();
    let d = delta.norm().max(MIN_DISTANCE);

    let ranging = match reading.reading().distance() {
        Some(measured) => {
            let mut variance = reading
                .reading()
                .effective_ranging_std()
                .map(|s| s * s)
                .unwrap_or(1.0);
            if use_position_covariances {
                if let Some(cov) = reading.covariance() {
                    let gradient = delta.map(|c| c / d);
                    variance += location_variance(cov, &gradient);
                }
            }
            Some((measured - d).abs() / variance.sqrt())
        }
        None => None,
    };

    let rssi = match reading.reading().rssi_dbm() {
        Some(measured) => {
            let k_db = frequency_constant_db(reading.source().frequency_hz())?;
            let predicted =
                transmitted_power_dbm + k_db - 10.0 * path_loss_exponent * d.log10();
            let mut variance = reading
                .reading()
                .effective_rssi_std()
                .map(|s| s * s)
                .unwrap_or(1.0);
            if use_position_covariances {
                if let Some(cov) = reading.covariance() {
                    let gradient = DVector::from_iterator(
                        delta.len(),
                        delta
                            .iter()
                            .map(|&c| d_power_d_coordinate(c, d, path_loss_exponent)),
                    );
                    variance += location_variance(cov, &gradient);
                }
            }
            Some((measured - predicted).abs() / variance.sqrt())
        }
        None => None,
    };

    Ok(match (ranging, rssi) {
        (Some(r), Some(p)) => ((r * r + p * p) / 2.0).sqrt(),
        (Some(r), None) => r,
        (None, Some(p)) => p,
        (None, None) => 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::received_power_dbm;
    use crate::schema::{Bssid, RadioSource, Reading};
    use approx::assert_relative_eq;

    const FREQUENCY: f64 = 2.4e9;

    fn source() -> RadioSource {
        RadioSource::access_point(Bssid::new([0xaa, 0, 0, 0, 0, 1]), FREQUENCY)
    }

    fn rssi_readings_around(
        truth: &Point,
        power: f64,
        exponent: f64,
        receivers: &[Point],
    ) -> Vec<LocatedReading> {
        receivers
            .iter()
            .map(|p| {
                let d = truth.distance_to(p);
                let rssi = received_power_dbm(d, power, exponent, FREQUENCY).unwrap();
                LocatedReading::new(Reading::rssi(source(), rssi).unwrap(), p.clone())
            })
            .collect()
    }

    fn grid_receivers_2d() -> Vec<Point> {
        let mut points = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                points.push(Point::xy(i as f64 * 4.0, j as f64 * 4.0));
            }
        }
        points
    }

    #[test]
    fn test_position_and_power_from_clean_rssi() {
        let truth = Point::xy(5.0, 7.0);
        let readings = rssi_readings_around(&truth, -12.0, 2.0, &grid_receivers_2d());
        let fit = fit_source(&readings, &SourceFitConfig::default()).unwrap();

        assert_relative_eq!(fit.position.get(0), 5.0, epsilon = 1e-6);
        assert_relative_eq!(fit.position.get(1), 7.0, epsilon = 1e-6);
        assert_relative_eq!(fit.transmitted_power_dbm, -12.0, epsilon = 1e-6);
        assert!(fit.residual_norm < 1e-6);
        assert!(fit.position_covariance.is_some());
        assert!(fit.transmitted_power_variance.is_some());
        assert!(fit.path_loss_exponent_variance.is_none());
    }

    #[test]
    fn test_all_three_parameters_from_clean_rssi() {
        let truth = Point::xy(5.0, 7.0);
        let readings = rssi_readings_around(&truth, -12.0, 2.7, &grid_receivers_2d());
        let config = SourceFitConfig {
            path_loss_estimation_enabled: true,
            initial_path_loss_exponent: 2.0,
            ..Default::default()
        };
        let fit = fit_source(&readings, &config).unwrap();

        assert_relative_eq!(fit.position.get(0), 5.0, epsilon = 1e-4);
        assert_relative_eq!(fit.position.get(1), 7.0, epsilon = 1e-4);
        assert_relative_eq!(fit.path_loss_exponent, 2.7, epsilon = 1e-4);
    }

    #[test]
    fn test_too_few_readings_is_not_ready() {
        let truth = Point::xy(5.0, 7.0);
        let receivers = [Point::xy(0.0, 0.0), Point::xy(4.0, 0.0), Point::xy(0.0, 4.0)];
        // Estimating position + power in 2D needs four readings.
        let readings = rssi_readings_around(&truth, -12.0, 2.0, &receivers);
        assert!(matches!(
            fit_source(&readings, &SourceFitConfig::default()),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_no_switch_enabled_is_not_ready() {
        let truth = Point::xy(5.0, 7.0);
        let readings = rssi_readings_around(&truth, -12.0, 2.0, &grid_receivers_2d());
        let config = SourceFitConfig {
            position_estimation_enabled: false,
            transmitted_power_estimation_enabled: false,
            path_loss_estimation_enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            fit_source(&readings, &config),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_identical_reading_positions_fail_numerically() {
        let p = Point::xy(3.0, 3.0);
        let readings: Vec<_> = (0..6)
            .map(|_| {
                LocatedReading::new(Reading::rssi(source(), -50.0).unwrap(), p.clone())
            })
            .collect();
        let result = fit_source(&readings, &SourceFitConfig::default());
        match result {
            Err(PositioningError::NumericalFailure(_)) => {}
            Ok(fit) => assert!(fit.covariance.is_none()),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_power_only_fit_with_fixed_position() {
        let truth = Point::xy(5.0, 7.0);
        let readings = rssi_readings_around(&truth, -4.0, 2.0, &grid_receivers_2d());
        let config = SourceFitConfig {
            position_estimation_enabled: false,
            initial_position: Some(truth.clone()),
            ..Default::default()
        };
        let fit = fit_source(&readings, &config).unwrap();
        assert_relative_eq!(fit.transmitted_power_dbm, -4.0, epsilon = 1e-9);
        assert_eq!(fit.position, truth);
        assert!(fit.position_covariance.is_none());
    }

    #[test]
    fn test_fixed_position_without_seed_is_not_ready() {
        let truth = Point::xy(5.0, 7.0);
        let readings = rssi_readings_around(&truth, -4.0, 2.0, &grid_receivers_2d());
        let config = SourceFitConfig {
            position_estimation_enabled: false,
            ..Default::default()
        };
        assert!(matches!(
            fit_source(&readings, &config),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_reading_covariance_inflates_sigma_not_direction() {
        let truth = Point::xy(5.0, 7.0);
        let receivers = grid_receivers_2d();
        let mut readings = Vec::new();
        for p in &receivers {
            let d = truth.distance_to(p);
            let rssi = received_power_dbm(d, -12.0, 2.0, FREQUENCY).unwrap();
            let cov = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, 0.5]);
            readings.push(
                LocatedReading::with_covariance(
                    Reading::rssi(source(), rssi).unwrap(),
                    p.clone(),
                    cov,
                )
                .unwrap(),
            );
        }
        let config = SourceFitConfig {
            use_reading_position_covariances: true,
            ..Default::default()
        };
        let fit = fit_source(&readings, &config).unwrap();
        // Noise-free data still fits exactly; only the weights changed.
        assert_relative_eq!(fit.position.get(0), 5.0, epsilon = 1e-6);
        assert_relative_eq!(fit.position.get(1), 7.0, epsilon = 1e-6);
    }

    #[test]
    fn test_chi_squared_gate_drops_gross_outlier() {
        let truth = Point::xy(5.0, 7.0);
        let mut readings = rssi_readings_around(&truth, -12.0, 2.0, &grid_receivers_2d());
        // One reading shifted by +40 dB.
        let bad_position = Point::xy(20.0, 20.0);
        let d = truth.distance_to(&bad_position);
        let rssi = received_power_dbm(d, -12.0, 2.0, FREQUENCY).unwrap() + 40.0;
        readings.push(LocatedReading::new(
            Reading::rssi(source(), rssi).unwrap(),
            bad_position,
        ));

        let config = SourceFitConfig {
            chi_squared_threshold: Some(9.0),
            ..Default::default()
        };
        let fit = fit_source(&readings, &config).unwrap();
        assert_relative_eq!(fit.position.get(0), 5.0, epsilon = 1e-3);
        assert_relative_eq!(fit.position.get(1), 7.0, epsilon = 1e-3);
        assert_relative_eq!(fit.transmitted_power_dbm, -12.0, epsilon = 1e-2);
    }

    #[test]
    fn test_combined_reading_residual_is_rms_of_channels() {
        let src = source();
        let position = Point::xy(0.0, 0.0);
        let receiver = Point::xy(3.0, 4.0);
        let k_db = frequency_constant_db(FREQUENCY).unwrap();
        let predicted_rssi = -10.0 + k_db - 10.0 * 2.0 * 5f64.log10();
        // Ranging off by 2 m (σ 1 m), RSSI off by 4 dB (σ 1 dB).
        let reading = Reading::ranging_and_rssi(
            src,
            7.0,
            None,
            1,
            1,
            predicted_rssi + 4.0,
            None,
        )
        .unwrap();
        let located = LocatedReading::new(reading, receiver);
        let r = reading_residual(&located, &position, -10.0, 2.0, false).unwrap();
        assert_relative_eq!(r, ((4.0 + 16.0) / 2.0f64).sqrt(), epsilon = 1e-9);
    }
}
