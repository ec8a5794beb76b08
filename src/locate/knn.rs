//! Weighted k-nearest-neighbour position estimation over located
//! fingerprints.

use crate::constants::KNN_MIN_DISTANCE;
use crate::errors::{PositioningError, Result};
use crate::geometry::Point;
use crate::schema::{
    euclidean_rssi_distance, mean_removed_rssi_distance, Fingerprint, LocatedFingerprint,
};

/// RSSI distance metric used to rank fingerprints against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RssiDistanceMetric {
    #[default]
    Euclidean,
    /// Euclidean after removing each fingerprint's mean over the common
    /// sources; cancels receiver hardware-gain offsets.
    MeanRemoved,
}

impl RssiDistanceMetric {
    fn distance(&self, a: &Fingerprint, b: &Fingerprint) -> f64 {
        match self {
            Self::Euclidean => euclidean_rssi_distance(a, b),
            Self::MeanRemoved => mean_removed_rssi_distance(a, b),
        }
    }
}

/// Weighted average of the `k` fingerprint positions with the smallest
/// distances, weighting each by `1 / max(distance, ε)`.
///
/// A single fingerprint short-circuits to its own position, as does `k = 1`
/// to the nearest neighbour's. Infinite distances (no shared sources) get
/// zero weight; if every selected neighbour is infinite the estimate fails
/// with [`PositioningError::NumericalFailure`].
pub fn weighted_position(
    fingerprints: &[LocatedFingerprint],
    distances: &[f64],
    k: usize,
) -> Result<Point> {
    if fingerprints.is_empty() {
        return Err(PositioningError::InvalidArgument(
            "at least one fingerprint is required".into(),
        ));
    }
    if fingerprints.len() != distances.len() {
        return Err(PositioningError::InvalidArgument(format!(
            "{} fingerprints but {} distances",
            fingerprints.len(),
            distances.len()
        )));
    }
    if k == 0 {
        return Err(PositioningError::InvalidArgument(
            "k must be at least 1".into(),
        ));
    }
    if distances.iter().any(|d| d.is_nan() || *d < 0.0) {
        return Err(PositioningError::InvalidArgument(
            "distances must be non-negative".into(),
        ));
    }
    let dim = fingerprints[0].position().dim();
    if fingerprints.iter().any(|f| f.position().dim() != dim) {
        return Err(PositioningError::InvalidArgument(
            "all fingerprint positions must share one dimension".into(),
        ));
    }

    if fingerprints.len() == 1 {
        return Ok(fingerprints[0].position().clone());
    }

    let mut order: Vec<usize> = (0..fingerprints.len()).collect();
    order.sort_by(|&a, &b| {
        distances[a]
            .partial_cmp(&distances[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let nearest = &order[..k.min(order.len())];

    if nearest.len() == 1 || k == 1 {
        return Ok(fingerprints[nearest[0]].position().clone());
    }

    let mut total_weight = 0.0;
    let mut accumulated = nalgebra::DVector::zeros(dim);
    for &i in nearest {
        let weight = if distances[i].is_finite() {
            1.0 / distances[i].max(KNN_MIN_DISTANCE)
        } else {
            0.0
        };
        accumulated += fingerprints[i].position().coords() * weight;
        total_weight += weight;
    }
    if total_weight <= 0.0 {
        return Err(PositioningError::NumericalFailure(
            "every selected neighbour is infinitely far".into(),
        ));
    }
    Point::from_slice((accumulated / total_weight).as_slice())
}

/// Receiver position estimator matching a query fingerprint against a
/// located fingerprint database.
#[derive(Debug, Clone)]
pub struct FingerprintPositionEstimator {
    k: usize,
    metric: RssiDistanceMetric,
}

impl FingerprintPositionEstimator {
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(PositioningError::InvalidArgument(
                "k must be at least 1".into(),
            ));
        }
        Ok(Self {
            k,
            metric: RssiDistanceMetric::default(),
        })
    }

    pub fn with_metric(mut self, metric: RssiDistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn metric(&self) -> RssiDistanceMetric {
        self.metric
    }

    /// Rank the database by RSSI distance to `query` and return the
    /// weighted k-nearest-neighbour position.
    pub fn estimate(
        &self,
        database: &[LocatedFingerprint],
        query: &Fingerprint,
    ) -> Result<Point> {
        let distances: Vec<f64> = database
            .iter()
            .map(|f| self.metric.distance(f.fingerprint(), query))
            .collect();
        weighted_position(database, &distances, self.k)
    }
}
