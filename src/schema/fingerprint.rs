//! Fingerprints: reading sets collected at one location, and the RSSI
//! distance metrics used to match them.

use nalgebra::DMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::geometry::{validate_covariance, Point};
use crate::schema::reading::Reading;
use crate::schema::source::RadioSource;

/// An ordered sequence of readings collected at one (possibly unknown)
/// location. Insertion order is preserved but not semantically significant.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Fingerprint {
    readings: Vec<Reading>,
}

impl Fingerprint {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings }
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// RSSI of the first reading against `source` that carries an RSSI
    /// channel. Duplicate sources are tolerated; only the first is used.
    pub fn rssi_of(&self, source: &RadioSource) -> Option<f64> {
        self.readings
            .iter()
            .filter(|r| r.source() == source)
            .find_map(|r| r.rssi_dbm())
    }

    /// Sources with an RSSI channel, in insertion order, first occurrence
    /// only.
    pub fn rssi_sources(&self) -> Vec<&RadioSource> {
        let mut seen: Vec<&RadioSource> = Vec::new();
        for r in &self.readings {
            if r.rssi_dbm().is_some() && !seen.contains(&r.source()) {
                seen.push(r.source());
            }
        }
        seen
    }
}

/// A fingerprint taken at a known location.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocatedFingerprint {
    fingerprint: Fingerprint,
    position: Point,
    covariance: Option<DMatrix<f64>>,
}

impl LocatedFingerprint {
    pub fn new(fingerprint: Fingerprint, position: Point) -> Self {
        Self {
            fingerprint,
            position,
            covariance: None,
        }
    }

    pub fn with_covariance(
        fingerprint: Fingerprint,
        position: Point,
        covariance: DMatrix<f64>,
    ) -> Result<Self> {
        validate_covariance(&covariance, position.dim())?;
        Ok(Self {
            fingerprint,
            position,
            covariance: Some(covariance),
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn position(&self) -> &Point {
        &self.position
    }

    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }
}

/// Collect the RSSI pairs of the sources present in both fingerprints.
fn overlapping_rssi(a: &Fingerprint, b: &Fingerprint) -> Vec<(f64, f64)> {
    a.rssi_sources()
        .into_iter()
        .filter_map(|source| {
            let ra = a.rssi_of(source)?;
            let rb = b.rssi_of(source)?;
            Some((ra, rb))
        })
        .collect()
}

/// Euclidean RSSI distance over the sources common to both fingerprints.
///
/// Returns `f64::INFINITY` when the fingerprints share no source, so that an
/// unmatched pair always sorts last.
pub fn euclidean_rssi_distance(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let pairs = overlapping_rssi(a, b);
    if pairs.is_empty() {
        return f64::INFINITY;
    }
    pairs
        .iter()
        .map(|(ra, rb)| (ra - rb) * (ra - rb))
        .sum::<f64>()
        .sqrt()
}

/// Mean-removed Euclidean RSSI distance: each fingerprint's mean over the
/// common sources is subtracted first, cancelling receiver hardware-gain
/// offsets.
///
/// Returns `f64::INFINITY` when the fingerprints share no source.
pub fn mean_removed_rssi_distance(a: &Fingerprint, b: &Fingerprint) -> f64 {
    let pairs = overlapping_rssi(a, b);
    if pairs.is_empty() {
        return f64::INFINITY;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(ra, _)| ra).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, rb)| rb).sum::<f64>() / n;
    pairs
        .iter()
        .map(|(ra, rb)| {
            let d = (ra - mean_a) - (rb - mean_b);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}
