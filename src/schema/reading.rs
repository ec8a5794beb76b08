//! Observations of a radio source: ranging, RSSI, or both.

use nalgebra::DMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_RANGING_STD, DEFAULT_RSSI_STD};
use crate::errors::{PositioningError, Result};
use crate::geometry::{validate_covariance, Point};
use crate::schema::source::RadioSource;

/// The measurement payload of a [`Reading`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReadingKind {
    /// A round-trip-time or equivalent distance measurement.
    Ranging {
        /// Measured distance in meters.
        distance: f64,
        /// Standard deviation of the distance, meters. `None` means unknown.
        distance_std: Option<f64>,
        /// Ranging attempts made for this measurement.
        num_attempted: usize,
        /// Attempts that produced a usable sample.
        num_succeeded: usize,
    },
    /// A received-signal-strength measurement.
    Rssi {
        /// Received power in dBm.
        rssi_dbm: f64,
        /// Standard deviation of the power, dB. `None` means unknown.
        rssi_std: Option<f64>,
    },
    /// Both measurements taken together. Contributes two residual rows.
    RangingAndRssi {
        distance: f64,
        distance_std: Option<f64>,
        num_attempted: usize,
        num_succeeded: usize,
        rssi_dbm: f64,
        rssi_std: Option<f64>,
    },
}

/// One observation of one radio source.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    source: RadioSource,
    kind: ReadingKind,
}

fn check_ranging(
    distance: f64,
    distance_std: Option<f64>,
    num_attempted: usize,
) -> Result<()> {
    if !(distance >= 0.0) || !distance.is_finite() {
        return Err(PositioningError::InvalidArgument(format!(
            "distance must be finite and non-negative, got {distance}"
        )));
    }
    if let Some(std) = distance_std {
        if !(std > 0.0) || !std.is_finite() {
            return Err(PositioningError::InvalidArgument(format!(
                "distance std must be finite and positive, got {std}"
            )));
        }
    }
    if num_attempted < 1 {
        return Err(PositioningError::InvalidArgument(
            "at least one ranging attempt is required".into(),
        ));
    }
    Ok(())
}

fn check_rssi(rssi_dbm: f64, rssi_std: Option<f64>) -> Result<()> {
    if !rssi_dbm.is_finite() {
        return Err(PositioningError::InvalidArgument(format!(
            "rssi must be finite, got {rssi_dbm}"
        )));
    }
    if let Some(std) = rssi_std {
        if !(std > 0.0) || !std.is_finite() {
            return Err(PositioningError::InvalidArgument(format!(
                "rssi std must be finite and positive, got {std}"
            )));
        }
    }
    Ok(())
}

impl Reading {
    /// A ranging observation from a single successful attempt.
    pub fn ranging(source: RadioSource, distance: f64) -> Result<Self> {
        Self::ranging_with_std(source, distance, None, 1, 1)
    }

    pub fn ranging_with_std(
        source: RadioSource,
        distance: f64,
        distance_std: Option<f64>,
        num_attempted: usize,
        num_succeeded: usize,
    ) -> Result<Self> {
        check_ranging(distance, distance_std, num_attempted)?;
        Ok(Self {
            source,
            kind: ReadingKind::Ranging {
                distance,
                distance_std,
                num_attempted,
                num_succeeded,
            },
        })
    }

    /// An RSSI observation with unknown standard deviation.
    pub fn rssi(source: RadioSource, rssi_dbm: f64) -> Result<Self> {
        Self::rssi_with_std(source, rssi_dbm, None)
    }

    pub fn rssi_with_std(
        source: RadioSource,
        rssi_dbm: f64,
        rssi_std: Option<f64>,
    ) -> Result<Self> {
        check_rssi(rssi_dbm, rssi_std)?;
        Ok(Self {
            source,
            kind: ReadingKind::Rssi { rssi_dbm, rssi_std },
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ranging_and_rssi(
        source: RadioSource,
        distance: f64,
        distance_std: Option<f64>,
        num_attempted: usize,
        num_succeeded: usize,
        rssi_dbm: f64,
        rssi_std: Option<f64>,
    ) -> Result<Self> {
        check_ranging(distance, distance_std, num_attempted)?;
        check_rssi(rssi_dbm, rssi_std)?;
        Ok(Self {
            source,
            kind: ReadingKind::RangingAndRssi {
                distance,
                distance_std,
                num_attempted,
                num_succeeded,
                rssi_dbm,
                rssi_std,
            },
        })
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn kind(&self) -> &ReadingKind {
        &self.kind
    }

    /// Measured distance, if this reading carries a ranging channel.
    pub fn distance(&self) -> Option<f64> {
        match self.kind {
            ReadingKind::Ranging { distance, .. }
            | ReadingKind::RangingAndRssi { distance, .. } => Some(distance),
            ReadingKind::Rssi { .. } => None,
        }
    }

    /// Measured received power, if this reading carries an RSSI channel.
    pub fn rssi_dbm(&self) -> Option<f64> {
        match self.kind {
            ReadingKind::Rssi { rssi_dbm, .. }
            | ReadingKind::RangingAndRssi { rssi_dbm, .. } => Some(rssi_dbm),
            ReadingKind::Ranging { .. } => None,
        }
    }

    /// Effective ranging standard deviation: the declared value, or 1 m when
    /// unknown. `None` for pure RSSI readings.
    pub fn effective_ranging_std(&self) -> Option<f64> {
        match self.kind {
            ReadingKind::Ranging { distance_std, .. }
            | ReadingKind::RangingAndRssi { distance_std, .. } => {
                Some(distance_std.unwrap_or(DEFAULT_RANGING_STD))
            }
            ReadingKind::Rssi { .. } => None,
        }
    }

    /// Effective RSSI standard deviation: the declared value, or 1 dB when
    /// unknown. `None` for pure ranging readings.
    pub fn effective_rssi_std(&self) -> Option<f64> {
        match self.kind {
            ReadingKind::Rssi { rssi_std, .. }
            | ReadingKind::RangingAndRssi { rssi_std, .. } => {
                Some(rssi_std.unwrap_or(DEFAULT_RSSI_STD))
            }
            ReadingKind::Ranging { .. } => None,
        }
    }

    /// Residual rows this reading contributes to a least-squares fit.
    pub fn residual_rows(&self) -> usize {
        match self.kind {
            ReadingKind::RangingAndRssi { .. } => 2,
            _ => 1,
        }
    }
}

/// A reading taken at a known location, with optional location uncertainty.
///
/// For source estimation the location is the receiver's position at
/// measurement time; the covariance, when present, is D×D for the point's
/// dimension D.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocatedReading {
    reading: Reading,
    position: Point,
    covariance: Option<DMatrix<f64>>,
}

impl LocatedReading {
    pub fn new(reading: Reading, position: Point) -> Self {
        Self {
            reading,
            position,
            covariance: None,
        }
    }

    pub fn with_covariance(
        reading: Reading,
        position: Point,
        covariance: DMatrix<f64>,
    ) -> Result<Self> {
        validate_covariance(&covariance, position.dim())?;
        Ok(Self {
            reading,
            position,
            covariance: Some(covariance),
        })
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    pub fn position(&self) -> &Point {
        &self.position
    }

    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    pub fn source(&self) -> &RadioSource {
        self.reading.source()
    }
}
