//! Robust indoor localization from RF observations.
//!
//! This crate estimates the position, transmitted power and path-loss
//! exponent of radio sources (Wi-Fi access points, BLE beacons) from located
//! readings, and the position of a receiver from readings against known
//! sources, tolerating a high fraction of outliers.
//!
//! The stack, bottom up:
//! - [`propagation`]: the log-distance path-loss model and its derivatives.
//! - [`schema`]: sources, readings and fingerprints, plus the RSSI distance
//!   metrics used for fingerprint matching.
//! - [`fitting`]: Levenberg–Marquardt source fitting and multilateration.
//! - [`robust`]: the RANSAC/MSAC/LMedS/PROSAC/PROMedS outer loop.
//! - [`locate`]: the public estimators tying it all together.
//!
//! Estimations are synchronous and deterministic: given identical inputs and
//! the same sampling seed, results are bit-stable across runs. Progress is
//! reported through [`EstimatorListener`] callbacks and long runs can be
//! stopped cooperatively with a [`CancelToken`].

pub mod constants;
pub mod errors;
pub mod fitting;
pub mod geometry;
pub mod locate;
pub mod propagation;
pub mod robust;
pub mod schema;

mod cancel;
mod listener;

pub use cancel::CancelToken;
pub use errors::{PositioningError, Result};
pub use fitting::{SourceFit, SourceFitConfig};
pub use geometry::Point;
pub use listener::EstimatorListener;
pub use locate::{
    weighted_position, FingerprintPositionEstimator, ReceiverEstimate, ReceiverEstimator,
    RobustReceiverEstimator, RobustSourceEstimator, RssiDistanceMetric, SourceEstimator,
};
pub use robust::RobustMethod;
pub use schema::{
    BeaconId, Bssid, Fingerprint, LocatedFingerprint, LocatedReading, LocatedSource, RadioSource,
    Reading, ReadingKind,
};
