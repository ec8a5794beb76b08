//! Public estimators: radio-source estimation, receiver positioning and
//! fingerprint matching.

mod knn;
mod receiver;
mod source;

pub use knn::{weighted_position, FingerprintPositionEstimator, RssiDistanceMetric};
pub use receiver::{ReceiverEstimate, ReceiverEstimator, RobustReceiverEstimator};
pub use source::{RobustSourceEstimator, SourceEstimator};
