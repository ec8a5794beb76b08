//! Value types consumed by the estimators: sources, readings, fingerprints.

mod fingerprint;
mod reading;
mod source;

pub use fingerprint::{
    euclidean_rssi_distance, mean_removed_rssi_distance, Fingerprint, LocatedFingerprint,
};
pub use reading::{LocatedReading, Reading, ReadingKind};
pub use source::{BeaconId, Bssid, LocatedSource, RadioSource};
