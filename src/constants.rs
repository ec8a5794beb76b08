//! Shared numeric defaults for the estimation stack.

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Free-space path-loss exponent. Indoor environments typically fall in
/// [1.6, 5.0].
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Lower bound applied to link distances before they enter the propagation
/// model, meters. Keeps the log-distance law away from its singularity.
pub const MIN_DISTANCE: f64 = 1e-7;

/// Standard deviation assumed for an RSSI reading that does not declare one,
/// dBm.
pub const DEFAULT_RSSI_STD: f64 = 1.0;

/// Standard deviation assumed for a ranging reading that does not declare
/// one, meters.
pub const DEFAULT_RANGING_STD: f64 = 1.0;

/// Default confidence of the robust outer loop, in (0, 1).
pub const DEFAULT_CONFIDENCE: f64 = 0.99;

/// Default hard cap on robust outer-loop iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 5000;

/// Default granularity of progress notifications, in (0, 1].
pub const DEFAULT_PROGRESS_DELTA: f64 = 0.05;

/// Default early-stop threshold on the median of squared residuals, used by
/// the LMedS and PROMedS policies.
pub const DEFAULT_STOP_THRESHOLD: f64 = 1e-4;

/// Default residual threshold for the RANSAC, MSAC and PROSAC policies, in
/// normalized residual units.
pub const DEFAULT_RESIDUAL_THRESHOLD: f64 = 3.0;

/// Minimum fingerprint distance used when weighting nearest neighbours.
pub const KNN_MIN_DISTANCE: f64 = 1e-7;

/// Seed of the subset-sampling RNG. Fixed so repeated runs over identical
/// inputs are bit-stable; callers may reseed per estimator.
pub const DEFAULT_RNG_SEED: u64 = 0x1d00_47a6;
