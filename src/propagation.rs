//! Log-distance path-loss model and its derivatives.
//!
//! Received power at distance `d` from a source emitting equivalent
//! transmitted power `Pte` (antenna gains folded in) at wavelength `λ` is
//!
//! ```text
//! Pr(d) = Pte * (λ / 4π)² * d⁻ⁿ
//! ```
//!
//! or, in dBm, `Pr = Pte + K - 10·n·log₁₀(d)` where
//! `K = 10·log₁₀((λ/4π)²)` depends only on the carrier frequency and `n` is
//! the path-loss exponent (2.0 in free space).

use std::f64::consts::{LN_10, PI};

use crate::constants::{MIN_DISTANCE, SPEED_OF_LIGHT};
use crate::errors::{PositioningError, Result};

/// Carrier wavelength in meters.
pub fn wavelength(frequency_hz: f64) -> Result<f64> {
    if !(frequency_hz > 0.0) || !frequency_hz.is_finite() {
        return Err(PositioningError::InvalidArgument(format!(
            "frequency must be positive, got {frequency_hz}"
        )));
    }
    Ok(SPEED_OF_LIGHT / frequency_hz)
}

/// The frequency-dependent constant `K = 10·log₁₀((λ/4π)²)` in dB.
pub fn frequency_constant_db(frequency_hz: f64) -> Result<f64> {
    let lambda = wavelength(frequency_hz)?;
    let k = lambda / (4.0 * PI);
    Ok(10.0 * (k * k).log10())
}

/// Received power in dBm at `distance_m` from a source transmitting
/// `pte_dbm` with path-loss exponent `exponent`.
///
/// Distances below [`MIN_DISTANCE`] are clamped before entering the log.
pub fn received_power_dbm(
    distance_m: f64,
    pte_dbm: f64,
    exponent: f64,
    frequency_hz: f64,
) -> Result<f64> {
    if !(distance_m >= 0.0) {
        return Err(PositioningError::InvalidArgument(format!(
            "distance must be non-negative, got {distance_m}"
        )));
    }
    let k_db = frequency_constant_db(frequency_hz)?;
    let d = distance_m.max(MIN_DISTANCE);
    Ok(pte_dbm + k_db - 10.0 * exponent * d.log10())
}

/// Distance implied by a measured received power, inverting the forward
/// model: `d = 10^((Pte + K - Pr) / (10·n))`.
pub fn distance_from_rssi(
    rssi_dbm: f64,
    pte_dbm: f64,
    exponent: f64,
    frequency_hz: f64,
) -> Result<f64> {
    if exponent == 0.0 {
        return Err(PositioningError::InvalidArgument(
            "path-loss exponent must be non-zero".into(),
        ));
    }
    let k_db = frequency_constant_db(frequency_hz)?;
    let d = 10f64.powf((pte_dbm + k_db - rssi_dbm) / (10.0 * exponent));
    Ok(d.max(MIN_DISTANCE))
}

/// Convert power from dBm to milliwatts.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert power from milliwatts to dBm. `mw` must be positive for a finite
/// result.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// Partial derivative of `Pr_dBm` with respect to one coordinate of the link
/// end being estimated.
///
/// `delta` is that coordinate of the estimated end minus the same coordinate
/// of the fixed end; `distance` is the full link distance (already clamped).
pub fn d_power_d_coordinate(delta: f64, distance: f64, exponent: f64) -> f64 {
    -(10.0 * exponent / LN_10) * delta / (distance * distance)
}

/// Partial derivative of `Pr_dBm` with respect to the path-loss exponent.
pub fn d_power_d_exponent(distance: f64) -> f64 {
    -10.0 * distance.max(MIN_DISTANCE).log10()
}

/// First-order propagation of an RSSI standard deviation (dB) into a
/// distance standard deviation (m) around `distance`:
/// `σ_d = d · ln10 / (10·n) · σ_rssi`.
pub fn distance_std_from_rssi_std(distance: f64, exponent: f64, rssi_std: f64) -> f64 {
    distance * LN_10 / (10.0 * exponent.abs().max(f64::MIN_POSITIVE)) * rssi_std
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const FREQUENCY: f64 = 2.4e9;

    #[test]
    fn test_forward_model_at_2_4_ghz() {
        // K at 2.4 GHz is about -40.05 dB, so at 10 m with n = 2 the link
        // loses another 20 dB.
        let pr = received_power_dbm(10.0, 0.0, 2.0, FREQUENCY).unwrap();
        assert_relative_eq!(pr, -60.052, epsilon = 1e-3);

        let k = frequency_constant_db(FREQUENCY).unwrap();
        assert_relative_eq!(k, -40.052, epsilon = 1e-3);
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        for d in [0.5, 1.0, 10.0, 25.0, 150.0] {
            for n in [1.6, 2.0, 2.7, 4.5] {
                let pr = received_power_dbm(d, -10.0, n, FREQUENCY).unwrap();
                let back = distance_from_rssi(pr, -10.0, n, FREQUENCY).unwrap();
                assert_relative_eq!(back, d, max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(wavelength(0.0).is_err());
        assert!(wavelength(-1.0).is_err());
        assert!(received_power_dbm(-1.0, 0.0, 2.0, FREQUENCY).is_err());
        assert!(distance_from_rssi(-50.0, 0.0, 0.0, FREQUENCY).is_err());
    }

    #[test]
    fn test_distance_clamped_near_source() {
        let pr = received_power_dbm(0.0, 0.0, 2.0, FREQUENCY).unwrap();
        assert!(pr.is_finite());
    }

    #[test]
    fn test_dbm_mw_roundtrip() {
        for v in [-100.0, -40.0, 0.0, 17.0] {
            assert_relative_eq!(mw_to_dbm(dbm_to_mw(v)), v, epsilon = 1e-9);
        }
        assert_relative_eq!(dbm_to_mw(0.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(dbm_to_mw(10.0), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coordinate_partial_matches_finite_difference() {
        // Source at origin, receiver on the x axis; differentiate Pr with
        // respect to the receiver x coordinate.
        let n = 2.5;
        let d0 = 7.0;
        let h = 1e-6;
        let pr = |x: f64| received_power_dbm(x, 0.0, n, FREQUENCY).unwrap();
        let numeric = (pr(d0 + h) - pr(d0 - h)) / (2.0 * h);
        let analytic = d_power_d_coordinate(d0, d0, n);
        assert_relative_eq!(numeric, analytic, max_relative = 1e-5);
    }

    #[test]
    fn test_exponent_partial_matches_finite_difference() {
        let d = 12.0;
        let h = 1e-7;
        let pr = |n: f64| received_power_dbm(d, 0.0, n, FREQUENCY).unwrap();
        let numeric = (pr(2.0 + h) - pr(2.0 - h)) / (2.0 * h);
        assert_relative_eq!(numeric, d_power_d_exponent(d), max_relative = 1e-5);
    }

    #[test]
    fn test_rssi_std_propagation_grows_with_distance() {
        let near = distance_std_from_rssi_std(1.0, 2.0, 1.0);
        let far = distance_std_from_rssi_std(100.0, 2.0, 1.0);
        assert!(far > near);
        // σ_d = d·ln10/(10n)·σ ≈ 0.115·d for n = 2, σ = 1 dB.
        assert_relative_eq!(near, LN_10 / 20.0, epsilon = 1e-12);
    }
}
