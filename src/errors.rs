//! Error taxonomy shared by every estimator in the crate.

use thiserror::Error;

/// Failures surfaced by the estimation stack.
///
/// Argument violations are reported at the API boundary and never swallowed.
/// Inside the robust outer loop, inner-solver failures only discard the
/// current sample; persistent failure across all samples surfaces as
/// [`PositioningError::RobustFailure`].
#[derive(Error, Debug)]
pub enum PositioningError {
    /// A caller-supplied value is out of domain: negative where forbidden,
    /// mismatched array lengths, covariance with wrong dimensions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The estimator was invoked before its configuration preconditions were
    /// met: too few readings, missing quality scores, contradictory switches.
    #[error("estimator not ready: {0}")]
    NotReady(String),

    /// Mutation was attempted while `estimate()` is running.
    #[error("estimator is locked while an estimation is running")]
    Locked,

    /// Solver divergence, singular Jacobian, degenerate geometry, or
    /// non-finite residuals.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// The robust outer loop exhausted its iterations without a candidate
    /// meeting the method's acceptance rule.
    #[error("robust estimation failed: {0}")]
    RobustFailure(String),

    /// Cooperative cancellation was requested through a
    /// [`CancelToken`](crate::CancelToken).
    #[error("estimation was cancelled")]
    Cancelled,
}

/// Type alias for Results using PositioningError.
pub type Result<T> = core::result::Result<T, PositioningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = PositioningError::InvalidArgument("negative distance".into());
        assert_eq!(e.to_string(), "invalid argument: negative distance");

        let e = PositioningError::Locked;
        assert_eq!(
            e.to_string(),
            "estimator is locked while an estimation is running"
        );

        let e = PositioningError::Cancelled;
        assert_eq!(e.to_string(), "estimation was cancelled");
    }
}
