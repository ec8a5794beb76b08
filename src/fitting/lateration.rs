//! Multilateration from ranging measurements against known anchors.

use nalgebra::{DMatrix, DVector};

use crate::constants::MIN_DISTANCE;
use crate::errors::{PositioningError, Result};
use crate::fitting::levenberg::{solve_least_squares, LeastSquaresProblem};
use crate::geometry::Point;

/// Result of a nonlinear lateration solve.
#[derive(Debug, Clone)]
pub struct LaterationSolution {
    pub position: Point,
    /// `σ̂² · (JᵀWJ)⁻¹`, or `None` when the geometry leaves the normal
    /// matrix singular at the solution.
    pub covariance: Option<DMatrix<f64>>,
    pub residual_norm: f64,
    pub iterations: usize,
}

fn check_inputs(
    anchors: &[Point],
    distances: &[f64],
    stds: Option<&[f64]>,
) -> Result<usize> {
    let first = anchors
        .first()
        .ok_or_else(|| PositioningError::NotReady("no anchors".into()))?;
    let dim = first.dim();
    if anchors.iter().any(|a| a.dim() != dim) {
        return Err(PositioningError::InvalidArgument(
            "all anchors must share one dimension".into(),
        ));
    }
    if distances.len() != anchors.len() {
        return Err(PositioningError::InvalidArgument(format!(
            "{} anchors but {} distances",
            anchors.len(),
            distances.len()
        )));
    }
    if distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
        return Err(PositioningError::InvalidArgument(
            "distances must be finite and non-negative".into(),
        ));
    }
    if let Some(stds) = stds {
        if stds.len() != anchors.len() {
            return Err(PositioningError::InvalidArgument(format!(
                "{} anchors but {} standard deviations",
                anchors.len(),
                stds.len()
            )));
        }
        if stds.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PositioningError::InvalidArgument(
                "standard deviations must be finite and positive".into(),
            ));
        }
    }
    if anchors.len() < dim + 1 {
        return Err(PositioningError::NotReady(format!(
            "lateration in {dim}D needs at least {} anchors, got {}",
            dim + 1,
            anchors.len()
        )));
    }
    Ok(dim)
}

/// Closed-form lateration: subtracting the first range equation from the
/// others leaves a linear system in the position, solved by weighted least
/// squares.
///
/// Needs at least D+1 anchors; collinear (2D) or coplanar (3D) anchor sets
/// surface [`PositioningError::NumericalFailure`].
pub fn linear_lateration(
    anchors: &[Point],
    distances: &[f64],
    stds: Option<&[f64]>,
) -> Result<Point> {
    let dim = check_inputs(anchors, distances, stds)?;
    let rows = anchors.len() - 1;

    let reference = anchors[0].coords();
    let ref_norm2 = reference.norm_squared();
    let d0 = distances[0];

    let mut a = DMatrix::zeros(rows, dim);
    let mut b = DVector::zeros(rows);
    for i in 1..anchors.len() {
        let anchor = anchors[i].coords();
        let weight = stds.map_or(1.0, |s| 1.0 / (s[i] * s[i]));
        let scale = weight.sqrt();
        for j in 0..dim {
            a[(i - 1, j)] = 2.0 * (anchor[j] - reference[j]) * scale;
        }
        b[i - 1] =
            (d0 * d0 - distances[i] * distances[i] + anchor.norm_squared() - ref_norm2) * scale;
    }

    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values[dim - 1];
    if !(max_sv > 0.0) || min_sv < 1e-10 * max_sv {
        return Err(PositioningError::NumericalFailure(
            "degenerate anchor geometry".into(),
        ));
    }
    let solution = svd
        .solve(&b, 1e-12 * max_sv)
        .map_err(|e| PositioningError::NumericalFailure(e.into()))?;
    Point::from_slice(solution.as_slice())
}

struct LaterationProblem<'a> {
    anchors: &'a [Point],
    distances: &'a [f64],
    stds: Option<&'a [f64]>,
    dim: usize,
}

impl LaterationProblem<'_> {
    fn sigma(&self, i: usize) -> f64 {
        self.stds.map_or(1.0, |s| s[i])
    }
}

impl LeastSquaresProblem for LaterationProblem<'_> {
    fn num_residuals(&self) -> usize {
        self.anchors.len()
    }

    fn num_params(&self) -> usize {
        self.dim
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.anchors.len(),
            self.anchors.iter().enumerate().map(|(i, anchor)| {
                let predicted = (params - anchor.coords()).norm().max(MIN_DISTANCE);
                (self.distances[i] - predicted) / self.sigma(i)
            }),
        )
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.anchors.len(), self.dim);
        for (i, anchor) in self.anchors.iter().enumerate() {
            let delta = params - anchor.coords();
            let d = delta.norm().max(MIN_DISTANCE);
            let sigma = self.sigma(i);
            for j in 0..self.dim {
                jacobian[(i, j)] = -delta[j] / (d * sigma);
            }
        }
        jacobian
    }
}

/// Nonlinear lateration: Levenberg–Marquardt refinement of the range
/// residuals, seeded by [`linear_lateration`] unless a starting point is
/// supplied.
pub fn nonlinear_lateration(
    anchors: &[Point],
    distances: &[f64],
    stds: Option<&[f64]>,
    initial: Option<&Point>,
) -> Result<LaterationSolution> {
    let dim = check_inputs(anchors, distances, stds)?;

    let seed = match initial {
        Some(p) => {
            if p.dim() != dim {
                return Err(PositioningError::InvalidArgument(
                    "initial position dimension does not match the anchors".into(),
                ));
            }
            p.coords().clone_owned()
        }
        None => linear_lateration(anchors, distances, stds)?
            .coords()
            .clone_owned(),
    };

    let problem = LaterationProblem {
        anchors,
        distances,
        stds,
        dim,
    };
    let solution = solve_least_squares(&problem, seed)?;
    Ok(LaterationSolution {
        position: Point::from_vector(solution.params),
        covariance: solution.covariance,
        residual_norm: solution.residual_norm,
        iterations: solution.iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_anchors() -> Vec<Point> {
        vec![
            Point::xy(0.0, 0.0),
            Point::xy(10.0, 0.0),
            Point::xy(0.0, 10.0),
            Point::xy(10.0, 10.0),
        ]
    }

    fn distances_from(anchors: &[Point], truth: &Point) -> Vec<f64> {
        anchors.iter().map(|a| truth.distance_to(a)).collect()
    }

    #[test]
    fn test_linear_lateration_recovers_center() {
        let anchors = square_anchors();
        let truth = Point::xy(5.0, 5.0);
        let distances = distances_from(&anchors, &truth);
        let position = linear_lateration(&anchors, &distances, None).unwrap();
        assert_relative_eq!(position.get(0), 5.0, epsilon = 1e-9);
        assert_relative_eq!(position.get(1), 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_nonlinear_lateration_2d() {
        let anchors = square_anchors();
        let truth = Point::xy(5.0, 5.0);
        let distances = distances_from(&anchors, &truth);
        let stds = vec![0.01; 4];
        let solution =
            nonlinear_lateration(&anchors, &distances, Some(&stds), None).unwrap();
        assert_relative_eq!(solution.position.get(0), 5.0, epsilon = 1e-6);
        assert_relative_eq!(solution.position.get(1), 5.0, epsilon = 1e-6);

        let cov = solution.covariance.expect("covariance");
        assert!(cov.trace() < 1e-3);
        // Symmetric positive-semidefinite within tolerance.
        assert!((cov.clone() - cov.transpose()).amax() <= 1e-9 * cov.amax().max(1.0));
        assert!(cov[(0, 0)] >= 0.0 && cov[(1, 1)] >= 0.0);
    }

    #[test]
    fn test_nonlinear_lateration_3d() {
        let anchors = vec![
            Point::xyz(0.0, 0.0, 0.0),
            Point::xyz(8.0, 0.0, 0.0),
            Point::xyz(0.0, 8.0, 0.0),
            Point::xyz(0.0, 0.0, 8.0),
            Point::xyz(8.0, 8.0, 8.0),
        ];
        let truth = Point::xyz(2.0, 3.0, 1.0);
        let distances = distances_from(&anchors, &truth);
        let solution = nonlinear_lateration(&anchors, &distances, None, None).unwrap();
        for i in 0..3 {
            assert_relative_eq!(solution.position.get(i), truth.get(i), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_collinear_anchors_are_degenerate() {
        let anchors = vec![
            Point::xy(0.0, 0.0),
            Point::xy(1.0, 0.0),
            Point::xy(2.0, 0.0),
        ];
        let truth = Point::xy(1.0, 2.0);
        let distances = distances_from(&anchors, &truth);
        assert!(matches!(
            linear_lateration(&anchors, &distances, None),
            Err(PositioningError::NumericalFailure(_))
        ));
    }

    #[test]
    fn test_identical_anchors_are_degenerate() {
        let anchors = vec![Point::xy(1.0, 1.0); 4];
        let distances = vec![2.0; 4];
        assert!(matches!(
            linear_lateration(&anchors, &distances, None),
            Err(PositioningError::NumericalFailure(_))
        ));
    }

    #[test]
    fn test_too_few_anchors_is_not_ready() {
        let anchors = vec![Point::xy(0.0, 0.0), Point::xy(1.0, 0.0)];
        let distances = vec![1.0, 1.0];
        assert!(matches!(
            linear_lateration(&anchors, &distances, None),
            Err(PositioningError::NotReady(_))
        ));
    }

    #[test]
    fn test_mismatched_lengths_are_invalid() {
        let anchors = square_anchors();
        assert!(matches!(
            linear_lateration(&anchors, &[1.0, 2.0], None),
            Err(PositioningError::InvalidArgument(_))
        ));
        let distances = vec![1.0; 4];
        assert!(matches!(
            linear_lateration(&anchors, &distances, Some(&[1.0, 1.0])),
            Err(PositioningError::InvalidArgument(_))
        ));
        assert!(matches!(
            linear_lateration(&anchors, &distances, Some(&[1.0, -1.0, 1.0, 1.0])),
            Err(PositioningError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_weights_prefer_reliable_anchors() {
        // Three exact anchors plus one with a wildly wrong distance but a
        // huge standard deviation; the weighted solve should stay close.
        let anchors = square_anchors();
        let truth = Point::xy(3.0, 4.0);
        let mut distances = distances_from(&anchors, &truth);
        distances[3] += 5.0;
        let stds = vec![0.01, 0.01, 0.01, 100.0];
        let solution =
            nonlinear_lateration(&anchors, &distances, Some(&stds), None).unwrap();
        assert_relative_eq!(solution.position.get(0), 3.0, epsilon = 1e-3);
        assert_relative_eq!(solution.position.get(1), 4.0, epsilon = 1e-3);
    }
}
