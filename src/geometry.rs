//! Coordinate and covariance primitives shared by the estimators.

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::errors::{PositioningError, Result};

/// An inhomogeneous coordinate vector of fixed dimension 2 or 3.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Point {
    coords: DVector<f64>,
}

impl Point {
    /// Build a 2D point.
    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            coords: DVector::from_vec(vec![x, y]),
        }
    }

    /// Build a 3D point.
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self {
            coords: DVector::from_vec(vec![x, y, z]),
        }
    }

    /// Build a point from a coordinate slice of length 2 or 3.
    pub fn from_slice(coords: &[f64]) -> Result<Self> {
        if coords.len() != 2 && coords.len() != 3 {
            return Err(PositioningError::InvalidArgument(format!(
                "point dimension must be 2 or 3, got {}",
                coords.len()
            )));
        }
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(PositioningError::InvalidArgument(
                "point coordinates must be finite".into(),
            ));
        }
        Ok(Self {
            coords: DVector::from_column_slice(coords),
        })
    }

    pub(crate) fn from_vector(coords: DVector<f64>) -> Self {
        debug_assert!(coords.len() == 2 || coords.len() == 3);
        Self { coords }
    }

    /// Number of coordinates (2 or 3).
    pub fn dim(&self) -> usize {
        self.coords.len()
    }

    /// Read one coordinate. Panics if `index >= dim()`.
    pub fn get(&self, index: usize) -> f64 {
        self.coords[index]
    }

    /// Write one coordinate. Panics if `index >= dim()`.
    pub fn set(&mut self, index: usize, value: f64) {
        self.coords[index] = value;
    }

    /// Borrow the underlying coordinate vector.
    pub fn coords(&self) -> &DVector<f64> {
        &self.coords
    }

    /// Euclidean distance to another point of the same dimension.
    ///
    /// Panics on dimension mismatch, matching the behavior of the underlying
    /// algebra types.
    pub fn distance_to(&self, other: &Point) -> f64 {
        assert_eq!(self.dim(), other.dim(), "point dimension mismatch");
        (&self.coords - &other.coords).norm()
    }
}

/// Component-wise mean of a non-empty set of same-dimension points.
pub(crate) fn centroid(points: &[&Point]) -> Result<Point> {
    let first = points.first().ok_or_else(|| {
        PositioningError::InvalidArgument("cannot take the centroid of no points".into())
    })?;
    let dim = first.dim();
    let mut sum = DVector::zeros(dim);
    for p in points {
        if p.dim() != dim {
            return Err(PositioningError::InvalidArgument(
                "centroid over mixed-dimension points".into(),
            ));
        }
        sum += p.coords();
    }
    Ok(Point::from_vector(sum / points.len() as f64))
}

/// Validate a covariance attached to a D-dimensional location: square, D×D,
/// finite and symmetric within tolerance.
pub(crate) fn validate_covariance(cov: &DMatrix<f64>, dim: usize) -> Result<()> {
    if cov.nrows() != dim || cov.ncols() != dim {
        return Err(PositioningError::InvalidArgument(format!(
            "covariance must be {dim}x{dim}, got {}x{}",
            cov.nrows(),
            cov.ncols()
        )));
    }
    if cov.iter().any(|v| !v.is_finite()) {
        return Err(PositioningError::InvalidArgument(
            "covariance entries must be finite".into(),
        ));
    }
    let asym = (cov - cov.transpose()).amax();
    let scale = cov.amax().max(1.0);
    if asym > 1e-9 * scale {
        return Err(PositioningError::InvalidArgument(
            "covariance must be symmetric".into(),
        ));
    }
    Ok(())
}
