//! Inner (non-robust) estimators: least-squares source fitting and
//! multilateration.

pub mod lateration;
mod levenberg;
mod observation;

pub use lateration::{linear_lateration, nonlinear_lateration, LaterationSolution};
pub use observation::{fit_source, reading_residual, SourceFit, SourceFitConfig};
