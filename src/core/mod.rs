//! Core building blocks of a dogleg solve
//!
//! - [`ResidualFunction`]: the caller-supplied residual + Jacobian evaluation
//! - [`OperatingPoint`]: one evaluated point with its cached steps
//! - Finite-difference checking of a callback's Jacobian

pub mod gradient_check;
pub mod operating_point;

use nalgebra::DVector;
use thiserror::Error;
use tracing::error;

pub use gradient_check::{
    GradientCheckRecord, GradientCheckReport, check_gradient_dense, check_gradient_sparse,
};
pub use operating_point::{CachedStep, OperatingPoint};

/// Core module error types for residual evaluation
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Dimension mismatch between parameters, residuals and the Jacobian
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Residual and Jacobian evaluation supplied by the caller.
///
/// `evaluate` must fill `residuals` (length `Nmeasurements`, already sized) with
/// `x = f(p)` and write `∂x/∂p` into `jacobian`, whose type depends on the backend:
/// a dense `Nmeasurements × Nstate` faer `Mat<f64>` (zeroed before every call), or a
/// [`SparseJacobian`](crate::linalg::SparseJacobian) receiving `(measurement, state,
/// value)` entries.
///
/// The callback must be deterministic: the same `p` yields the same `x` and `J`.
///
/// Closures implement this trait. Annotate their argument types so they are generic
/// over the reference lifetimes:
///
/// ```
/// use dogleg_solver::core::ResidualFunction;
/// use faer::Mat;
/// use nalgebra::DVector;
///
/// fn takes<R: ResidualFunction<Mat<f64>>>(_: R) {}
///
/// takes(|p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| {
///     x[0] = p[0] - 3.0;
///     j[(0, 0)] = 1.0;
/// });
/// ```
pub trait ResidualFunction<J> {
    fn evaluate(&mut self, params: &DVector<f64>, residuals: &mut DVector<f64>, jacobian: &mut J);
}

impl<J, F> ResidualFunction<J> for F
where
    F: FnMut(&DVector<f64>, &mut DVector<f64>, &mut J),
{
    fn evaluate(&mut self, params: &DVector<f64>, residuals: &mut DVector<f64>, jacobian: &mut J) {
        self(params, residuals, jacobian)
    }
}
