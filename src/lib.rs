//! # Dogleg Solver
//!
//! Powell's dogleg trust-region method for nonlinear least squares:
//!
//! ```text
//! min ‖x(p)‖²,   x: ℝⁿ → ℝᵐ
//! ```
//!
//! The caller supplies a [`ResidualFunction`](core::ResidualFunction) that fills the
//! residual vector `x` and the Jacobian `J = ∂x/∂p` at a parameter vector `p`.
//!
//! ## Features
//!
//! - **Dense and sparse Jacobians**: a dense `m × n` faer matrix, or a bounded list of
//!   non-zero entries factored with a cached symbolic sparse Cholesky
//! - **Step caching**: Cauchy and Gauss-Newton steps are computed once per operating
//!   point, and JᵀJ is factored once per evaluation
//! - **Singular systems**: JᵀJ is damped (`+λI`) only when the factorization fails
//! - **Diagnostics**: per-attempt vnlog records through observers, finite-difference
//!   Jacobian checking, outlier and confidence statistics at the optimum
//!
//! ## Example
//!
//! ```no_run
//! use dogleg_solver::{DogLeg, DogLegConfig};
//! use faer::Mat;
//! use nalgebra::{DVector, dvector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut f = |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| {
//!     x[0] = 10.0 * (p[1] - p[0] * p[0]);
//!     x[1] = 1.0 - p[0];
//!     j[(0, 0)] = -20.0 * p[0];
//!     j[(0, 1)] = 10.0;
//!     j[(1, 0)] = -1.0;
//! };
//!
//! let mut solver = DogLeg::with_config(DogLegConfig::new().with_max_iterations(200));
//! let result = solver.optimize_dense(&mut f, &dvector![-1.2, 1.0], 2)?;
//! println!("{}: {}", result.status, result.parameters);
//! # Ok(())
//! # }
//! ```

/// Emit a `debug!` event if the verbosity includes human-readable output.
macro_rules! verbose {
    ($verbosity:expr, $($arg:tt)+) => {
        if $verbosity.is_human() {
            ::tracing::debug!($($arg)+);
        }
    };
}

pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;
pub mod optimizer;
pub mod outlier;

pub use core::{
    OperatingPoint, ResidualFunction, check_gradient_dense, check_gradient_sparse,
};
pub use error::{DoglegError, DoglegResult};
pub use linalg::{DenseSystem, LinearSystem, SparseJacobian, SparseSystem};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use observers::{AttemptRecord, OptObserver, OptObserverVec, VnlogWriter};
pub use optimizer::{
    DogLeg, DogLegConfig, OptimizationStatus, SolverContext, SolverResult, StepType, Verbosity,
};
pub use outlier::{OutlierError, OutlierMarking, OutlierReportRow};
