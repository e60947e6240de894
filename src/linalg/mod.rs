//! Linear algebra backends for the dogleg solver.
//!
//! The optimizer is written once against the [`LinearSystem`] capability and runs on
//! either of two Jacobian representations, fixed for the lifetime of a solve:
//!
//! - [`DenseSystem`]: an `Nmeasurements × Nstate` faer [`Mat`], with JᵀJ built by
//!   accumulating row outer products and factored with a dense LLᵀ.
//! - [`SparseSystem`]: the Jacobian collected as triplets into a compressed
//!   per-measurement layout (the columns of Jᵀ), with JᵀJ factored by faer's sparse
//!   LLᵀ and the symbolic analysis cached while the pattern is stable.
//!
//! [`JtJFactorization`] owns the damping constant λ and decides when a fresh
//! factorization is needed.

pub mod dense;
pub mod factorization;
pub mod sparse;

use faer::Mat;
use nalgebra::DVector;
use std::fmt::Debug;
use thiserror::Error;
use tracing::error;

pub use dense::{DenseCholesky, DenseSystem};
pub use factorization::JtJFactorization;
pub use sparse::{SparseCholesky, SparseJacobian, SparseSystem};

/// Linear algebra specific error types for dogleg-solver
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed for a reason other than rank deficiency
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// JᵀJ stayed singular after every allowed damping escalation
    #[error(
        "JtJ is persistently singular: still rank deficient with lambda = {lambda:.3e} after {escalations} escalations"
    )]
    PersistentSingularity { lambda: f64, escalations: usize },

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix shape or format does not match what the system was allocated with
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// The residual callback wrote more Jacobian entries than were allocated
    #[error("Sparse Jacobian holds at most {capacity} non-zeros, callback wrote {written}")]
    JacobianNnzExceeded { capacity: usize, written: usize },

    /// A Jacobian entry or column was addressed outside the allocated shape
    #[error("Index ({row}, {col}) out of bounds for a {nrows}x{ncols} matrix")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This method logs both the LinAlgError and the underlying error
    /// from external libraries (e.g., faer's FaerError, LltError, CreationError).
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// A Cholesky factorization of `JᵀJ + λI` that can solve against multiple right-hand sides.
pub trait Factorization: Default + Debug {
    /// Whether a numeric factorization is currently held.
    fn is_factored(&self) -> bool;

    /// Drop the numeric factor, keeping anything reusable (symbolic analysis).
    fn invalidate(&mut self);

    /// Solve `(JᵀJ + λI) X = rhs` for an `Nstate × k` right-hand side.
    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>>;
}

/// Capability set the dogleg iteration needs from a Jacobian representation.
///
/// One implementation exists per storage scheme. The optimizer, the outlier analyzer
/// and the gradient checker are generic over this trait, so every algorithm is
/// written once for both representations.
pub trait LinearSystem: Sized + Debug {
    /// What the residual callback writes the Jacobian into.
    type JacobianBuffer;
    /// Factorization type produced by [`LinearSystem::factorize`].
    type Factorization: Factorization;

    /// Allocate storage for an `Nmeasurements × Nstate` Jacobian. `nnz` is the
    /// non-zero capacity for sparse storage and ignored by dense storage.
    fn allocate(nstate: usize, nmeasurements: usize, nnz: usize) -> LinAlgResult<Self>;

    fn nstate(&self) -> usize;

    fn nmeasurements(&self) -> usize;

    /// Reset the buffer before the callback fills it.
    fn prepare(&mut self);

    /// Buffer the residual callback writes into.
    fn buffer_mut(&mut self) -> &mut Self::JacobianBuffer;

    /// Validate what the callback wrote and bring derived storage up to date.
    fn commit(&mut self) -> LinAlgResult<()>;

    /// `Jᵀ v` for a measurement-space vector `v`.
    fn jt_mul(&self, v: &DVector<f64>) -> DVector<f64>;

    /// `‖J v‖²` for a state-space vector `v`.
    fn norm2_j_mul(&self, v: &DVector<f64>) -> f64;

    /// Jacobian entry `∂x[measurement] / ∂p[state]`.
    fn entry(&self, measurement: usize, state: usize) -> f64;

    /// Columns `measurement0 .. measurement0 + count` of Jᵀ as a dense `Nstate × count`
    /// block. Columns past the last measurement are zero.
    fn jt_block(&self, measurement0: usize, count: usize) -> Mat<f64>;

    /// Row `measurement` of J dotted with column `col` of an `Nstate × k` matrix.
    fn row_dot(&self, measurement: usize, rhs: &Mat<f64>, col: usize) -> f64;

    /// Factor `JᵀJ + λI` into `factorization`. Returns `Ok(false)` when the matrix is
    /// not positive definite, so the caller can escalate λ and retry.
    fn factorize(&self, lambda: f64, factorization: &mut Self::Factorization)
    -> LinAlgResult<bool>;
}

/// Emit the lower triangle of the outer product `r rᵀ` of one sparse Jacobian row.
///
/// `entries` holds `(state, value)` pairs sorted by state. `emit(row, col, value)` is
/// called with `row >= col`.
pub(crate) fn for_each_lower_outer_product<F>(entries: &[(usize, f64)], mut emit: F)
where
    F: FnMut(usize, usize, f64),
{
    for (a, &(col, value_col)) in entries.iter().enumerate() {
        for &(row, value_row) in &entries[a..] {
            emit(row, col, value_row * value_col);
        }
    }
}

/// Squared Euclidean norm.
#[inline]
pub fn norm2(v: &DVector<f64>) -> f64 {
    v.iter().map(|x| x * x).sum()
}

/// `true` iff every component has absolute value at most `threshold`.
#[inline]
pub fn all_within(v: &DVector<f64>, threshold: f64) -> bool {
    v.iter().all(|x| x.abs() <= threshold)
}

/// Copy a state-space vector into an `n × 1` faer column.
pub(crate) fn to_column(v: &DVector<f64>) -> Mat<f64> {
    Mat::from_fn(v.len(), 1, |i, _| v[i])
}
