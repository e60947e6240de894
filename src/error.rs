//! Error types for the dogleg-solver library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`DoglegError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`CoreError`, `LinAlgError`, `OptimizerError`, `OutlierError`,
//!   `ObserverError`) are wrapped inside DoglegError
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Normal terminations of a solve (converged, iteration limit, trust region collapsed)
//! are not errors; they are reported through
//! [`OptimizationStatus`](crate::optimizer::OptimizationStatus).
//!
//! Example error chain:
//! ```text
//! DoglegError::LinearAlgebra(
//!     LinAlgError::PersistentSingularity { lambda: 1e9, escalations: 20 }
//! )
//! ```

use crate::{
    core::CoreError, linalg::LinAlgError, observers::ObserverError, optimizer::OptimizerError,
    outlier::OutlierError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the dogleg-solver library
pub type DoglegResult<T> = Result<T, DoglegError>;

/// Main error type for the dogleg-solver library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = solver.optimize_dense(&mut f, &p0, nmeas) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum DoglegError {
    /// Residual evaluation errors (dimension mismatches, bad inputs)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization setup errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Outlier and confidence analysis errors
    #[error(transparent)]
    Outlier(#[from] OutlierError),

    /// Diagnostics output errors
    #[error(transparent)]
    Observer(#[from] ObserverError),
}

impl DoglegError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// ```rust,ignore
    /// match solver.optimize_sparse(&mut f, &p0, nmeas, nnz) {
    ///     Ok(result) => { /* ... */ }
    ///     Err(e) => {
    ///         warn!("Error chain: {}", e.chain());
    ///         // Output: "Linear algebra error: JtJ is persistently singular ..."
    ///     }
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dogleg_error_display() {
        let error = DoglegError::from(LinAlgError::JacobianNnzExceeded {
            capacity: 4,
            written: 6,
        });
        assert!(error.to_string().contains("at most 4 non-zeros"));
    }

    #[test]
    fn test_dogleg_error_chain() {
        let error = DoglegError::from(LinAlgError::PersistentSingularity {
            lambda: 1e9,
            escalations: 20,
        });

        let chain = error.chain();
        assert!(chain.contains("persistently singular"));
        assert!(chain.contains("20 escalations"));
    }

    #[test]
    fn test_dogleg_error_chain_compact() {
        let error = DoglegError::from(CoreError::DimensionMismatch(
            "residual vector has 3 entries, expected 4".to_string(),
        ));
        assert!(error.chain_compact().contains("expected 4"));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let dogleg_error: DoglegError = OutlierError::UnsupportedFeatureSize(3).into();
        match dogleg_error {
            DoglegError::Outlier(OutlierError::UnsupportedFeatureSize(3)) => {}
            _ => panic!("Expected Outlier variant"),
        }
    }

    #[test]
    fn test_dogleg_result_err() {
        let result: DoglegResult<i32> = Err(DoglegError::from(CoreError::InvalidInput(
            "empty parameter vector".to_string(),
        )));
        assert!(result.is_err());
    }
}
