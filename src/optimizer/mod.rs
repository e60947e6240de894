//! Powell's dogleg trust-region optimizer.
//!
//! - [`step`]: computes one dogleg step (Cauchy, Gauss-Newton or interpolated) from an
//!   operating point and a trust-region radius
//! - [`dog_leg`]: the trust-region controller driving the accept/reject loop, its
//!   configuration and the persistent [`SolverContext`]

use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

use crate::linalg::LinearSystem;

pub mod dog_leg;
pub mod step;

pub use dog_leg::{DogLeg, DogLegConfig, SolverContext, Verbosity};

// Re-export observer types from the observers module
pub use crate::observers::{OptObserver, OptObserverVec};

/// Optimizer-specific error types for dogleg-solver
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// config.validate()
    ///     .map_err(|e| e.log())?;
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

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Kind of step proposed by the step computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Steepest-descent step, clipped to the trust region
    Cauchy,
    /// Full Gauss-Newton step, inside the trust region
    GaussNewton,
    /// Point where the Cauchy → Gauss-Newton leg leaves the trust region
    Interpolated,
    /// No step could be formed (flat steepest-descent direction)
    Failed,
}

impl StepType {
    /// Name used in vnlog diagnostics.
    pub fn vnlog_name(self) -> &'static str {
        match self {
            StepType::Cauchy => "cauchy",
            StepType::GaussNewton => "gaussnewton",
            StepType::Interpolated => "interpolated",
            StepType::Failed => "failed",
        }
    }
}

impl Display for StepType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Cauchy => write!(f, "Cauchy"),
            StepType::GaussNewton => write!(f, "Gauss-Newton"),
            StepType::Interpolated => write!(f, "Interpolated"),
            StepType::Failed => write!(f, "Failed"),
        }
    }
}

/// How a solve terminated. None of these is an error: every status comes with the
/// best point found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Every component of `Jᵀx` fell within the gradient threshold
    GradientToleranceReached,
    /// Every component of the proposed step fell within the step threshold
    ParameterToleranceReached,
    /// The configured number of accepted steps was taken
    MaxIterationsReached,
    /// Repeated rejections shrank the trust region below its threshold
    TrustRegionRadiusTooSmall,
}

impl OptimizationStatus {
    /// Gradient or step convergence, as opposed to running out of budget.
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            OptimizationStatus::GradientToleranceReached
                | OptimizationStatus::ParameterToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::TrustRegionRadiusTooSmall => {
                write!(f, "Trust region radius too small")
            }
        }
    }
}

/// Counters collected over one solve.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInfo {
    /// Infinity norm of `Jᵀx` at the final point
    pub final_gradient_norm: f64,
    /// Length of the last accepted step, 0 if none was accepted
    pub final_step_norm: f64,
    /// Final trust-region radius
    pub final_trust_region: f64,
    /// Callback invocations
    pub residual_evaluations: usize,
    /// Step attempts, accepted and rejected
    pub attempts: usize,
    /// Rejected step attempts
    pub rejected_steps: usize,
    /// Numeric JᵀJ factorizations, including failed ones
    pub factorizations: usize,
    /// Interpolations whose discriminant came out negative and was clamped to 0
    pub negative_discriminants: usize,
    /// Final damping constant λ
    pub lambda: f64,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final |Jt x|: {:.2e}, final step: {:.2e}, trust region: {:.2e}, evaluations: {}, attempts: {} ({} rejected), factorizations: {}, lambda: {:.2e}",
            self.final_gradient_norm,
            self.final_step_norm,
            self.final_trust_region,
            self.residual_evaluations,
            self.attempts,
            self.rejected_steps,
            self.factorizations,
            self.lambda
        )?;
        if self.negative_discriminants > 0 {
            write!(
                f,
                ", clamped discriminants: {}",
                self.negative_discriminants
            )?;
        }
        Ok(())
    }
}

/// Result of a solver execution.
#[derive(Debug)]
pub struct SolverResult<S: LinearSystem> {
    /// Final parameters
    pub parameters: DVector<f64>,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// `‖x‖²` at the initial parameters
    pub initial_norm2_x: f64,
    /// `‖x‖²` at the final parameters
    pub final_norm2_x: f64,
    /// Number of accepted steps
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: ConvergenceInfo,
    /// Final operating point and factorization, for follow-up diagnostics
    pub context: SolverContext<S>,
}
