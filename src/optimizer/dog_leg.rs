//! Powell's dogleg trust-region controller.
//!
//! Minimizes `‖x(p)‖²` for a residual callback `p ↦ (x, J)`. Every step attempt
//! proposes a dogleg step (see [`step`](crate::optimizer::step)) for the current
//! radius Δ, evaluates the callback at the proposed point and compares the observed
//! improvement of `‖x‖²` with the improvement predicted by the linear model:
//!
//! ```text
//! ρ = (‖x_before‖² − ‖x_after‖²) / (−2 (Jᵀx)·step − ‖J·step‖²)
//! ```
//!
//! # Trust region update
//!
//! - `ρ < 0.25`: Δ ← 0.1·Δ. If the step did not reach the trust-region edge (a full
//!   Gauss-Newton step), Δ is first set to that step's length so the next attempt
//!   actually differs.
//! - `ρ > 0.75` and the step reached the edge: Δ ← 2·Δ.
//! - otherwise Δ is unchanged.
//!
//! The step is accepted iff `ρ > 0`.
//!
//! # Termination
//!
//! | Condition | Status |
//! |-----------|--------|
//! | every `|(Jᵀx)ᵢ|` ≤ gradient threshold | [`GradientToleranceReached`](OptimizationStatus::GradientToleranceReached) |
//! | every `|stepᵢ|` ≤ step threshold | [`ParameterToleranceReached`](OptimizationStatus::ParameterToleranceReached) |
//! | `max_iterations` steps accepted | [`MaxIterationsReached`](OptimizationStatus::MaxIterationsReached) |
//! | Δ below threshold after a rejection | [`TrustRegionRadiusTooSmall`](OptimizationStatus::TrustRegionRadiusTooSmall) |
//!
//! A step that meets the step threshold is not applied: the solve ends at the point it
//! was proposed from.
//!
//! # Example
//!
//! ```no_run
//! use dogleg_solver::optimizer::{DogLeg, DogLegConfig};
//! use faer::Mat;
//! use nalgebra::{DVector, dvector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // x = [p0 - 3, p1 - 4]
//! let mut f = |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| {
//!     x[0] = p[0] - 3.0;
//!     x[1] = p[1] - 4.0;
//!     j[(0, 0)] = 1.0;
//!     j[(1, 1)] = 1.0;
//! };
//!
//! let mut solver = DogLeg::with_config(DogLegConfig::new().with_max_iterations(50));
//! let result = solver.optimize_dense(&mut f, &dvector![0.0, 0.0], 2)?;
//! println!("{} -> {}", result.status, result.parameters);
//! # Ok(())
//! # }
//! ```

use faer::Mat;
use nalgebra::DVector;
use std::mem;
use tracing::{debug, warn};
use web_time as time;

use crate::{
    core::{OperatingPoint, ResidualFunction, operating_point::CachedStep},
    error::DoglegResult,
    linalg::{self, DenseSystem, JtJFactorization, LinearSystem, SparseJacobian, SparseSystem},
    observers::{AttemptRecord, OptObserver, OptObserverVec, VnlogWriter},
    optimizer::{
        ConvergenceInfo, OptimizationStatus, OptimizerError, OptimizerResult, SolverResult,
        StepType, step,
    },
};

/// Which diagnostics a solve produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// No diagnostics
    #[default]
    Silent,
    /// Free-form progress messages at `debug` level
    Human,
    /// One vnlog line per step attempt
    Vnlog,
    /// Both of the above
    HumanAndVnlog,
}

impl Verbosity {
    pub fn is_human(self) -> bool {
        matches!(self, Verbosity::Human | Verbosity::HumanAndVnlog)
    }

    pub fn is_vnlog(self) -> bool {
        matches!(self, Verbosity::Vnlog | Verbosity::HumanAndVnlog)
    }
}

/// Configuration parameters for the dogleg optimizer.
///
/// ```
/// use dogleg_solver::optimizer::{DogLegConfig, Verbosity};
///
/// let config = DogLegConfig::new()
///     .with_max_iterations(200)
///     .with_initial_trust_region(10.0)
///     .with_thresholds(1e-10, 1e-10, 0.0) // trust-region threshold unchanged
///     .with_verbosity(Verbosity::Human);
/// assert_eq!(config.trust_region_threshold, 1e-8);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DogLegConfig {
    /// Maximum number of accepted steps
    pub max_iterations: usize,
    /// Trust-region radius of the first attempt
    pub initial_trust_region: f64,
    /// Radius multiplier after a poor step
    pub trust_region_decrease_factor: f64,
    /// ρ below which a step is poor
    pub trust_region_decrease_threshold: f64,
    /// Radius multiplier after a good step that reached the edge
    pub trust_region_increase_factor: f64,
    /// ρ above which a step is good
    pub trust_region_increase_threshold: f64,
    /// Converged once every component of `Jᵀx` is within this
    pub gradient_threshold: f64,
    /// Converged once every component of a proposed step is within this
    pub step_threshold: f64,
    /// Give up once a rejection leaves the radius below this
    pub trust_region_threshold: f64,
    pub verbosity: Verbosity,
    /// How many times the JᵀJ damping may grow by 10× before a singular system is an error
    pub max_damping_escalations: usize,
}

impl Default for DogLegConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            initial_trust_region: 1.0e3,
            trust_region_decrease_factor: 0.1,
            trust_region_decrease_threshold: 0.25,
            trust_region_increase_factor: 2.0,
            trust_region_increase_threshold: 0.75,
            gradient_threshold: 1e-8,
            step_threshold: 1e-8,
            trust_region_threshold: 1e-8,
            verbosity: Verbosity::Silent,
            max_damping_escalations: 20,
        }
    }
}

impl DogLegConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of accepted steps
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the initial trust-region radius
    pub fn with_initial_trust_region(mut self, radius: f64) -> Self {
        self.initial_trust_region = radius;
        self
    }

    /// Set the radius multipliers for good and poor steps
    pub fn with_trust_region_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.trust_region_increase_factor = increase;
        self.trust_region_decrease_factor = decrease;
        self
    }

    /// Set the ρ thresholds classifying poor and good steps
    pub fn with_step_quality_thresholds(mut self, poor: f64, good: f64) -> Self {
        self.trust_region_decrease_threshold = poor;
        self.trust_region_increase_threshold = good;
        self
    }

    /// Set the termination thresholds. Non-positive values leave the corresponding
    /// threshold unchanged.
    pub fn with_thresholds(mut self, gradient: f64, step: f64, trust_region: f64) -> Self {
        if gradient > 0.0 {
            self.gradient_threshold = gradient;
        }
        if step > 0.0 {
            self.step_threshold = step;
        }
        if trust_region > 0.0 {
            self.trust_region_threshold = trust_region;
        }
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set how often a singular JᵀJ may be retried with more damping
    pub fn with_max_damping_escalations(mut self, max_damping_escalations: usize) -> Self {
        self.max_damping_escalations = max_damping_escalations;
        self
    }

    /// Check that the parameters describe a terminating trust-region schedule.
    pub fn validate(&self) -> OptimizerResult<()> {
        let positive = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(OptimizerError::InvalidParameters(format!(
                    "{name} must be positive and finite, got {value}"
                ))
                .log())
            }
        };
        positive("initial_trust_region", self.initial_trust_region)?;
        positive("gradient_threshold", self.gradient_threshold)?;
        positive("step_threshold", self.step_threshold)?;
        positive("trust_region_threshold", self.trust_region_threshold)?;

        if !(self.trust_region_decrease_factor > 0.0 && self.trust_region_decrease_factor < 1.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "trust_region_decrease_factor must be in (0, 1), got {}",
                self.trust_region_decrease_factor
            ))
            .log());
        }
        if !(self.trust_region_increase_factor >= 1.0 && self.trust_region_increase_factor.is_finite())
        {
            return Err(OptimizerError::InvalidParameters(format!(
                "trust_region_increase_factor must be at least 1, got {}",
                self.trust_region_increase_factor
            ))
            .log());
        }
        if !(self.trust_region_decrease_threshold <= self.trust_region_increase_threshold) {
            return Err(OptimizerError::InvalidParameters(format!(
                "step quality thresholds out of order: poor {} > good {}",
                self.trust_region_decrease_threshold, self.trust_region_increase_threshold
            ))
            .log());
        }
        Ok(())
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Dogleg\n\nConvergence Criteria:\n  Max iterations:         {}\n  Gradient threshold:     {:.2e}\n  Step threshold:         {:.2e}\n  Trust region threshold: {:.2e}\n\nTrust Region:\n  Initial radius:         {:.2e}\n  Decrease:               x{} when rho < {}\n  Increase:               x{} when rho > {}\n\nDamping:\n  Max escalations:        {}",
            self.max_iterations,
            self.gradient_threshold,
            self.step_threshold,
            self.trust_region_threshold,
            self.initial_trust_region,
            self.trust_region_decrease_factor,
            self.trust_region_decrease_threshold,
            self.trust_region_increase_factor,
            self.trust_region_increase_threshold,
            self.max_damping_escalations
        );
    }
}

/// Final state of a solve, kept for follow-up analysis at the optimum.
///
/// Holds the final operating point (with its Jacobian) and the JᵀJ factorization.
/// The outlier and confidence analysis in [`outlier`](crate::outlier) works on this.
#[derive(Debug)]
pub struct SolverContext<S: LinearSystem> {
    pub(crate) point: OperatingPoint<S>,
    pub(crate) jtj: JtJFactorization<S>,
    pub(crate) config: DogLegConfig,
}

impl<S: LinearSystem> SolverContext<S> {
    /// Final operating point.
    pub fn point(&self) -> &OperatingPoint<S> {
        &self.point
    }

    pub fn factorization(&self) -> &JtJFactorization<S> {
        &self.jtj
    }

    pub fn config(&self) -> &DogLegConfig {
        &self.config
    }

    pub fn nstate(&self) -> usize {
        self.point.nstate()
    }

    pub fn nmeasurements(&self) -> usize {
        self.point.nmeasurements()
    }

    /// Make sure JᵀJ is factored for the final point and solve `JᵀJ · X = rhs`.
    pub fn solve_jtj(&mut self, rhs: &Mat<f64>) -> DoglegResult<Mat<f64>> {
        self.jtj.ensure(&self.point.system, self.point.generation)?;
        Ok(self.jtj.solve(rhs)?)
    }
}

/// Dogleg solver.
///
/// ```no_run
/// use dogleg_solver::linalg::SparseJacobian;
/// use dogleg_solver::optimizer::{DogLeg, DogLegConfig, Verbosity};
/// use nalgebra::{DVector, dvector};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut f = |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut SparseJacobian| {
///     x[0] = p[0] * p[0] - 2.0;
///     j.push(0, 0, 2.0 * p[0]);
/// };
/// let mut solver = DogLeg::with_config(DogLegConfig::new().with_verbosity(Verbosity::Vnlog));
/// let result = solver.optimize_sparse(&mut f, &dvector![1.0], 1, 1)?;
/// # Ok(())
/// # }
/// ```
pub struct DogLeg {
    config: DogLegConfig,
    observers: OptObserverVec,
}

impl Default for DogLeg {
    fn default() -> Self {
        Self::new()
    }
}

impl DogLeg {
    /// Create a new dogleg solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(DogLegConfig::default())
    }

    /// Create a new dogleg solver with the given configuration.
    pub fn with_config(config: DogLegConfig) -> Self {
        Self {
            config,
            observers: OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &DogLegConfig {
        &self.config
    }

    /// Add an observer receiving one [`AttemptRecord`] per step attempt.
    ///
    /// With [`Verbosity::Vnlog`] and no observer registered, a [`VnlogWriter`] on
    /// stdout is added at the start of the first solve.
    pub fn add_observer(&mut self, observer: impl OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Minimize `‖x‖²` for a callback filling a dense `nmeasurements × nstate` Jacobian.
    pub fn optimize_dense<R>(
        &mut self,
        f: &mut R,
        initial: &DVector<f64>,
        nmeasurements: usize,
    ) -> DoglegResult<SolverResult<DenseSystem>>
    where
        R: ResidualFunction<Mat<f64>> + ?Sized,
    {
        self.optimize::<DenseSystem, R>(f, initial, nmeasurements, 0)
    }

    /// Minimize `‖x‖²` for a callback pushing at most `nnz` Jacobian entries per evaluation.
    pub fn optimize_sparse<R>(
        &mut self,
        f: &mut R,
        initial: &DVector<f64>,
        nmeasurements: usize,
        nnz: usize,
    ) -> DoglegResult<SolverResult<SparseSystem>>
    where
        R: ResidualFunction<SparseJacobian> + ?Sized,
    {
        if nnz == 0 {
            return Err(OptimizerError::InvalidParameters(
                "a sparse solve needs a non-zero Jacobian capacity".to_string(),
            )
            .log()
            .into());
        }
        self.optimize::<SparseSystem, R>(f, initial, nmeasurements, nnz)
    }

    fn optimize<S, R>(
        &mut self,
        f: &mut R,
        initial: &DVector<f64>,
        nmeasurements: usize,
        nnz: usize,
    ) -> DoglegResult<SolverResult<S>>
    where
        S: LinearSystem,
        R: ResidualFunction<S::JacobianBuffer> + ?Sized,
    {
        self.config.validate()?;
        let nstate = initial.len();
        if nstate == 0 || nmeasurements == 0 {
            return Err(OptimizerError::InvalidParameters(format!(
                "empty problem: {nstate} parameters, {nmeasurements} measurements"
            ))
            .log()
            .into());
        }
        if nstate > nmeasurements {
            warn!(
                "problem is underdetermined: {} parameters but only {} measurements",
                nstate, nmeasurements
            );
        }

        let config = self.config.clone();
        let verbosity = config.verbosity;
        if verbosity.is_vnlog() && self.observers.is_empty() {
            self.observers.add(VnlogWriter::stdout());
        }
        if verbosity.is_human() {
            config.print_configuration();
        }

        let start_time = time::Instant::now();
        let mut before = OperatingPoint::<S>::allocate(initial.clone(), nmeasurements, nnz)?;
        let mut after = OperatingPoint::<S>::allocate(initial.clone(), nmeasurements, nnz)?;
        let mut jtj = JtJFactorization::<S>::new(config.max_damping_escalations);
        let mut info = ConvergenceInfo::default();
        let mut generation = 1;
        let mut trust_region = config.initial_trust_region;
        let mut iterations = 0;
        let mut last_step_len = 0.0;

        self.observers.start();

        let initial_converged = before.evaluate(f, config.gradient_threshold, generation)?;
        info.residual_evaluations += 1;
        let initial_norm2_x = before.norm2_x;
        verbose!(
            verbosity,
            "Initial operating point has norm2_x {:.6e}",
            initial_norm2_x
        );

        let status = if initial_converged {
            verbose!(verbosity, "Jt_x all below the threshold. Done iterating!");
            OptimizationStatus::GradientToleranceReached
        } else {
            'steps: loop {
                if iterations >= config.max_iterations {
                    verbose!(verbosity, "Exceeded max number of iterations");
                    break 'steps OptimizationStatus::MaxIterationsReached;
                }
                verbose!(verbosity, "================= step {}", iterations);

                loop {
                    info.attempts += 1;
                    let mut record = AttemptRecord {
                        iteration: iterations,
                        norm2x_before: Some(before.norm2_x),
                        trustregion_before: Some(trust_region),
                        ..Default::default()
                    };
                    verbose!(verbosity, "taking step with trustregion {:.6e}", trust_region);

                    let Some(proposed) = step::compute_step(
                        &mut before,
                        trust_region,
                        &mut jtj,
                        verbosity,
                        &mut after.step_to_here.step,
                    )?
                    else {
                        record.step_type = Some(StepType::Failed);
                        self.observers.notify(&record);
                        warn!("gradient is flat along steepest descent; stopping");
                        break 'steps OptimizationStatus::GradientToleranceReached;
                    };
                    info.negative_discriminants += usize::from(proposed.discriminant_clamped);
                    after.step_to_here.set_from_step();

                    after.p.copy_from(&before.p);
                    after.p += &after.step_to_here.step;
                    let expected = step::expected_improvement(&before, &after.step_to_here.step);

                    record.step_type = Some(proposed.step_type);
                    record.step_len = Some(proposed.len_sq.sqrt());
                    record.step_len_cauchy = Some(proposed.cauchy_len_sq.sqrt());
                    record.step_len_gauss_newton = proposed.gauss_newton_len_sq.map(f64::sqrt);
                    record.k_cauchy_to_gn = proposed.k_cauchy_to_gn;
                    if proposed.step_type == StepType::Interpolated {
                        record.step_len_interpolated = record.step_len;
                    }
                    record.expected_improvement = Some(expected);
                    record.step_direction_change_deg =
                        direction_change_deg(&after.step_to_here, &before.step_to_here);

                    if linalg::all_within(&after.step_to_here.step, config.step_threshold) {
                        verbose!(verbosity, "update small enough. Done iterating!");
                        record.accepted = true;
                        self.observers.notify(&record);
                        break 'steps OptimizationStatus::ParameterToleranceReached;
                    }

                    generation += 1;
                    let after_converged =
                        after.evaluate(f, config.gradient_threshold, generation)?;
                    info.residual_evaluations += 1;
                    record.norm2x_after = Some(after.norm2_x);
                    verbose!(
                        verbosity,
                        "Evaluated operating point with norm2_x {:.6e}",
                        after.norm2_x
                    );

                    let accepted = adjust_trust_region(
                        &config,
                        &before,
                        &after,
                        expected,
                        &mut trust_region,
                        &mut record,
                    );
                    record.accepted = accepted;
                    self.observers.notify(&record);

                    if accepted {
                        verbose!(verbosity, "accepted step");
                        iterations += 1;
                        last_step_len = after.step_to_here.len_sq.sqrt();
                        mem::swap(&mut before, &mut after);
                        if after_converged {
                            verbose!(verbosity, "Jt_x all below the threshold. Done iterating!");
                            break 'steps OptimizationStatus::GradientToleranceReached;
                        }
                        break;
                    }

                    info.rejected_steps += 1;
                    verbose!(verbosity, "rejected step");
                    if trust_region < config.trust_region_threshold {
                        verbose!(verbosity, "trust region too small. Giving up");
                        break 'steps OptimizationStatus::TrustRegionRadiusTooSmall;
                    }
                }
            }
        };

        info.final_gradient_norm = max_abs(&before.jt_x);
        info.final_step_norm = last_step_len;
        info.final_trust_region = trust_region;
        info.factorizations = jtj.factorizations();
        info.lambda = jtj.lambda();

        verbose!(
            verbosity,
            "Dogleg finished: {} after {} steps, norm2_x {:.6e} -> {:.6e}. {}",
            status,
            iterations,
            initial_norm2_x,
            before.norm2_x,
            info
        );

        Ok(SolverResult {
            parameters: before.p.clone(),
            status,
            initial_norm2_x,
            final_norm2_x: before.norm2_x,
            iterations,
            elapsed_time: start_time.elapsed(),
            convergence_info: info,
            context: SolverContext {
                point: before,
                jtj,
                config,
            },
        })
    }
}

/// Update the radius from the attempt's ρ and decide acceptance.
fn adjust_trust_region<S: LinearSystem>(
    config: &DogLegConfig,
    before: &OperatingPoint<S>,
    after: &OperatingPoint<S>,
    expected_improvement: f64,
    trust_region: &mut f64,
    record: &mut AttemptRecord,
) -> bool {
    let observed = before.norm2_x - after.norm2_x;
    let mut rho = observed / expected_improvement;
    if rho.is_nan() {
        rho = f64::NEG_INFINITY;
    }
    verbose!(
        config.verbosity,
        "observed/expected improvement: {:.6e}/{:.6e}. rho = {:.6e}",
        observed,
        expected_improvement,
        rho
    );

    if rho < config.trust_region_decrease_threshold {
        // A step inside the region shrinks from its own length.
        if !before.hit_trust_region_edge {
            if let Some(len_sq) = before.gauss_newton.len_sq() {
                *trust_region = len_sq.sqrt();
            }
        }
        *trust_region *= config.trust_region_decrease_factor;
        verbose!(
            config.verbosity,
            "rho too small. decreased trust region to {:.6e}",
            *trust_region
        );
    } else if rho > config.trust_region_increase_threshold && before.hit_trust_region_edge {
        *trust_region *= config.trust_region_increase_factor;
        verbose!(
            config.verbosity,
            "rho large enough. increased trust region to {:.6e}",
            *trust_region
        );
    }

    record.observed_improvement = Some(observed);
    record.rho = Some(rho);
    record.trustregion_after = Some(*trust_region);
    rho > 0.0
}

/// Largest `|vᵢ|`, NaN if any component is NaN.
fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |m: f64, x| {
        if m.is_nan() || x.is_nan() {
            f64::NAN
        } else {
            m.max(x.abs())
        }
    })
}

/// Angle in degrees between a step and the step that reached its origin.
fn direction_change_deg(step: &CachedStep, previous: &CachedStep) -> Option<f64> {
    let previous_len_sq = previous.len_sq()?;
    let cos = step.step.dot(&previous.step) / (step.len_sq * previous_len_sq).sqrt();
    if cos.is_nan() {
        None
    } else if cos >= 1.0 {
        Some(0.0)
    } else if cos <= -1.0 {
        Some(180.0)
    } else {
        Some(cos.acos().to_degrees())
    }
}
