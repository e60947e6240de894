//! Dogleg step computation.
//!
//! Given an operating point and a trust-region radius Δ:
//!
//! 1. Cauchy step `a = k·Jᵀx`, `k = −‖Jᵀx‖² / ‖J Jᵀx‖²`, the minimizer of the
//!    quadratic model along the steepest-descent ray. If `‖a‖ ≥ Δ` the step is `a`
//!    scaled to length Δ.
//! 2. Otherwise the Gauss-Newton step `b = −(JᵀJ)⁻¹ Jᵀx`. If `‖b‖ ≤ Δ` it is taken as is.
//! 3. Otherwise the point where the segment `a + t(b − a)` leaves the trust region:
//!
//! ```text
//! ‖a + t(b − a)‖² = Δ²
//! l2 = ‖a − b‖²,  −c = (a − b)·a
//! t = (−c + √(c² − l2 (‖a‖² − Δ²))) / l2
//! ```
//!
//! Since `‖a‖ < Δ` the discriminant is positive and the `+` root lies in `[0, 1]`.
//!
//! Cauchy and Gauss-Newton steps are cached on the operating point, so retrying from
//! the same point with a smaller radius costs no further solve.

use nalgebra::DVector;
use tracing::warn;

use crate::{
    core::{CoreError, OperatingPoint},
    error::DoglegResult,
    linalg::{self, JtJFactorization, LinearSystem},
    optimizer::{StepType, Verbosity},
};

/// Description of a step written by [`compute_step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposedStep {
    pub step_type: StepType,
    /// Squared length of the step taken
    pub len_sq: f64,
    /// Squared length of the unclipped Cauchy step
    pub cauchy_len_sq: f64,
    /// Squared length of the Gauss-Newton step, if it was needed
    pub gauss_newton_len_sq: Option<f64>,
    /// Position along the Cauchy → Gauss-Newton leg, for interpolated steps
    pub k_cauchy_to_gn: Option<f64>,
    /// The interpolation discriminant was negative and clamped to 0
    pub discriminant_clamped: bool,
}

impl ProposedStep {
    pub fn hit_trust_region_edge(&self) -> bool {
        self.step_type != StepType::GaussNewton
    }
}

/// Write the dogleg step from `from` for radius `trust_region` into `step`.
///
/// Returns `None` when the steepest-descent curvature `‖J Jᵀx‖²` is zero, in which
/// case no step can be formed and `step` is left untouched. A non-finite gradient or
/// curvature means the callback produced NaN or Inf and is an error.
pub fn compute_step<S: LinearSystem>(
    from: &mut OperatingPoint<S>,
    trust_region: f64,
    jtj: &mut JtJFactorization<S>,
    verbosity: Verbosity,
    step: &mut DVector<f64>,
) -> DoglegResult<Option<ProposedStep>> {
    if !ensure_cauchy(from, verbosity)? {
        return Ok(None);
    }
    let cauchy_len_sq = from.cauchy.len_sq;
    let trust_region_sq = trust_region * trust_region;

    if cauchy_len_sq >= trust_region_sq {
        verbose!(verbosity, "taking cauchy step");
        step.copy_from(&from.cauchy.step);
        *step *= trust_region / cauchy_len_sq.sqrt();
        from.hit_trust_region_edge = true;
        return Ok(Some(ProposedStep {
            step_type: StepType::Cauchy,
            len_sq: linalg::norm2(step),
            cauchy_len_sq,
            gauss_newton_len_sq: None,
            k_cauchy_to_gn: None,
            discriminant_clamped: false,
        }));
    }

    ensure_gauss_newton(from, jtj, verbosity)?;
    let gauss_newton_len_sq = from.gauss_newton.len_sq;

    if gauss_newton_len_sq <= trust_region_sq {
        verbose!(verbosity, "taking GN step");
        step.copy_from(&from.gauss_newton.step);
        from.hit_trust_region_edge = false;
        return Ok(Some(ProposedStep {
            step_type: StepType::GaussNewton,
            len_sq: gauss_newton_len_sq,
            cauchy_len_sq,
            gauss_newton_len_sq: Some(gauss_newton_len_sq),
            k_cauchy_to_gn: None,
            discriminant_clamped: false,
        }));
    }

    verbose!(verbosity, "taking interpolated step");
    let (k, discriminant_clamped) = interpolate(
        &from.cauchy.step,
        cauchy_len_sq,
        &from.gauss_newton.step,
        trust_region_sq,
        step,
    );
    let len_sq = linalg::norm2(step);
    verbose!(
        verbosity,
        "k_cauchy_to_gn {:.6e}, norm {:.6e}",
        k,
        len_sq.sqrt()
    );
    from.hit_trust_region_edge = true;
    Ok(Some(ProposedStep {
        step_type: StepType::Interpolated,
        len_sq,
        cauchy_len_sq,
        gauss_newton_len_sq: Some(gauss_newton_len_sq),
        k_cauchy_to_gn: Some(k),
        discriminant_clamped,
    }))
}

/// Decrease of the linear model `‖x + J·step‖²` relative to `‖x‖²`:
/// `−2 (Jᵀx)·step − ‖J·step‖²`.
pub fn expected_improvement<S: LinearSystem>(point: &OperatingPoint<S>, step: &DVector<f64>) -> f64 {
    -2.0 * point.jt_x.dot(step) - point.system.norm2_j_mul(step)
}

fn ensure_cauchy<S: LinearSystem>(
    point: &mut OperatingPoint<S>,
    verbosity: Verbosity,
) -> DoglegResult<bool> {
    if point.cauchy.valid {
        return Ok(true);
    }

    let norm2_jt_x = linalg::norm2(&point.jt_x);
    let norm2_j_jt_x = point.system.norm2_j_mul(&point.jt_x);
    if !(norm2_jt_x.is_finite() && norm2_j_jt_x.is_finite()) {
        return Err(CoreError::InvalidInput(format!(
            "non-finite residual or Jacobian: |Jt x|^2 = {norm2_jt_x:.6e}, |J Jt x|^2 = {norm2_j_jt_x:.6e}"
        ))
        .log()
        .into());
    }
    if norm2_j_jt_x <= 0.0 {
        warn!(
            "|J Jt x|^2 = {:.6e}: steepest-descent curvature vanishes, no step possible",
            norm2_j_jt_x
        );
        return Ok(false);
    }

    let k = -norm2_jt_x / norm2_j_jt_x;
    point.cauchy.step.copy_from(&point.jt_x);
    point.cauchy.step *= k;
    point.cauchy.len_sq = k * k * norm2_jt_x;
    point.cauchy.valid = true;
    verbose!(verbosity, "cauchy step size {:.6e}", point.cauchy.len_sq.sqrt());
    Ok(true)
}

fn ensure_gauss_newton<S: LinearSystem>(
    point: &mut OperatingPoint<S>,
    jtj: &mut JtJFactorization<S>,
    verbosity: Verbosity,
) -> DoglegResult<()> {
    if point.gauss_newton.valid {
        return Ok(());
    }

    jtj.ensure(&point.system, point.generation)?;
    let solution = jtj.solve(&linalg::to_column(&point.jt_x))?;
    for i in 0..point.gauss_newton.step.len() {
        point.gauss_newton.step[i] = -solution[(i, 0)];
    }
    point.gauss_newton.set_from_step();
    verbose!(verbosity, "gn step size {:.6e}", point.gauss_newton.len_sq.sqrt());
    Ok(())
}

/// Point on `a + k(b − a)` at squared distance `trust_region_sq` from the origin.
/// Returns `k` and whether the discriminant had to be clamped.
fn interpolate(
    a: &DVector<f64>,
    norm2_a: f64,
    b: &DVector<f64>,
    trust_region_sq: f64,
    step: &mut DVector<f64>,
) -> (f64, bool) {
    let mut l2 = 0.0;
    let mut neg_c = 0.0;
    for (ai, bi) in a.iter().zip(b.iter()) {
        let d = ai - bi;
        l2 += d * d;
        neg_c += d * ai;
    }

    let mut discriminant = neg_c * neg_c - l2 * (norm2_a - trust_region_sq);
    let clamped = discriminant < 0.0;
    if clamped {
        warn!("negative discriminant: {:.6e}, clamping to 0", discriminant);
        discriminant = 0.0;
    }
    let k = (neg_c + discriminant.sqrt()) / l2;

    for i in 0..step.len() {
        step[i] = a[i] + k * (b[i] - a[i]);
    }
    (k, clamped)
}
