//! Finite-difference check of a residual callback's Jacobian.
//!
//! The callback is evaluated at `p[var] ∓ δ/2`. For every measurement the observed
//! derivative `(x₊ − x₋) / δ` is compared with the mean of the two reported Jacobian
//! entries, which estimates the derivative at the same midpoint.

use faer::Mat;
use nalgebra::DVector;
use std::fmt;

use crate::{
    core::{CoreError, ResidualFunction},
    error::DoglegResult,
    linalg::{DenseSystem, LinearSystem, SparseJacobian, SparseSystem},
    observers::vnlog::format_g,
    optimizer::OptimizerError,
};

/// Finite-difference step on the perturbed variable.
pub const GRADIENT_CHECK_DELTA: f64 = 1e-6;

/// Comparison of one Jacobian entry against its finite-difference estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientCheckRecord {
    pub var: usize,
    pub measurement: usize,
    pub reported: f64,
    pub observed: f64,
    pub error: f64,
    /// `error` divided by the mean magnitude of the two estimates, 0 when both are 0.
    pub relative_error: f64,
}

impl GradientCheckRecord {
    fn new(var: usize, measurement: usize, reported: f64, observed: f64) -> Self {
        let sum_abs = reported.abs() + observed.abs();
        let error = (reported - observed).abs();
        let relative_error = if sum_abs == 0.0 {
            0.0
        } else {
            error / (sum_abs / 2.0)
        };
        Self {
            var,
            measurement,
            reported,
            observed,
            error,
            relative_error,
        }
    }
}

/// All records of one gradient check. `Display` renders a vnlog table.
#[derive(Debug, Clone, Default)]
pub struct GradientCheckReport {
    pub records: Vec<GradientCheckRecord>,
}

impl GradientCheckReport {
    pub const LEGEND: &'static str =
        "# ivar imeasurement gradient_reported gradient_observed error error_relative";

    /// Largest relative error over all measurements.
    pub fn max_relative_error(&self) -> f64 {
        self.records
            .iter()
            .map(|r| r.relative_error)
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for GradientCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", Self::LEGEND)?;
        for r in &self.records {
            writeln!(
                f,
                "{} {} {} {} {} {}",
                r.var,
                r.measurement,
                format_g(r.reported),
                format_g(r.observed),
                format_g(r.error),
                format_g(r.relative_error)
            )?;
        }
        Ok(())
    }
}

/// Check column `var` of a dense-Jacobian callback at `p0`.
pub fn check_gradient_dense<R>(
    var: usize,
    p0: &DVector<f64>,
    nmeasurements: usize,
    f: &mut R,
) -> DoglegResult<GradientCheckReport>
where
    R: ResidualFunction<Mat<f64>> + ?Sized,
{
    check_gradient::<DenseSystem, R>(var, p0, nmeasurements, 0, f)
}

/// Check column `var` of a sparse-Jacobian callback at `p0`.
pub fn check_gradient_sparse<R>(
    var: usize,
    p0: &DVector<f64>,
    nmeasurements: usize,
    nnz: usize,
    f: &mut R,
) -> DoglegResult<GradientCheckReport>
where
    R: ResidualFunction<SparseJacobian> + ?Sized,
{
    if nnz == 0 {
        return Err(OptimizerError::InvalidParameters(
            "the sparse gradient check needs a non-zero Jacobian capacity".to_string(),
        )
        .log()
        .into());
    }
    check_gradient::<SparseSystem, R>(var, p0, nmeasurements, nnz, f)
}

fn check_gradient<S, R>(
    var: usize,
    p0: &DVector<f64>,
    nmeasurements: usize,
    nnz: usize,
    f: &mut R,
) -> DoglegResult<GradientCheckReport>
where
    S: LinearSystem,
    R: ResidualFunction<S::JacobianBuffer> + ?Sized,
{
    let nstate = p0.len();
    if var >= nstate {
        return Err(CoreError::InvalidInput(format!(
            "variable {var} out of range for {nstate} parameters"
        ))
        .log()
        .into());
    }

    let mut evaluate_at = |offset: f64| -> DoglegResult<(DVector<f64>, S)> {
        let mut p = p0.clone();
        p[var] += offset;
        let mut x = DVector::zeros(nmeasurements);
        let mut system = S::allocate(nstate, nmeasurements, nnz)?;
        system.prepare();
        f.evaluate(&p, &mut x, system.buffer_mut());
        if x.len() != nmeasurements {
            return Err(CoreError::DimensionMismatch(format!(
                "residual vector has {} entries, expected {}",
                x.len(),
                nmeasurements
            ))
            .log()
            .into());
        }
        system.commit()?;
        Ok((x, system))
    };

    let (x_minus, j_minus) = evaluate_at(-GRADIENT_CHECK_DELTA / 2.0)?;
    let (x_plus, j_plus) = evaluate_at(GRADIENT_CHECK_DELTA / 2.0)?;

    let records = (0..nmeasurements)
        .map(|i| {
            let observed = (x_plus[i] - x_minus[i]) / GRADIENT_CHECK_DELTA;
            let reported = (j_minus.entry(i, var) + j_plus.entry(i, var)) / 2.0;
            GradientCheckRecord::new(var, i, reported, observed)
        })
        .collect();

    Ok(GradientCheckReport { records })
}
