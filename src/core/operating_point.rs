//! One evaluated point of the parameter space.
//!
//! A solve keeps two of these alive ("before" and "after" the proposed step) and swaps
//! them when a step is accepted; none of the buffers below are reallocated while
//! iterating.

use nalgebra::DVector;

use crate::{
    core::{CoreError, ResidualFunction},
    error::DoglegResult,
    linalg::{self, LinearSystem},
};

/// A step vector with its squared length, valid only for the evaluation it was
/// derived from.
#[derive(Debug, Clone)]
pub struct CachedStep {
    pub(crate) step: DVector<f64>,
    pub(crate) len_sq: f64,
    pub(crate) valid: bool,
}

impl CachedStep {
    fn zeros(n: usize) -> Self {
        Self {
            step: DVector::zeros(n),
            len_sq: 0.0,
            valid: false,
        }
    }

    pub(crate) fn set_from_step(&mut self) {
        self.len_sq = linalg::norm2(&self.step);
        self.valid = true;
    }

    /// The step, if it is valid for the current evaluation.
    pub fn get(&self) -> Option<&DVector<f64>> {
        self.valid.then_some(&self.step)
    }

    pub fn len_sq(&self) -> Option<f64> {
        self.valid.then_some(self.len_sq)
    }
}

#[derive(Debug)]
pub struct OperatingPoint<S: LinearSystem> {
    pub(crate) p: DVector<f64>,
    pub(crate) x: DVector<f64>,
    pub(crate) norm2_x: f64,
    pub(crate) system: S,
    pub(crate) jt_x: DVector<f64>,
    pub(crate) cauchy: CachedStep,
    pub(crate) gauss_newton: CachedStep,
    pub(crate) step_to_here: CachedStep,
    pub(crate) hit_trust_region_edge: bool,
    pub(crate) generation: u64,
}

impl<S: LinearSystem> OperatingPoint<S> {
    /// Allocate every buffer for a problem of this shape. Nothing is evaluated yet.
    pub fn allocate(p: DVector<f64>, nmeasurements: usize, nnz: usize) -> DoglegResult<Self> {
        let nstate = p.len();
        Ok(Self {
            system: S::allocate(nstate, nmeasurements, nnz)?,
            x: DVector::zeros(nmeasurements),
            norm2_x: f64::INFINITY,
            jt_x: DVector::zeros(nstate),
            cauchy: CachedStep::zeros(nstate),
            gauss_newton: CachedStep::zeros(nstate),
            step_to_here: CachedStep::zeros(nstate),
            hit_trust_region_edge: false,
            generation: 0,
            p,
        })
    }

    /// Evaluate the callback at the current parameters.
    ///
    /// Refreshes `x`, the Jacobian, `Jᵀx` and `‖x‖²`, invalidates the cached steps and
    /// stamps the point with `generation`. Returns `true` iff every component of `Jᵀx`
    /// is within `gradient_threshold`.
    pub fn evaluate<R>(
        &mut self,
        f: &mut R,
        gradient_threshold: f64,
        generation: u64,
    ) -> DoglegResult<bool>
    where
        R: ResidualFunction<S::JacobianBuffer> + ?Sized,
    {
        let nmeasurements = self.system.nmeasurements();
        self.system.prepare();
        f.evaluate(&self.p, &mut self.x, self.system.buffer_mut());
        if self.x.len() != nmeasurements {
            return Err(CoreError::DimensionMismatch(format!(
                "residual vector has {} entries, expected {}",
                self.x.len(),
                nmeasurements
            ))
            .log()
            .into());
        }
        self.system.commit()?;

        self.jt_x = self.system.jt_mul(&self.x);
        self.norm2_x = linalg::norm2(&self.x);
        self.cauchy.valid = false;
        self.gauss_newton.valid = false;
        self.generation = generation;

        Ok(linalg::all_within(&self.jt_x, gradient_threshold))
    }

    pub fn parameters(&self) -> &DVector<f64> {
        &self.p
    }

    pub fn residuals(&self) -> &DVector<f64> {
        &self.x
    }

    /// `‖x‖²`, infinite before the first evaluation.
    pub fn norm2_x(&self) -> f64 {
        self.norm2_x
    }

    /// Gradient direction `Jᵀx` (half the gradient of `‖x‖²`).
    pub fn jt_x(&self) -> &DVector<f64> {
        &self.jt_x
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn nstate(&self) -> usize {
        self.p.len()
    }

    pub fn nmeasurements(&self) -> usize {
        self.x.len()
    }

    /// Step that led to this point, `None` for the initial point.
    pub fn step_to_here(&self) -> Option<&DVector<f64>> {
        self.step_to_here.get()
    }

    pub fn cauchy_step(&self) -> Option<&DVector<f64>> {
        self.cauchy.get()
    }

    pub fn gauss_newton_step(&self) -> Option<&DVector<f64>> {
        self.gauss_newton.get()
    }

    /// Whether the step most recently proposed from this point hit the trust-region
    /// boundary.
    pub fn hit_trust_region_edge(&self) -> bool {
        self.hit_trust_region_edge
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
