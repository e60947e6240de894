//! JᵀJ factorization manager.
//!
//! Keeps one Cholesky factorization of `JᵀJ + λI` keyed by the evaluation generation
//! of the operating point it was computed for. Asking again for the same generation is
//! free; a new generation triggers a fresh numeric factorization.
//!
//! When the factorization reports rank deficiency the damping constant λ is raised
//! (`1e-10` the first time, ×10 afterwards) and the factorization retried. λ never
//! decreases within a solve. After `max_escalations` failed raises the manager gives up
//! with [`LinAlgError::PersistentSingularity`].

use faer::Mat;
use tracing::warn;

use crate::linalg::{Factorization, LinAlgError, LinAlgResult, LinearSystem};

/// λ used on the first escalation away from an undamped system.
pub const INITIAL_DAMPING: f64 = 1e-10;

/// Multiplier applied to λ on every further escalation.
pub const DAMPING_GROWTH: f64 = 10.0;

#[derive(Debug)]
pub struct JtJFactorization<S: LinearSystem> {
    factorization: S::Factorization,
    lambda: f64,
    generation: Option<u64>,
    max_escalations: usize,
    factorizations: usize,
}

impl<S: LinearSystem> JtJFactorization<S> {
    pub fn new(max_escalations: usize) -> Self {
        Self {
            factorization: S::Factorization::default(),
            lambda: 0.0,
            generation: None,
            max_escalations,
            factorizations: 0,
        }
    }

    /// Current damping constant.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Number of numeric factorizations attempted, including failed ones.
    pub fn factorizations(&self) -> usize {
        self.factorizations
    }

    pub fn factorization(&self) -> &S::Factorization {
        &self.factorization
    }

    /// Whether the held factorization belongs to evaluation `generation`.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation) && self.factorization.is_factored()
    }

    /// Make sure the held factorization is that of `system` at `generation`.
    pub fn ensure(&mut self, system: &S, generation: u64) -> LinAlgResult<()> {
        if self.is_current(generation) {
            return Ok(());
        }
        self.generation = None;
        self.factorization.invalidate();

        let mut escalations = 0;
        loop {
            self.factorizations += 1;
            if system.factorize(self.lambda, &mut self.factorization)? {
                self.generation = Some(generation);
                return Ok(());
            }

            if escalations >= self.max_escalations {
                return Err(LinAlgError::PersistentSingularity {
                    lambda: self.lambda,
                    escalations,
                }
                .log());
            }
            self.lambda = if self.lambda == 0.0 {
                INITIAL_DAMPING
            } else {
                self.lambda * DAMPING_GROWTH
            };
            escalations += 1;
            warn!(
                "singular JtJ, adding {:.3e} I from now on",
                self.lambda
            );
        }
    }

    /// Solve against the held factorization.
    pub fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        self.factorization.solve(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{DenseSystem, SparseSystem};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn rank_one_dense() -> LinAlgResult<DenseSystem> {
        let mut system = DenseSystem::allocate(2, 2, 0)?;
        system.prepare();
        system.buffer_mut()[(0, 0)] = 1.0;
        system.buffer_mut()[(1, 0)] = 1.0;
        system.commit()?;
        Ok(system)
    }

    #[test]
    fn test_same_generation_is_not_refactored() -> TestResult {
        let mut system = DenseSystem::allocate(1, 1, 0)?;
        system.prepare();
        system.buffer_mut()[(0, 0)] = 2.0;
        system.commit()?;

        let mut jtj = JtJFactorization::<DenseSystem>::new(20);
        jtj.ensure(&system, 1)?;
        jtj.ensure(&system, 1)?;
        assert_eq!(jtj.factorizations(), 1);
        assert!(jtj.is_current(1));

        jtj.ensure(&system, 2)?;
        assert_eq!(jtj.factorizations(), 2);
        assert!(!jtj.is_current(1));
        Ok(())
    }

    #[test]
    fn test_singular_escalates_lambda_once() -> TestResult {
        let system = rank_one_dense()?;
        let mut jtj = JtJFactorization::<DenseSystem>::new(20);
        jtj.ensure(&system, 1)?;
        assert_eq!(jtj.lambda(), INITIAL_DAMPING);

        // Damping persists across generations.
        jtj.ensure(&system, 2)?;
        assert_eq!(jtj.lambda(), INITIAL_DAMPING);
        Ok(())
    }

    #[test]
    fn test_cap_surfaces_persistent_singularity() -> TestResult {
        let mut system = SparseSystem::allocate(2, 1, 1)?;
        system.prepare();
        system.buffer_mut().push(0, 0, 1.0);
        system.commit()?;

        let mut jtj = JtJFactorization::<SparseSystem>::new(0);
        let err = jtj.ensure(&system, 1);
        assert!(matches!(
            err,
            Err(LinAlgError::PersistentSingularity { escalations: 0, .. })
        ));
        Ok(())
    }
}
