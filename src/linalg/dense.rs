use faer::{
    Mat, Side,
    linalg::solvers::{Llt, Solve},
};
use nalgebra::DVector;
use tracing::debug;

use crate::linalg::{
    Factorization, LinAlgError, LinAlgResult, LinearSystem, for_each_lower_outer_product,
};

/// Dense Jacobian: an `Nmeasurements × Nstate` matrix indexed `[(measurement, state)]`.
#[derive(Debug, Clone)]
pub struct DenseSystem {
    jacobian: Mat<f64>,
    nstate: usize,
    nmeasurements: usize,
}

impl DenseSystem {
    pub fn jacobian(&self) -> &Mat<f64> {
        &self.jacobian
    }

    fn row_entries(&self, measurement: usize, scratch: &mut Vec<(usize, f64)>) {
        scratch.clear();
        scratch.extend((0..self.nstate).map(|k| (k, self.jacobian[(measurement, k)])));
    }
}

/// Dense LLᵀ factor of `JᵀJ + λI`.
#[derive(Debug, Default)]
pub struct DenseCholesky {
    factor: Option<Llt<f64>>,
}

impl Factorization for DenseCholesky {
    fn is_factored(&self) -> bool {
        self.factor.is_some()
    }

    fn invalidate(&mut self) {
        self.factor = None;
    }

    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let factor = self.factor.as_ref().ok_or_else(|| {
            LinAlgError::FactorizationFailed("no dense factorization available".to_string())
                .log()
        })?;
        let mut solution = rhs.clone();
        factor.solve_in_place(solution.as_mut());
        Ok(solution)
    }
}

impl LinearSystem for DenseSystem {
    type JacobianBuffer = Mat<f64>;
    type Factorization = DenseCholesky;

    fn allocate(nstate: usize, nmeasurements: usize, _nnz: usize) -> LinAlgResult<Self> {
        Ok(Self {
            jacobian: Mat::zeros(nmeasurements, nstate),
            nstate,
            nmeasurements,
        })
    }

    fn nstate(&self) -> usize {
        self.nstate
    }

    fn nmeasurements(&self) -> usize {
        self.nmeasurements
    }

    fn prepare(&mut self) {
        for j in 0..self.jacobian.ncols() {
            for i in 0..self.jacobian.nrows() {
                self.jacobian[(i, j)] = 0.0;
            }
        }
    }

    fn buffer_mut(&mut self) -> &mut Mat<f64> {
        &mut self.jacobian
    }

    fn commit(&mut self) -> LinAlgResult<()> {
        if self.jacobian.nrows() != self.nmeasurements || self.jacobian.ncols() != self.nstate {
            return Err(LinAlgError::MatrixConversion(format!(
                "dense Jacobian is {}x{}, expected {}x{}",
                self.jacobian.nrows(),
                self.jacobian.ncols(),
                self.nmeasurements,
                self.nstate
            ))
            .log());
        }
        Ok(())
    }

    fn jt_mul(&self, v: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.nstate, |k, _| {
            (0..self.nmeasurements)
                .map(|i| self.jacobian[(i, k)] * v[i])
                .sum()
        })
    }

    fn norm2_j_mul(&self, v: &DVector<f64>) -> f64 {
        (0..self.nmeasurements)
            .map(|i| {
                let row: f64 = (0..self.nstate).map(|k| self.jacobian[(i, k)] * v[k]).sum();
                row * row
            })
            .sum()
    }

    fn entry(&self, measurement: usize, state: usize) -> f64 {
        self.jacobian[(measurement, state)]
    }

    fn jt_block(&self, measurement0: usize, count: usize) -> Mat<f64> {
        Mat::from_fn(self.nstate, count, |k, c| {
            let measurement = measurement0 + c;
            if measurement < self.nmeasurements {
                self.jacobian[(measurement, k)]
            } else {
                0.0
            }
        })
    }

    fn row_dot(&self, measurement: usize, rhs: &Mat<f64>, col: usize) -> f64 {
        (0..self.nstate)
            .map(|k| self.jacobian[(measurement, k)] * rhs[(k, col)])
            .sum()
    }

    fn factorize(&self, lambda: f64, factorization: &mut DenseCholesky) -> LinAlgResult<bool> {
        let n = self.nstate;
        let mut jtj = Mat::<f64>::zeros(n, n);
        let mut row = Vec::with_capacity(n);
        for measurement in 0..self.nmeasurements {
            self.row_entries(measurement, &mut row);
            for_each_lower_outer_product(&row, |r, c, v| jtj[(r, c)] += v);
        }
        if lambda > 0.0 {
            for i in 0..n {
                jtj[(i, i)] += lambda;
            }
        }

        match Llt::new(jtj.as_ref(), Side::Lower) {
            Ok(factor) => {
                factorization.factor = Some(factor);
                Ok(true)
            }
            Err(e) => {
                debug!("dense JtJ is not positive definite: {:?}", e);
                factorization.factor = None;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-12;

    fn system_3x2() -> LinAlgResult<DenseSystem> {
        // J = [[1, 2], [0, 1], [3, 0]]
        let mut system = DenseSystem::allocate(2, 3, 0)?;
        system.prepare();
        let j = system.buffer_mut();
        j[(0, 0)] = 1.0;
        j[(0, 1)] = 2.0;
        j[(1, 1)] = 1.0;
        j[(2, 0)] = 3.0;
        system.commit()?;
        Ok(system)
    }

    #[test]
    fn test_products() -> TestResult {
        let system = system_3x2()?;

        let jt_x = system.jt_mul(&dvector![1.0, 1.0, 1.0]);
        assert!((jt_x[0] - 4.0).abs() < TOLERANCE);
        assert!((jt_x[1] - 3.0).abs() < TOLERANCE);

        // J [1, 1] = [3, 1, 3]
        let n2 = system.norm2_j_mul(&dvector![1.0, 1.0]);
        assert!((n2 - 19.0).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_jt_block_pads_past_end() -> TestResult {
        let system = system_3x2()?;
        let block = system.jt_block(2, 4);
        assert_eq!((block.nrows(), block.ncols()), (2, 4));
        assert_eq!(block[(0, 0)], 3.0);
        assert_eq!(block[(1, 0)], 0.0);
        assert_eq!(block[(0, 3)], 0.0);
        Ok(())
    }

    #[test]
    fn test_factorize_and_solve() -> TestResult {
        let system = system_3x2()?;
        let mut chol = DenseCholesky::default();
        assert!(system.factorize(0.0, &mut chol)?);

        // JtJ = [[10, 2], [2, 5]]
        let rhs = Mat::from_fn(2, 1, |i, _| if i == 0 { 12.0 } else { 7.0 });
        let sol = chol.solve(&rhs)?;
        assert!((sol[(0, 0)] - 1.0).abs() < 1e-10);
        assert!((sol[(1, 0)] - 1.0).abs() < 1e-10);
        Ok(())
    }

    #[test]
    fn test_rank_deficient_reports_singular() -> TestResult {
        let mut system = DenseSystem::allocate(2, 2, 0)?;
        system.prepare();
        system.buffer_mut()[(0, 0)] = 1.0;
        system.buffer_mut()[(1, 0)] = 1.0;
        system.commit()?;

        let mut chol = DenseCholesky::default();
        assert!(!system.factorize(0.0, &mut chol)?);
        assert!(!chol.is_factored());
        assert!(chol.solve(&Mat::zeros(2, 1)).is_err());

        assert!(system.factorize(1e-6, &mut chol)?);
        assert!(chol.is_factored());
        Ok(())
    }

    #[test]
    fn test_commit_rejects_resized_buffer() -> TestResult {
        let mut system = DenseSystem::allocate(2, 3, 0)?;
        *system.buffer_mut() = Mat::zeros(2, 2);
        assert!(system.commit().is_err());
        Ok(())
    }
}
