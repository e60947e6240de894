use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use nalgebra::DVector;
use tracing::debug;

use crate::linalg::{
    Factorization, LinAlgError, LinAlgResult, LinearSystem, for_each_lower_outer_product,
};

/// Sparse Jacobian as written by the residual callback.
///
/// Entries are pushed as `(measurement, state, value)`; repeated coordinates are
/// summed. The number of pushes is capped at the non-zero count the solve was
/// started with. Violations are recorded and reported when the evaluation is
/// committed, so the callback itself stays infallible.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    nstate: usize,
    nmeasurements: usize,
    capacity: usize,
    entries: Vec<(usize, usize, f64)>,
    attempted: usize,
    out_of_bounds: Option<(usize, usize)>,
}

impl SparseJacobian {
    fn new(nstate: usize, nmeasurements: usize, capacity: usize) -> Self {
        Self {
            nstate,
            nmeasurements,
            capacity,
            entries: Vec::with_capacity(capacity),
            attempted: 0,
            out_of_bounds: None,
        }
    }

    /// Record `∂x[measurement] / ∂p[state] = value`.
    pub fn push(&mut self, measurement: usize, state: usize, value: f64) {
        self.attempted += 1;
        if measurement >= self.nmeasurements || state >= self.nstate {
            self.out_of_bounds.get_or_insert((measurement, state));
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push((measurement, state, value));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.attempted = 0;
        self.out_of_bounds = None;
    }
}

/// Sparse Jacobian backend.
///
/// The committed Jacobian is stored per measurement (the compressed columns of Jᵀ):
/// the entries of measurement `m` live in `offsets[m]..offsets[m + 1]`, sorted by state.
#[derive(Debug, Clone)]
pub struct SparseSystem {
    builder: SparseJacobian,
    offsets: Vec<usize>,
    states: Vec<usize>,
    values: Vec<f64>,
}

impl SparseSystem {
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Jᵀ as a faer compressed-column matrix (`Nstate × Nmeasurements`).
    pub fn jt(&self) -> LinAlgResult<SparseColMat<usize, f64>> {
        let nstate = self.builder.nstate;
        let nmeas = self.builder.nmeasurements;
        let mut triplets = Vec::with_capacity(self.values.len());
        for m in 0..nmeas {
            for idx in self.offsets[m]..self.offsets[m + 1] {
                triplets.push(Triplet::new(self.states[idx], m, self.values[idx]));
            }
        }
        SparseColMat::try_new_from_triplets(nstate, nmeas, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to assemble Jt".to_string())
                .log_with_source(e)
        })
    }

    fn row(&self, measurement: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.offsets[measurement]..self.offsets[measurement + 1];
        self.states[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    fn pattern_matches(&self, pattern: &(Vec<usize>, Vec<usize>)) -> bool {
        pattern.0 == self.offsets && pattern.1 == self.states
    }
}

/// Sparse LLᵀ factor of `JᵀJ + λI`, with the symbolic analysis cached for the
/// sparsity pattern it was computed on.
#[derive(Debug, Default)]
pub struct SparseCholesky {
    symbolic: Option<SymbolicLlt<usize>>,
    pattern: Option<(Vec<usize>, Vec<usize>)>,
    numeric: Option<Llt<usize, f64>>,
    analyses: usize,
}

impl SparseCholesky {
    /// How many symbolic analyses were performed. One per solve when the
    /// Jacobian pattern is stable.
    pub fn symbolic_analyses(&self) -> usize {
        self.analyses
    }
}

impl Factorization for SparseCholesky {
    fn is_factored(&self) -> bool {
        self.numeric.is_some()
    }

    fn invalidate(&mut self) {
        self.numeric = None;
    }

    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let factor = self.numeric.as_ref().ok_or_else(|| {
            LinAlgError::FactorizationFailed("no sparse factorization available".to_string())
                .log()
        })?;
        let mut solution = rhs.clone();
        factor.solve_in_place(solution.as_mut());
        Ok(solution)
    }
}

impl LinearSystem for SparseSystem {
    type JacobianBuffer = SparseJacobian;
    type Factorization = SparseCholesky;

    fn allocate(nstate: usize, nmeasurements: usize, nnz: usize) -> LinAlgResult<Self> {
        if nnz == 0 {
            return Err(LinAlgError::SparseMatrixCreation(
                "sparse Jacobian needs a non-zero capacity".to_string(),
            )
            .log());
        }
        Ok(Self {
            builder: SparseJacobian::new(nstate, nmeasurements, nnz),
            offsets: vec![0; nmeasurements + 1],
            states: Vec::with_capacity(nnz),
            values: Vec::with_capacity(nnz),
        })
    }

    fn nstate(&self) -> usize {
        self.builder.nstate
    }

    fn nmeasurements(&self) -> usize {
        self.builder.nmeasurements
    }

    fn prepare(&mut self) {
        self.builder.clear();
    }

    fn buffer_mut(&mut self) -> &mut SparseJacobian {
        &mut self.builder
    }

    fn commit(&mut self) -> LinAlgResult<()> {
        let builder = &mut self.builder;
        if let Some((row, col)) = builder.out_of_bounds {
            return Err(LinAlgError::IndexOutOfBounds {
                row,
                col,
                nrows: builder.nmeasurements,
                ncols: builder.nstate,
            }
            .log());
        }
        if builder.attempted > builder.capacity {
            return Err(LinAlgError::JacobianNnzExceeded {
                capacity: builder.capacity,
                written: builder.attempted,
            }
            .log());
        }

        builder
            .entries
            .sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        self.offsets.iter_mut().for_each(|o| *o = 0);
        self.states.clear();
        self.values.clear();
        let mut last: Option<(usize, usize)> = None;
        for &(m, s, v) in &builder.entries {
            if last == Some((m, s)) {
                if let Some(value) = self.values.last_mut() {
                    *value += v;
                }
                continue;
            }
            last = Some((m, s));
            self.states.push(s);
            self.values.push(v);
            self.offsets[m + 1] += 1;
        }
        for m in 0..builder.nmeasurements {
            self.offsets[m + 1] += self.offsets[m];
        }
        Ok(())
    }

    fn jt_mul(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.builder.nstate);
        for m in 0..self.builder.nmeasurements {
            for (s, value) in self.row(m) {
                out[s] += value * v[m];
            }
        }
        out
    }

    fn norm2_j_mul(&self, v: &DVector<f64>) -> f64 {
        (0..self.builder.nmeasurements)
            .map(|m| {
                let dot: f64 = self.row(m).map(|(s, value)| value * v[s]).sum();
                dot * dot
            })
            .sum()
    }

    fn entry(&self, measurement: usize, state: usize) -> f64 {
        self.row(measurement)
            .find(|&(s, _)| s == state)
            .map_or(0.0, |(_, value)| value)
    }

    fn jt_block(&self, measurement0: usize, count: usize) -> Mat<f64> {
        let mut block = Mat::zeros(self.builder.nstate, count);
        for c in 0..count {
            let m = measurement0 + c;
            if m >= self.builder.nmeasurements {
                break;
            }
            for (s, value) in self.row(m) {
                block[(s, c)] = value;
            }
        }
        block
    }

    fn row_dot(&self, measurement: usize, rhs: &Mat<f64>, col: usize) -> f64 {
        self.row(measurement)
            .map(|(s, value)| value * rhs[(s, col)])
            .sum()
    }

    fn factorize(&self, lambda: f64, factorization: &mut SparseCholesky) -> LinAlgResult<bool> {
        let n = self.builder.nstate;

        // Lower triangle of JtJ plus an explicit diagonal, so the pattern does not
        // depend on whether lambda is zero.
        let mut triplets = Vec::with_capacity(self.values.len() * 2 + n);
        let mut row = Vec::new();
        for m in 0..self.builder.nmeasurements {
            row.clear();
            row.extend(self.row(m));
            for_each_lower_outer_product(&row, |r, c, v| triplets.push(Triplet::new(r, c, v)));
        }
        for i in 0..n {
            triplets.push(Triplet::new(i, i, lambda));
        }
        let jtj = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to assemble JtJ".to_string())
                .log_with_source(e)
        })?;

        let reuse = factorization
            .pattern
            .as_ref()
            .is_some_and(|p| self.pattern_matches(p));
        // SymbolicLlt is reference counted, clone is O(1)
        let cached = if reuse {
            factorization.symbolic.clone()
        } else {
            None
        };
        let symbolic = match cached {
            Some(symbolic) => symbolic,
            None => {
                let fresh = SymbolicLlt::try_new(jtj.symbolic(), Side::Lower).map_err(|e| {
                    LinAlgError::FactorizationFailed(
                        "Symbolic Cholesky decomposition failed".to_string(),
                    )
                    .log_with_source(e)
                })?;
                factorization.symbolic = Some(fresh.clone());
                factorization.pattern = Some((self.offsets.clone(), self.states.clone()));
                factorization.analyses += 1;
                fresh
            }
        };

        match Llt::try_new_with_symbolic(symbolic, jtj.as_ref(), Side::Lower) {
            Ok(factor) => {
                factorization.numeric = Some(factor);
                Ok(true)
            }
            Err(e) => {
                debug!("sparse JtJ is not positive definite: {:?}", e);
                factorization.numeric = None;
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

    fn system_3x2() -> LinAlgResult<SparseSystem> {
        // J = [[1, 2], [0, 1], [3, 0]]
        let mut system = SparseSystem::allocate(2, 3, 4)?;
        system.prepare();
        let j = system.buffer_mut();
        j.push(2, 0, 3.0);
        j.push(0, 1, 2.0);
        j.push(0, 0, 1.0);
        j.push(1, 1, 1.0);
        system.commit()?;
        Ok(system)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(SparseSystem::allocate(2, 3, 0).is_err());
    }

    #[test]
    fn test_products_match_dense_layout() -> TestResult {
        let system = system_3x2()?;
        assert_eq!(system.nnz(), 4);
        assert_eq!(system.entry(0, 1), 2.0);
        assert_eq!(system.entry(1, 0), 0.0);

        let jt_x = system.jt_mul(&dvector![1.0, 1.0, 1.0]);
        assert!((jt_x[0] - 4.0).abs() < TOLERANCE);
        assert!((jt_x[1] - 3.0).abs() < TOLERANCE);

        let n2 = system.norm2_j_mul(&dvector![1.0, 1.0]);
        assert!((n2 - 19.0).abs() < TOLERANCE);

        let jt = system.jt()?;
        assert_eq!((jt.nrows(), jt.ncols()), (2, 3));
        Ok(())
    }

    #[test]
    fn test_duplicate_entries_are_summed() -> TestResult {
        let mut system = SparseSystem::allocate(1, 1, 2)?;
        system.prepare();
        system.buffer_mut().push(0, 0, 1.5);
        system.buffer_mut().push(0, 0, 0.5);
        system.commit()?;
        assert_eq!(system.nnz(), 1);
        assert_eq!(system.entry(0, 0), 2.0);
        Ok(())
    }

    #[test]
    fn test_capacity_and_bounds_violations() -> TestResult {
        let mut system = SparseSystem::allocate(2, 2, 1)?;
        system.prepare();
        system.buffer_mut().push(0, 0, 1.0);
        system.buffer_mut().push(1, 1, 1.0);
        assert!(matches!(
            system.commit(),
            Err(LinAlgError::JacobianNnzExceeded {
                capacity: 1,
                written: 2
            })
        ));

        system.prepare();
        system.buffer_mut().push(5, 0, 1.0);
        assert!(matches!(
            system.commit(),
            Err(LinAlgError::IndexOutOfBounds { row: 5, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_factorize_reuses_symbolic_analysis() -> TestResult {
        let mut system = system_3x2()?;
        let mut chol = SparseCholesky::default();
        assert!(system.factorize(0.0, &mut chol)?);

        let rhs = Mat::from_fn(2, 1, |i, _| if i == 0 { 12.0 } else { 7.0 });
        let sol = chol.solve(&rhs)?;
        assert!((sol[(0, 0)] - 1.0).abs() < 1e-10);
        assert!((sol[(1, 0)] - 1.0).abs() < 1e-10);

        // Same pattern, new values: no second analysis.
        system.prepare();
        let j = system.buffer_mut();
        j.push(0, 0, 2.0);
        j.push(0, 1, 2.0);
        j.push(1, 1, 1.0);
        j.push(2, 0, 3.0);
        system.commit()?;
        assert!(system.factorize(0.0, &mut chol)?);
        assert_eq!(chol.symbolic_analyses(), 1);
        Ok(())
    }

    #[test]
    fn test_pattern_change_reruns_symbolic_analysis() -> TestResult {
        let mut system = system_3x2()?;
        let mut chol = SparseCholesky::default();
        assert!(system.factorize(0.0, &mut chol)?);
        assert_eq!(chol.symbolic_analyses(), 1);

        // (0, 1) drops out: J = [[1, 0], [0, 1], [3, 0]], JtJ = diag(10, 1).
        system.prepare();
        let j = system.buffer_mut();
        j.push(0, 0, 1.0);
        j.push(1, 1, 1.0);
        j.push(2, 0, 3.0);
        system.commit()?;
        assert!(system.factorize(0.0, &mut chol)?);
        assert_eq!(chol.symbolic_analyses(), 2);

        let rhs = Mat::from_fn(2, 1, |i, _| if i == 0 { 10.0 } else { 1.0 });
        let sol = chol.solve(&rhs)?;
        assert!((sol[(0, 0)] - 1.0).abs() < 1e-10);
        assert!((sol[(1, 0)] - 1.0).abs() < 1e-10);

        // Stable again from here on.
        assert!(system.factorize(1e-3, &mut chol)?);
        assert_eq!(chol.symbolic_analyses(), 2);
        Ok(())
    }

    #[test]
    fn test_rank_deficient_reports_singular() -> TestResult {
        let mut system = SparseSystem::allocate(2, 2, 2)?;
        system.prepare();
        system.buffer_mut().push(0, 0, 1.0);
        system.buffer_mut().push(1, 0, 1.0);
        system.commit()?;

        let mut chol = SparseCholesky::default();
        assert!(!system.factorize(0.0, &mut chol)?);
        assert!(system.factorize(1e-6, &mut chol)?);
        Ok(())
    }
}
