//! Outlier and confidence analysis at a solved operating point.
//!
//! Measurements are grouped into *features* of `feature_size` consecutive residuals
//! (1 or 2). For a feature with residuals `x*` and Jacobian rows `J*`:
//!
//! ```text
//! A = J* (JᵀJ)⁻¹ J*ᵀ          leverage of the feature
//! B = (A − I)⁻¹
//! ```
//!
//! The outlierness factor estimates how much the fit would change without the
//! feature. For size 2 it is Cook's self+others statistic `x*ᵀ(B + BB)x*`; for size 1
//! it reduces to `x*² / (1 − A)`. Factors are normalized by
//!
//! ```text
//! scale = N / (4 (Nstate + 1) ‖x‖² / (N − Nstate − 1)) / 8
//! ```
//!
//! with `N` the number of non-outlier measurements, so that 1 is the outlier threshold.
//! A feature whose leverage makes `1 − A` (or `det(I − A)`) vanish is reported as a
//! certain outlier with factor `f64::MAX`.
//!
//! (JᵀJ)⁻¹J*ᵀ is computed by multi-column solves against the factorization kept in
//! the [`SolverContext`], four measurements at a time.

use faer::Mat;
use thiserror::Error;
use tracing::{error, info};

use crate::{
    error::DoglegResult, linalg::LinearSystem, observers::vnlog::format_g,
    optimizer::SolverContext,
};

/// Measurements per multi-column solve.
const CHUNK_SIZE: usize = 4;

/// `|1 − A|` or `|det(I − A)|` below this marks a certain outlier.
const LEVERAGE_EPSILON: f64 = 1e-8;

/// A candidate is only marked if dropping it loses less than this fraction of the
/// confidence.
pub const OUTLIER_CONFIDENCE_DROP_THRESHOLD: f64 = 0.05;

/// Outlier-analysis specific error types
#[derive(Debug, Clone, Error)]
pub enum OutlierError {
    /// Only features of one or two measurements are supported
    #[error("Unsupported feature size {0}")]
    UnsupportedFeatureSize(usize),

    /// Too few non-outlier measurements to normalize the statistics
    #[error(
        "Insufficient measurements: {non_outliers} non-outlier measurements for {nstate} states"
    )]
    InsufficientMeasurements { non_outliers: usize, nstate: usize },

    /// Feature indices or query Jacobian do not fit the problem
    #[error("Invalid feature range: {0}")]
    InvalidFeatureRange(String),

    /// The confidence callback failed for a candidate feature
    #[error("Confidence unavailable for feature {0}")]
    ConfidenceUnavailable(usize),
}

impl OutlierError {
    /// Log the error with tracing::error and return self for chaining
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

/// Result type for outlier operations
pub type OutlierResult<T> = Result<T, OutlierError>;

/// Outcome of [`SolverContext::mark_outliers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlierMarking {
    /// At least one feature was newly marked
    pub marked_any: bool,
    /// Features marked after this pass, old and new
    pub outlier_count: usize,
}

/// One line of [`SolverContext::report_outliers`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierReportRow {
    pub feature: usize,
    pub factor: f64,
    /// `1 − confidence_without_feature / confidence`
    pub confidence_drop_relative: f64,
}

fn normalized_feature_size(feature_size: usize) -> OutlierResult<usize> {
    match feature_size {
        0 | 1 => Ok(1),
        2 => Ok(2),
        n => Err(OutlierError::UnsupportedFeatureSize(n).log()),
    }
}

/// Unscaled outlierness of one feature from its residuals and the upper triangle
/// `[a00, a01, a11]` of its leverage matrix. `None` for a certain outlier.
fn raw_outlierness(x: &[f64], a: [f64; 3], feature_size: usize) -> Option<f64> {
    if feature_size == 1 {
        let denom = 1.0 - a[0];
        if denom.abs() < LEVERAGE_EPSILON {
            return None;
        }
        return Some(x[0] * x[0] / denom);
    }

    let [a00, a01, a11] = a;
    let det = (1.0 - a00) * (1.0 - a11) - a01 * a01;
    if det.abs() < LEVERAGE_EPSILON {
        return None;
    }
    // det·B, B = (A − I)⁻¹
    let b00 = a11 - 1.0;
    let b11 = a00 - 1.0;
    let b01 = -a01;

    let x_b_x = (x[0] * x[0] * b00 + 2.0 * x[0] * x[1] * b01 + x[1] * x[1] * b11) / det;
    let v1 = x[0] * b00 + x[1] * b01;
    let v2 = x[0] * b01 + x[1] * b11;
    let x_bb_x = (v1 * v1 + v2 * v2) / (det * det);
    Some(x_b_x + x_bb_x)
}

impl<S: LinearSystem> SolverContext<S> {
    /// Normalization of the outlierness statistics. A cached `Some` is kept as is.
    fn outlierness_scale(
        &self,
        scale: &mut Option<f64>,
        feature_size: usize,
        n_outlier_features: usize,
    ) -> OutlierResult<f64> {
        if let Some(s) = *scale {
            return Ok(s);
        }

        let nstate = self.nstate();
        let outliers = n_outlier_features * feature_size;
        let non_outliers = self.nmeasurements().saturating_sub(outliers);
        if non_outliers <= nstate + 1 {
            return Err(OutlierError::InsufficientMeasurements {
                non_outliers,
                nstate,
            }
            .log());
        }

        let n = non_outliers as f64;
        let s = n
            / (4.0 * ((nstate + 1) as f64 * self.point.norm2_x
                / (non_outliers - nstate - 1) as f64));
        *scale = Some(s);
        Ok(s)
    }

    /// Outlierness factor of each of the first `n_features` features.
    ///
    /// `scale` is computed on first use and cached in place; pass `None` to recompute.
    /// `n_outlier_features` features are already known outliers and do not count
    /// towards the normalization.
    pub fn outlierness_factors(
        &mut self,
        scale: &mut Option<f64>,
        feature_size: usize,
        n_features: usize,
        n_outlier_features: usize,
    ) -> DoglegResult<Vec<f64>> {
        let feature_size = normalized_feature_size(feature_size)?;
        let nmeasurements = self.nmeasurements();
        if n_features * feature_size > nmeasurements {
            return Err(OutlierError::InvalidFeatureRange(format!(
                "{n_features} features of size {feature_size} exceed {nmeasurements} measurements"
            ))
            .log()
            .into());
        }
        let k = self.outlierness_scale(scale, feature_size, n_outlier_features)? / 8.0;

        let mut factors = Vec::with_capacity(n_features);
        let mut inv_jtj_jt = Mat::<f64>::zeros(0, 0);
        let mut chunk_start = 0;
        let mut chunk_end = 0;

        for feature in 0..n_features {
            let m = feature * feature_size;
            if m >= chunk_end {
                let jt = self.point.system.jt_block(m, CHUNK_SIZE);
                inv_jtj_jt = self.solve_jtj(&jt)?;
                chunk_start = m;
                chunk_end = m + CHUNK_SIZE;
            }

            let system = &self.point.system;
            let a = |i: usize, j: usize| system.row_dot(m + j, &inv_jtj_jt, m + i - chunk_start);
            let leverage = if feature_size == 1 {
                [a(0, 0), 0.0, 0.0]
            } else {
                [a(0, 0), a(0, 1), a(1, 1)]
            };

            let x = &self.point.x.as_slice()[m..m + feature_size];
            let factor = match raw_outlierness(x, leverage, feature_size) {
                None => f64::MAX,
                Some(raw) if raw == 0.0 => 0.0,
                Some(raw) => raw * k,
            };
            factors.push(factor);
        }
        Ok(factors)
    }

    /// Mark outliers among `marked.len()` features.
    ///
    /// Features already marked are counted and left alone. Every other feature with an
    /// outlierness factor of at least 1 is marked if excluding it costs less than 5%
    /// of the confidence. `get_confidence(None)` is the confidence with every feature,
    /// `get_confidence(Some(i))` the confidence without feature `i`; negative values
    /// mean the confidence could not be computed.
    pub fn mark_outliers<C>(
        &mut self,
        marked: &mut [bool],
        scale: &mut Option<f64>,
        feature_size: usize,
        mut get_confidence: C,
    ) -> DoglegResult<OutlierMarking>
    where
        C: FnMut(Option<usize>) -> f64,
    {
        let already_marked = marked.iter().filter(|&&m| m).count();
        let factors =
            self.outlierness_factors(scale, feature_size, marked.len(), already_marked)?;

        let confidence0 = get_confidence(None);
        if confidence0 < 0.0 {
            verbose!(
                self.config.verbosity,
                "confidence unavailable; not marking any outliers"
            );
            return Ok(OutlierMarking {
                marked_any: false,
                outlier_count: already_marked,
            });
        }
        verbose!(self.config.verbosity, "Initial confidence: {}", format_g(confidence0));

        let mut marking = OutlierMarking {
            marked_any: false,
            outlier_count: 0,
        };
        for (i, (is_marked, &factor)) in marked.iter_mut().zip(&factors).enumerate() {
            if *is_marked {
                marking.outlier_count += 1;
                continue;
            }
            if factor < 1.0 {
                continue;
            }

            let confidence_excluded = get_confidence(Some(i));
            if confidence_excluded < 0.0 {
                return Err(OutlierError::ConfidenceUnavailable(i).log().into());
            }
            let drop_relative = 1.0 - confidence_excluded / confidence0;
            if drop_relative < OUTLIER_CONFIDENCE_DROP_THRESHOLD {
                *is_marked = true;
                marking.marked_any = true;
                marking.outlier_count += 1;
                verbose!(
                    self.config.verbosity,
                    "Feature {} has outlierness factor {:.6}. Culling produces a confidence: {}. relative loss: {}... YES an outlier; confidence drops little",
                    i,
                    factor,
                    format_g(confidence_excluded),
                    format_g(drop_relative)
                );
            } else {
                verbose!(
                    self.config.verbosity,
                    "Feature {} has outlierness factor {:.6}. Culling produces a confidence: {}. relative loss: {}... NOT an outlier: confidence drops too much",
                    i,
                    factor,
                    format_g(confidence_excluded),
                    format_g(drop_relative)
                );
            }
        }
        Ok(marking)
    }

    /// Outlierness factor and relative confidence drop of every feature, logged as a
    /// table at `info` level.
    ///
    /// Calls `get_confidence` once per feature, so this is meant for diagnostics
    /// rather than for routine use.
    pub fn report_outliers<C>(
        &mut self,
        scale: &mut Option<f64>,
        feature_size: usize,
        n_features: usize,
        n_outlier_features: usize,
        mut get_confidence: C,
    ) -> DoglegResult<Vec<OutlierReportRow>>
    where
        C: FnMut(Option<usize>) -> f64,
    {
        let factors =
            self.outlierness_factors(scale, feature_size, n_features, n_outlier_features)?;

        info!("## Outlier statistics");
        info!("# i_feature outlier_factor confidence_drop_relative_if_removed");

        let confidence_full = get_confidence(None);
        let rows = factors
            .into_iter()
            .enumerate()
            .map(|(feature, factor)| {
                let confidence_drop_relative = 1.0 - get_confidence(Some(feature)) / confidence_full;
                info!(
                    "{:5} {:>9} {:>9}",
                    feature,
                    format_g(factor),
                    format_g(confidence_drop_relative)
                );
                OutlierReportRow {
                    feature,
                    factor,
                    confidence_drop_relative,
                }
            })
            .collect();
        Ok(rows)
    }

    /// Expected outlierness of a feature that has not been measured yet.
    ///
    /// `jq` holds the query feature's Jacobian over the active states
    /// `istate_active..istate_active + nstate_active`, one measurement after the other:
    /// `jq[k * nstate_active + j]` is `∂x_k/∂p_{istate_active + j}`. Only features of
    /// size 2 are supported.
    ///
    /// Returns `scale · (2 − trace(B))`, `B = (I + Jq (JᵀJ)⁻¹ Jqᵀ)⁻¹`. The scale is
    /// always recomputed.
    pub fn outlierness_trace_new_feature(
        &mut self,
        jq: &[f64],
        istate_active: usize,
        nstate_active: usize,
        feature_size: usize,
        n_outlier_features: usize,
    ) -> DoglegResult<f64> {
        if feature_size != 2 {
            return Err(OutlierError::UnsupportedFeatureSize(feature_size).log().into());
        }
        let nstate = self.nstate();
        if istate_active + nstate_active > nstate {
            return Err(OutlierError::InvalidFeatureRange(format!(
                "active states {istate_active}..{} exceed {nstate} states",
                istate_active + nstate_active
            ))
            .log()
            .into());
        }
        if jq.len() != nstate_active * feature_size {
            return Err(OutlierError::InvalidFeatureRange(format!(
                "query Jacobian has {} entries, expected {}",
                jq.len(),
                nstate_active * feature_size
            ))
            .log()
            .into());
        }

        let active = istate_active..istate_active + nstate_active;
        let jq_t = Mat::from_fn(nstate, feature_size, |row, k| {
            if active.contains(&row) {
                jq[k * nstate_active + row - istate_active]
            } else {
                0.0
            }
        });
        let inv_jtj_jq_t = self.solve_jtj(&jq_t)?;

        let a = |i: usize, k: usize| -> f64 {
            active
                .clone()
                .map(|row| inv_jtj_jq_t[(row, i)] * jq[row - istate_active + k * nstate_active])
                .sum()
        };
        let inv_b00 = a(0, 0) + 1.0;
        let inv_b01 = a(0, 1);
        let inv_b11 = a(1, 1) + 1.0;
        let det = inv_b00 * inv_b11 - inv_b01 * inv_b01;
        let trace_b = (inv_b11 + inv_b00) / det;

        let scale = self.outlierness_scale(&mut None, feature_size, n_outlier_features)?;
        Ok(scale * (2.0 - trace_b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        linalg::{DenseSystem, SparseJacobian, SparseSystem},
        optimizer::{DogLeg, SolverResult},
    };
    use nalgebra::{DMatrix, DVector, dvector};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    const TOLERANCE: f64 = 1e-9;
    const N: usize = 40;
    const OUTLIER: usize = 13;

    fn sample_t(i: usize) -> f64 {
        0.25 * i as f64
    }

    fn sample_y(i: usize) -> f64 {
        let noise = (((i * 7) % 5) as f64 - 2.0) * 0.01;
        let y = 1.0 + 0.5 * sample_t(i) + noise;
        if i == OUTLIER { y + 3.0 } else { y }
    }

    /// Straight line a + b t through N samples, one of them off by 3.
    fn line_dense(p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>) {
        for i in 0..N {
            x[i] = p[0] + p[1] * sample_t(i) - sample_y(i);
            j[(i, 0)] = 1.0;
            j[(i, 1)] = sample_t(i);
        }
    }

    fn line_sparse(p: &DVector<f64>, x: &mut DVector<f64>, j: &mut SparseJacobian) {
        for i in 0..N {
            x[i] = p[0] + p[1] * sample_t(i) - sample_y(i);
            j.push(i, 0, 1.0);
            j.push(i, 1, sample_t(i));
        }
    }

    fn solved_dense() -> DoglegResult<SolverResult<DenseSystem>> {
        DogLeg::new().optimize_dense(&mut line_dense, &dvector![0.0, 0.0], N)
    }

    fn solved_sparse() -> DoglegResult<SolverResult<SparseSystem>> {
        DogLeg::new().optimize_sparse(&mut line_sparse, &dvector![0.0, 0.0], N, 2 * N)
    }

    #[test]
    fn test_gross_error_stands_out() -> TestResult {
        let mut context = solved_dense()?.context;
        let mut scale = None;
        let factors = context.outlierness_factors(&mut scale, 1, N, 0)?;
        assert_eq!(factors.len(), N);
        assert!(scale.is_some());

        assert!(factors[OUTLIER] > 10.0, "factor {}", factors[OUTLIER]);
        for (i, &f) in factors.iter().enumerate().filter(|&(i, _)| i != OUTLIER) {
            assert!(f < 0.1, "feature {i} has factor {f}");
        }
        Ok(())
    }

    #[test]
    fn test_size_one_matches_leverage_formula() -> TestResult {
        let mut context = solved_dense()?.context;
        let factors = context.outlierness_factors(&mut None, 1, N, 0)?;

        let j = DMatrix::from_fn(N, 2, |i, c| if c == 0 { 1.0 } else { sample_t(i) });
        let inv = (j.transpose() * &j).try_inverse().ok_or("singular")?;
        let x = context.point().residuals().clone();
        let norm2_x = x.norm_squared();
        let scale = N as f64 / (4.0 * 3.0 * norm2_x / (N - 3) as f64) / 8.0;
        for i in [0, 5, OUTLIER, N - 1] {
            let row = j.row(i);
            let leverage = (&row * &inv * row.transpose())[(0, 0)];
            let expected = scale * x[i] * x[i] / (1.0 - leverage);
            assert!((factors[i] - expected).abs() < 1e-9 * expected.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn test_size_two_matches_cook_statistic() -> TestResult {
        let mut context = solved_dense()?.context;
        let factors = context.outlierness_factors(&mut None, 2, N / 2, 0)?;
        assert_eq!(factors.len(), N / 2);

        let j = DMatrix::from_fn(N, 2, |i, c| if c == 0 { 1.0 } else { sample_t(i) });
        let inv = (j.transpose() * &j).try_inverse().ok_or("singular")?;
        let x = context.point().residuals().clone();
        let scale = N as f64 / (4.0 * 3.0 * x.norm_squared() / (N - 3) as f64) / 8.0;
        for feature in 0..N / 2 {
            let rows = j.rows(2 * feature, 2);
            let a = &rows * &inv * rows.transpose();
            let b = (a - DMatrix::identity(2, 2)).try_inverse().ok_or("singular")?;
            let xf = x.rows(2 * feature, 2);
            let expected = scale * ((xf.transpose() * (&b + &b * &b)) * xf)[(0, 0)];
            assert!(
                (factors[feature] - expected).abs() < 1e-9 * expected.abs().max(1.0),
                "feature {feature}: {} vs {expected}",
                factors[feature]
            );
        }
        // The pair holding the bad sample scores highest.
        let worst = (0..N / 2)
            .max_by(|&a, &b| factors[a].total_cmp(&factors[b]))
            .ok_or("empty")?;
        assert_eq!(worst, OUTLIER / 2);
        Ok(())
    }

    #[test]
    fn test_dense_and_sparse_agree() -> TestResult {
        let mut dense = solved_dense()?.context;
        let mut sparse = solved_sparse()?.context;
        let fd = dense.outlierness_factors(&mut None, 1, N, 0)?;
        let fs = sparse.outlierness_factors(&mut None, 1, N, 0)?;
        for (a, b) in fd.iter().zip(&fs) {
            assert!((a - b).abs() < 1e-7 * a.abs().max(1.0));
        }
        Ok(())
    }

    #[test]
    fn test_full_leverage_saturates() -> TestResult {
        // p0 is seen by measurement 0 alone, so that measurement has leverage 1.
        let mut f = |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| {
            x[0] = p[0] - 1.0;
            j[(0, 0)] = 1.0;
            for i in 1..6 {
                x[i] = p[1] - i as f64;
                j[(i, 1)] = 1.0;
            }
        };
        let mut context = DogLeg::new()
            .optimize_dense(&mut f, &dvector![0.0, 0.0], 6)?
            .context;
        let factors = context.outlierness_factors(&mut None, 1, 6, 0)?;
        assert_eq!(factors[0], f64::MAX);
        assert!(factors[1..].iter().all(|f| f.is_finite() && *f < f64::MAX));
        Ok(())
    }

    #[test]
    fn test_cached_scale_is_reused() -> TestResult {
        let mut context = solved_dense()?.context;
        let mut scale = Some(8.0);
        let factors = context.outlierness_factors(&mut scale, 1, N, 0)?;
        assert_eq!(scale, Some(8.0));
        let fresh = context.outlierness_factors(&mut None, 1, N, 0)?;
        assert!((factors[0] - fresh[0]).abs() > TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_mark_outliers_respects_confidence_drop() -> TestResult {
        let mut context = solved_dense()?.context;

        // Dropping the outlier costs 1% of the confidence: marked.
        let mut marked = vec![false; N];
        let marking = context.mark_outliers(&mut marked, &mut None, 1, |exclude| {
            if exclude.is_some() { 0.99 } else { 1.0 }
        })?;
        assert!(marking.marked_any);
        assert_eq!(marking.outlier_count, 1);
        assert!(marked[OUTLIER]);
        assert_eq!(marked.iter().filter(|&&m| m).count(), 1);

        // Dropping it costs half the confidence: kept.
        let mut marked = vec![false; N];
        let marking = context.mark_outliers(&mut marked, &mut None, 1, |exclude| {
            if exclude.is_some() { 0.5 } else { 1.0 }
        })?;
        assert!(!marking.marked_any);
        assert_eq!(marking.outlier_count, 0);
        Ok(())
    }

    #[test]
    fn test_mark_outliers_counts_previous_marks() -> TestResult {
        let mut context = solved_dense()?.context;
        let mut marked = vec![false; N];
        marked[0] = true;
        let marking = context.mark_outliers(&mut marked, &mut None, 1, |_| 1.0)?;
        assert_eq!(marking.outlier_count, 2);
        assert!(marked[0] && marked[OUTLIER]);
        Ok(())
    }

    #[test]
    fn test_mark_outliers_confidence_failures() -> TestResult {
        let mut context = solved_dense()?.context;
        let mut marked = vec![false; N];
        let marking = context.mark_outliers(&mut marked, &mut None, 1, |_| -1.0)?;
        assert!(!marking.marked_any);

        let result = context.mark_outliers(&mut marked, &mut None, 1, |exclude| {
            if exclude.is_some() { -1.0 } else { 1.0 }
        });
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_report_outliers_rows() -> TestResult {
        let mut context = solved_dense()?.context;
        let rows = context.report_outliers(&mut None, 1, N, 0, |exclude| match exclude {
            Some(i) if i == OUTLIER => 0.98,
            Some(_) => 0.9,
            None => 1.0,
        })?;
        assert_eq!(rows.len(), N);
        assert!((rows[OUTLIER].confidence_drop_relative - 0.02).abs() < TOLERANCE);
        assert!((rows[0].confidence_drop_relative - 0.1).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_new_feature_trace() -> TestResult {
        let mut context = solved_sparse()?.context;
        // Two new samples at t = 20 and t = 21.
        let jq = [1.0, 20.0, 1.0, 21.0];
        let got = context.outlierness_trace_new_feature(&jq, 0, 2, 2, 0)?;

        let j = DMatrix::from_fn(N, 2, |i, c| if c == 0 { 1.0 } else { sample_t(i) });
        let inv = (j.transpose() * &j).try_inverse().ok_or("singular")?;
        let q = DMatrix::from_row_slice(2, 2, &jq);
        let b = (DMatrix::identity(2, 2) + &q * &inv * q.transpose())
            .try_inverse()
            .ok_or("singular")?;
        let norm2_x = context.point().norm2_x();
        let scale = N as f64 / (4.0 * 3.0 * norm2_x / (N - 3) as f64);
        let expected = scale * (2.0 - b.trace());
        assert!((got - expected).abs() < 1e-9 * expected.abs().max(1.0));
        assert!(got > 0.0);
        Ok(())
    }

    #[test]
    fn test_new_feature_trace_partial_active_range() -> TestResult {
        let mut context = solved_dense()?.context;
        // Query touching only the slope: rows [0, t].
        let got = context.outlierness_trace_new_feature(&[3.0, 4.0], 1, 1, 2, 0)?;

        let j = DMatrix::from_fn(N, 2, |i, c| if c == 0 { 1.0 } else { sample_t(i) });
        let inv = (j.transpose() * &j).try_inverse().ok_or("singular")?;
        let q = DMatrix::from_row_slice(2, 2, &[0.0, 3.0, 0.0, 4.0]);
        let b = (DMatrix::identity(2, 2) + &q * &inv * q.transpose())
            .try_inverse()
            .ok_or("singular")?;
        let scale = N as f64 / (4.0 * 3.0 * context.point().norm2_x() / (N - 3) as f64);
        assert!((got - scale * (2.0 - b.trace())).abs() < 1e-9 * got.abs().max(1.0));
        Ok(())
    }

    #[test]
    fn test_invalid_requests() -> TestResult {
        let mut context = solved_dense()?.context;
        assert!(context.outlierness_factors(&mut None, 3, 4, 0).is_err());
        assert!(context.outlierness_factors(&mut None, 2, N, 0).is_err());
        assert!(context.outlierness_factors(&mut None, 1, N, N - 3).is_err());
        assert!(context
            .outlierness_trace_new_feature(&[1.0, 2.0], 0, 1, 1, 0)
            .is_err());
        assert!(context
            .outlierness_trace_new_feature(&[1.0, 2.0, 3.0, 4.0], 1, 2, 2, 0)
            .is_err());
        assert!(context
            .outlierness_trace_new_feature(&[1.0, 2.0, 3.0], 0, 2, 2, 0)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_raw_outlierness_degenerate_pair() {
        assert_eq!(raw_outlierness(&[1.0, 1.0], [1.0, 0.0, 0.5], 2), None);
        assert_eq!(raw_outlierness(&[2.0], [0.5, 0.0, 0.0], 1), Some(8.0));
    }
}
