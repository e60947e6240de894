//! Dense vs sparse dogleg benchmark
//!
//! Solves the extended Rosenbrock problem at increasing sizes with both Jacobian
//! backends. Each pair of states `(p₂ᵢ, p₂ᵢ₊₁)` contributes two residuals
//!
//! ```text
//! x₂ᵢ   = 10 (p₂ᵢ₊₁ − p₂ᵢ²)
//! x₂ᵢ₊₁ = 1 − p₂ᵢ
//! ```
//!
//! so the Jacobian is block diagonal with 3 non-zeros per pair. The dense backend
//! factors an `n × n` JᵀJ; the sparse one keeps its symbolic analysis across
//! iterations.
//!
//! ### Timing Methodology:
//! - Timing covers the `optimize_*` call only
//! - Each configuration is run 5 times and the wall-clock time is averaged

use std::hint::black_box;
use std::time::Instant;
use tracing::{info, warn};

use dogleg_solver::init_logger;
use dogleg_solver::linalg::SparseJacobian;
use dogleg_solver::optimizer::{DogLeg, DogLegConfig, OptimizationStatus};
use faer::Mat;
use nalgebra::DVector;

const NUM_RUNS: usize = 5;
const SIZES: [usize; 4] = [10, 50, 200, 800];

struct BenchmarkResult {
    backend: &'static str,
    nstate: usize,
    status: Option<OptimizationStatus>,
    iterations: usize,
    final_norm2_x: f64,
    elapsed_ms: f64,
}

fn initial_guess(nstate: usize) -> DVector<f64> {
    DVector::from_fn(nstate, |i, _| if i % 2 == 0 { -1.2 } else { 1.0 })
}

fn rosenbrock_dense(p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>) {
    for i in (0..p.len()).step_by(2) {
        x[i] = 10.0 * (p[i + 1] - p[i] * p[i]);
        x[i + 1] = 1.0 - p[i];
        j[(i, i)] = -20.0 * p[i];
        j[(i, i + 1)] = 10.0;
        j[(i + 1, i)] = -1.0;
    }
}

fn rosenbrock_sparse(p: &DVector<f64>, x: &mut DVector<f64>, j: &mut SparseJacobian) {
    for i in (0..p.len()).step_by(2) {
        x[i] = 10.0 * (p[i + 1] - p[i] * p[i]);
        x[i + 1] = 1.0 - p[i];
        j.push(i, i, -20.0 * p[i]);
        j.push(i, i + 1, 10.0);
        j.push(i + 1, i, -1.0);
    }
}

fn run_single_benchmark(nstate: usize, sparse: bool) -> BenchmarkResult {
    let config = DogLegConfig::new().with_max_iterations(500);
    let mut solver = DogLeg::with_config(config);
    let initial = initial_guess(nstate);

    let start = Instant::now();
    let outcome = if sparse {
        let mut f = rosenbrock_sparse;
        black_box(solver.optimize_sparse(&mut f, &initial, nstate, 3 * nstate / 2))
            .map(|r| (r.status, r.iterations, r.final_norm2_x))
    } else {
        let mut f = rosenbrock_dense;
        black_box(solver.optimize_dense(&mut f, &initial, nstate))
            .map(|r| (r.status, r.iterations, r.final_norm2_x))
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let backend = if sparse { "sparse" } else { "dense" };

    match outcome {
        Ok((status, iterations, final_norm2_x)) => BenchmarkResult {
            backend,
            nstate,
            status: Some(status),
            iterations,
            final_norm2_x,
            elapsed_ms,
        },
        Err(e) => {
            warn!("{} solve with {} states failed: {}", backend, nstate, e.chain_compact());
            BenchmarkResult {
                backend,
                nstate,
                status: None,
                iterations: 0,
                final_norm2_x: f64::NAN,
                elapsed_ms,
            }
        }
    }
}

fn main() {
    init_logger();

    info!("Starting dogleg benchmark...");
    info!("Running each configuration {} times and averaging results...", NUM_RUNS);

    let mut all_results = Vec::new();
    for nstate in SIZES {
        for sparse in [false, true] {
            let runs: Vec<BenchmarkResult> = (0..NUM_RUNS)
                .map(|_| run_single_benchmark(nstate, sparse))
                .collect();
            let avg_ms = runs.iter().map(|r| r.elapsed_ms).sum::<f64>() / NUM_RUNS as f64;
            if let Some(mut result) = runs.into_iter().last() {
                result.elapsed_ms = avg_ms;
                all_results.push(result);
            }
        }
    }

    info!(
        "{:<8} | {:<7} | {:<30} | {:<6} | {:<12} | {:<10}",
        "Backend", "States", "Status", "Iters", "Final |x|^2", "Time (ms)"
    );
    info!("{}", "-".repeat(88));
    for r in &all_results {
        let status = r
            .status
            .map_or_else(|| "FAILED".to_string(), |s| s.to_string());
        info!(
            "{:<8} | {:<7} | {:<30} | {:<6} | {:<12.4e} | {:<10.3}",
            r.backend, r.nstate, status, r.iterations, r.final_norm2_x, r.elapsed_ms
        );
    }
}
