use clap::{Parser, ValueEnum};
use dogleg_solver::core::check_gradient_dense;
use dogleg_solver::init_logger;
use dogleg_solver::linalg::SparseJacobian;
use dogleg_solver::optimizer::{DogLeg, DogLegConfig, OptimizationStatus, Verbosity};
use dogleg_solver::{DoglegError, LinearSystem, SolverContext};
use faer::Mat;
use nalgebra::{DMatrix, DVector, dvector};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Dense,
    Sparse,
    Both,
}

#[derive(Parser)]
#[command(name = "fit_curve")]
#[command(about = "Fit y = a exp(-b t) + c to synthetic samples with the dogleg solver")]
struct Args {
    /// Number of samples
    #[arg(short = 'n', long, default_value = "200")]
    samples: usize,

    /// Jacobian representation
    #[arg(short, long, value_enum, default_value = "both")]
    backend: Backend,

    /// Maximum number of accepted steps
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// Initial trust-region radius
    #[arg(long, default_value = "1000")]
    trust_region: f64,

    /// Amplitude of the pseudo-random noise added to each sample
    #[arg(long, default_value = "0.01")]
    noise: f64,

    /// Corrupt every N-th sample by +1 (0 disables)
    #[arg(long, default_value = "0")]
    outlier_every: usize,

    /// Log solver progress
    #[arg(short, long)]
    verbose: bool,

    /// Write one vnlog record per step attempt to stdout
    #[arg(long)]
    vnlog: bool,

    /// Compare the analytic Jacobian against finite differences first
    #[arg(long)]
    check_gradient: bool,

    /// Run outlier detection at the optimum
    #[arg(long)]
    outliers: bool,
}

const TRUTH: [f64; 3] = [2.0, 0.7, 0.5];
const T_SPAN: f64 = 8.0;

struct Samples {
    t: Vec<f64>,
    y: Vec<f64>,
}

impl Samples {
    fn generate(n: usize, noise: f64, outlier_every: usize) -> Self {
        let t: Vec<f64> = (0..n).map(|i| T_SPAN * i as f64 / n as f64).collect();
        let y = t
            .iter()
            .enumerate()
            .map(|(i, &ti)| {
                // Deterministic noise in [-0.5, 0.5)
                let u = ((i as f64 * 12.9898).sin() * 43_758.545_3).fract().abs() - 0.5;
                let clean = TRUTH[0] * (-TRUTH[1] * ti).exp() + TRUTH[2];
                let corrupt = outlier_every > 0 && i % outlier_every == outlier_every - 1;
                clean + noise * u + if corrupt { 1.0 } else { 0.0 }
            })
            .collect();
        Self { t, y }
    }

    fn len(&self) -> usize {
        self.t.len()
    }

    /// Residual and the three partial derivatives of sample `i`.
    fn linearize(&self, p: &DVector<f64>, i: usize) -> (f64, [f64; 3]) {
        let e = (-p[1] * self.t[i]).exp();
        let residual = p[0] * e + p[2] - self.y[i];
        (residual, [e, -p[0] * self.t[i] * e, 1.0])
    }

    fn dense(&self, p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>) {
        for i in 0..self.len() {
            let (r, d) = self.linearize(p, i);
            x[i] = r;
            for (c, value) in d.into_iter().enumerate() {
                j[(i, c)] = value;
            }
        }
    }

    fn sparse(&self, p: &DVector<f64>, x: &mut DVector<f64>, j: &mut SparseJacobian) {
        for i in 0..self.len() {
            let (r, d) = self.linearize(p, i);
            x[i] = r;
            for (c, value) in d.into_iter().enumerate() {
                j.push(i, c, value);
            }
        }
    }

    /// Precision of the fit, `1 / trace((JᵀJ)⁻¹)`, optionally without sample `exclude`.
    fn confidence(&self, p: &DVector<f64>, exclude: Option<usize>) -> f64 {
        let mut jtj = DMatrix::<f64>::zeros(3, 3);
        for i in (0..self.len()).filter(|&i| Some(i) != exclude) {
            let (_, d) = self.linearize(p, i);
            let row = DVector::from_row_slice(&d);
            jtj += &row * row.transpose();
        }
        match jtj.try_inverse() {
            Some(inv) => 1.0 / inv.trace(),
            None => -1.0,
        }
    }
}

struct FitSummary {
    backend: &'static str,
    status: OptimizationStatus,
    parameters: DVector<f64>,
    initial_norm2_x: f64,
    final_norm2_x: f64,
    iterations: usize,
    time_ms: f64,
    outliers: Option<usize>,
}

fn analyze_outliers<S: LinearSystem>(
    context: &mut SolverContext<S>,
    samples: &Samples,
) -> Result<usize, DoglegError> {
    let p = context.point().parameters().clone();
    let mut marked = vec![false; samples.len()];
    let mut scale = None;
    // Marking changes the normalization, so iterate until nothing new is found.
    loop {
        let marking = context.mark_outliers(&mut marked, &mut scale, 1, |exclude| {
            samples.confidence(&p, exclude)
        })?;
        if !marking.marked_any {
            return Ok(marking.outlier_count);
        }
        scale = None;
    }
}

fn run(args: &Args, samples: &Samples, backend: Backend) -> Result<FitSummary, DoglegError> {
    let verbosity = match (args.verbose, args.vnlog) {
        (false, false) => Verbosity::Silent,
        (true, false) => Verbosity::Human,
        (false, true) => Verbosity::Vnlog,
        (true, true) => Verbosity::HumanAndVnlog,
    };
    let config = DogLegConfig::new()
        .with_max_iterations(args.max_iterations)
        .with_initial_trust_region(args.trust_region)
        .with_verbosity(verbosity);
    let mut solver = DogLeg::with_config(config);
    let initial = dvector![1.0, 0.1, 0.0];
    let n = samples.len();

    macro_rules! finish {
        ($result:expr, $name:expr) => {{
            let mut result = $result;
            let outliers = if args.outliers {
                Some(analyze_outliers(&mut result.context, samples)?)
            } else {
                None
            };
            FitSummary {
                backend: $name,
                status: result.status,
                parameters: result.parameters,
                initial_norm2_x: result.initial_norm2_x,
                final_norm2_x: result.final_norm2_x,
                iterations: result.iterations,
                time_ms: result.elapsed_time.as_secs_f64() * 1000.0,
                outliers,
            }
        }};
    }

    Ok(match backend {
        Backend::Sparse => {
            let mut f = |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut SparseJacobian| {
                samples.sparse(p, x, j)
            };
            finish!(solver.optimize_sparse(&mut f, &initial, n, 3 * n)?, "sparse")
        }
        _ => {
            let mut f =
                |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| samples.dense(p, x, j);
            finish!(solver.optimize_dense(&mut f, &initial, n)?, "dense")
        }
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger();

    info!("DOGLEG-SOLVER CURVE FIT: y = a exp(-b t) + c\n");
    if args.samples <= 4 {
        return Err(format!("need more than 4 samples, got {}", args.samples).into());
    }
    let samples = Samples::generate(args.samples, args.noise, args.outlier_every);

    if args.check_gradient {
        let p0 = dvector![1.0, 0.1, 0.0];
        let mut f =
            |p: &DVector<f64>, x: &mut DVector<f64>, j: &mut Mat<f64>| samples.dense(p, x, j);
        for var in 0..3 {
            let report = check_gradient_dense(var, &p0, samples.len(), &mut f)?;
            info!(
                "gradient check var {}: max relative error {:.3e}",
                var,
                report.max_relative_error()
            );
        }
    }

    let backends: &[Backend] = match args.backend {
        Backend::Both => &[Backend::Dense, Backend::Sparse],
        Backend::Dense => &[Backend::Dense],
        Backend::Sparse => &[Backend::Sparse],
    };

    let mut summaries = Vec::new();
    for &backend in backends {
        match run(&args, &samples, backend) {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                warn!("{:?} fit failed", backend);
                warn!("Full error chain:\n{}", e.chain());
            }
        }
    }

    info!(
        "{:<8} | {:<30} | {:<12} | {:<12} | {:<5} | {:<9} | {:<30}",
        "Backend", "Status", "Init |x|^2", "Final |x|^2", "Iters", "Time(ms)", "a, b, c"
    );
    info!("{}", "-".repeat(124));
    for s in &summaries {
        info!(
            "{:<8} | {:<30} | {:<12.6e} | {:<12.6e} | {:<5} | {:<9.3} | {:.6}, {:.6}, {:.6}",
            s.backend,
            s.status.to_string(),
            s.initial_norm2_x,
            s.final_norm2_x,
            s.iterations,
            s.time_ms,
            s.parameters[0],
            s.parameters[1],
            s.parameters[2]
        );
        if let Some(count) = s.outliers {
            info!("{:<8} | {} samples marked as outliers", s.backend, count);
        }
    }
    info!("truth    | {:.6}, {:.6}, {:.6}", TRUTH[0], TRUTH[1], TRUTH[2]);

    let converged = summaries.iter().filter(|s| s.status.is_converged()).count();
    if converged == backends.len() {
        Ok(())
    } else {
        Err(format!("{}/{} fits converged", converged, backends.len()).into())
    }
}
