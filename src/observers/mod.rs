//! Observer pattern for optimization monitoring.
//!
//! Every step attempt of a dogleg solve (accepted or rejected) produces one
//! [`AttemptRecord`]. Observers registered with the solver receive these records,
//! which keeps diagnostics output separate from the iteration itself.
//!
//! ```text
//! ┌─────────────────┐
//! │     DogLeg      │
//! └────────┬────────┘
//!          │ observers.notify(&record)
//!          ├──────────────┬──────────────┐
//!          ▼              ▼              ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │  Vnlog   │  │ Metrics  │  │  Custom  │
//!    │  Writer  │  │ Observer │  │ Observer │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Custom Observer
//!
//! ```no_run
//! use dogleg_solver::observers::{AttemptRecord, OptObserver};
//! use std::sync::Mutex;
//!
//! struct RejectionCounter {
//!     rejected: Mutex<usize>,
//! }
//!
//! impl OptObserver for RejectionCounter {
//!     fn on_attempt(&self, record: &AttemptRecord) {
//!         if !record.accepted {
//!             if let Ok(mut n) = self.rejected.lock() {
//!                 *n += 1;
//!             }
//!         }
//!     }
//! }
//! ```

pub mod vnlog;

use std::fmt;
use thiserror::Error;
use tracing::error;

use crate::optimizer::StepType;

pub use vnlog::VnlogWriter;

/// Observer-specific error types for dogleg-solver
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Failed to write a diagnostics record
    #[error("Failed to write diagnostics record: {0}")]
    WriteFailed(String),

    /// Mutex was poisoned (thread panicked while holding lock)
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// writeln!(out, "{}", record)
    ///     .map_err(|e| ObserverError::WriteFailed(e.to_string()).log_with_source(e))?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for observer operations
pub type ObserverResult<T> = Result<T, ObserverError>;

/// Everything known about one step attempt.
///
/// Fields that were not computed during the attempt are `None`. The step lengths by
/// category are those computed while proposing the step: a Cauchy-only step leaves
/// the Gauss-Newton and interpolated lengths empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptRecord {
    /// Number of steps accepted before this attempt.
    pub iteration: usize,
    pub accepted: bool,
    pub norm2x_before: Option<f64>,
    pub norm2x_after: Option<f64>,
    pub step_len_cauchy: Option<f64>,
    pub step_len_gauss_newton: Option<f64>,
    pub step_len_interpolated: Option<f64>,
    /// Interpolation parameter along the Cauchy → Gauss-Newton leg.
    pub k_cauchy_to_gn: Option<f64>,
    pub step_len: Option<f64>,
    pub step_type: Option<StepType>,
    /// Angle between this step and the step that reached the current point.
    pub step_direction_change_deg: Option<f64>,
    pub expected_improvement: Option<f64>,
    pub observed_improvement: Option<f64>,
    pub rho: Option<f64>,
    pub trustregion_before: Option<f64>,
    pub trustregion_after: Option<f64>,
}

impl AttemptRecord {
    /// Field names in output order.
    pub const FIELDS: [&'static str; 16] = [
        "iteration",
        "step_accepted",
        "norm2x_before",
        "norm2x_after",
        "step_len_cauchy",
        "step_len_gauss_newton",
        "step_len_interpolated",
        "k_cauchy_to_gn",
        "step_len",
        "step_type",
        "step_direction_change_deg",
        "expected_improvement",
        "observed_improvement",
        "rho",
        "trustregion_before",
        "trustregion_after",
    ];

    /// The `# `-prefixed vnlog legend line.
    pub fn legend() -> String {
        format!("# {}", Self::FIELDS.join(" "))
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = |v: Option<f64>| match v {
            Some(v) if v.is_finite() => vnlog::format_g(v),
            _ => "-".to_string(),
        };
        let step_type = self
            .step_type
            .map_or_else(|| "-".to_string(), |t| t.vnlog_name().to_string());

        write!(
            f,
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.iteration,
            u8::from(self.accepted),
            value(self.norm2x_before),
            value(self.norm2x_after),
            value(self.step_len_cauchy),
            value(self.step_len_gauss_newton),
            value(self.step_len_interpolated),
            value(self.k_cauchy_to_gn),
            value(self.step_len),
            step_type,
            value(self.step_direction_change_deg),
            value(self.expected_improvement),
            value(self.observed_improvement),
            value(self.rho),
            value(self.trustregion_before),
            value(self.trustregion_after)
        )
    }
}

/// Observer trait for monitoring step attempts.
///
/// Observers must be `Send`. Use interior mutability (`Mutex`) to keep state, and
/// handle errors internally: an observer must never abort the solve.
pub trait OptObserver: Send {
    /// Called once before the first attempt of a solve.
    fn on_start(&self) {}

    /// Called after every step attempt, accepted or not.
    fn on_attempt(&self, record: &AttemptRecord);
}

/// Collection of observers for optimization monitoring.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    /// Create a new empty observer collection.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Add an observer. Observers are called in the order they were added.
    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Signal the start of a solve to all observers.
    #[inline]
    pub fn start(&self) {
        for observer in &self.observers {
            observer.on_start();
        }
    }

    /// Deliver one attempt record to all observers.
    #[inline]
    pub fn notify(&self, record: &AttemptRecord) {
        for observer in &self.observers {
            observer.on_attempt(record);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<AttemptRecord>>>);

    impl OptObserver for Collect {
        fn on_attempt(&self, record: &AttemptRecord) {
            if let Ok(mut records) = self.0.lock() {
                records.push(record.clone());
            }
        }
    }

    #[test]
    fn test_observer_vec_notifies_in_order() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let mut observers = OptObserverVec::new();
        assert!(observers.is_empty());
        observers.add(Collect(first.clone()));
        observers.add(Collect(second.clone()));
        assert_eq!(observers.len(), 2);

        let record = AttemptRecord {
            iteration: 3,
            ..Default::default()
        };
        observers.notify(&record);

        assert_eq!(first.lock().map(|r| r.len()).unwrap_or(0), 1);
        assert_eq!(second.lock().map(|r| r[0].iteration).unwrap_or(0), 3);
    }

    #[test]
    fn test_legend_lists_every_field() {
        let legend = AttemptRecord::legend();
        assert!(legend.starts_with("# iteration step_accepted "));
        assert!(legend.ends_with("trustregion_after"));
        assert_eq!(legend.split(' ').count(), 17);
    }

    #[test]
    fn test_record_line_marks_absent_values() {
        let record = AttemptRecord {
            iteration: 2,
            accepted: true,
            norm2x_before: Some(25.0),
            norm2x_after: Some(0.0),
            step_len_gauss_newton: Some(5.0),
            step_len: Some(5.0),
            step_type: Some(StepType::GaussNewton),
            step_direction_change_deg: Some(f64::INFINITY),
            trustregion_before: Some(1000.0),
            ..Default::default()
        };
        let line = record.to_string();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 16);
        assert_eq!(&fields[..4], &["2", "1", "25", "0"]);
        assert_eq!(fields[4], "-");
        assert_eq!(fields[9], "gaussnewton");
        assert_eq!(fields[10], "-");
        assert_eq!(fields[14], "1000");
    }
}
