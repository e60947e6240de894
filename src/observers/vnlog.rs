//! Structured per-attempt diagnostics in vnlog format.
//!
//! One space-separated line per step attempt, preceded once by a `# ` legend. Absent
//! or infinite values are written as `-`, numbers like C's `%g`.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::observers::{AttemptRecord, ObserverError, ObserverResult, OptObserver};

/// Format a double like C's `%g`: 6 significant digits, trailing zeros removed,
/// scientific notation when the exponent is below -4 or at least 6.
pub fn format_g(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.5e}", value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if !(-4..6).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

struct VnlogSink<W> {
    out: W,
    legend_written: bool,
}

/// Observer writing every [`AttemptRecord`] as a vnlog line.
pub struct VnlogWriter<W: Write + Send> {
    sink: Mutex<VnlogSink<W>>,
}

impl VnlogWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> VnlogWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            sink: Mutex::new(VnlogSink {
                out,
                legend_written: false,
            }),
        }
    }

    /// Hand back the underlying writer.
    pub fn into_inner(self) -> ObserverResult<W> {
        self.sink
            .into_inner()
            .map(|sink| sink.out)
            .map_err(|e| {
                ObserverError::MutexPoisoned {
                    context: "VnlogWriter::into_inner".to_string(),
                    reason: e.to_string(),
                }
                .log()
            })
    }

    fn write_record(&self, record: Option<&AttemptRecord>) -> ObserverResult<()> {
        let mut sink = self.sink.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "VnlogWriter".to_string(),
                reason: e.to_string(),
            }
            .log()
        })?;

        if !sink.legend_written {
            writeln!(sink.out, "{}", AttemptRecord::legend())
                .map_err(|e| ObserverError::WriteFailed(e.to_string()).log_with_source(e))?;
            sink.legend_written = true;
        }
        if let Some(record) = record {
            writeln!(sink.out, "{}", record)
                .map_err(|e| ObserverError::WriteFailed(e.to_string()).log_with_source(e))?;
        }
        Ok(())
    }
}

impl<W: Write + Send> OptObserver for VnlogWriter<W> {
    fn on_start(&self) {
        let _ = self.write_record(None);
    }

    fn on_attempt(&self, record: &AttemptRecord) {
        let _ = self.write_record(Some(record));
    }
}
