//! Logging setup for dogleg-solver binaries and benches
//!
//! Diagnostics go to stderr so that vnlog records written to stdout by
//! [`VnlogWriter`](crate::observers::VnlogWriter) stay machine-readable.
//!
//! Human-readable solver progress ([`Verbosity::Human`](crate::optimizer::Verbosity))
//! is emitted at `debug` level; enable it with `RUST_LOG=dogleg_solver=debug` or
//! [`init_logger_with_level`].

use tracing::Level;

/// Initialize the tracing subscriber at INFO (overrideable via `RUST_LOG`)
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module]` for INFO/WARN/ERROR
///         `[LEVEL YYYY-MM-DD HH:MM:SS file:line]` for DEBUG/TRACE
///
/// # Example
/// ```no_run
/// use dogleg_solver::init_logger;
///
/// init_logger();
/// tracing::info!("Application started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// # Example
/// ```no_run
/// use dogleg_solver::init_logger_with_level;
/// use tracing::Level;
///
/// init_logger_with_level(Level::DEBUG);
/// tracing::debug!("solver progress visible");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .event_format(BracketFormatter)
        .init();
}

/// `[LEVEL timestamp location] message`
struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();
        let (color, name) = match level {
            Level::ERROR => (31, "ERROR"),
            Level::WARN => (33, "WARN"),
            Level::INFO => (32, "INFO"),
            Level::DEBUG => (34, "DEBUG"),
            Level::TRACE => (35, "TRACE"),
        };
        if writer.has_ansi_escapes() {
            write!(writer, "[\x1b[{color}m{name}\x1b[0m ")?;
        } else {
            write!(writer, "[{name} ")?;
        }
        write!(writer, "{} ", Local::now().format("%Y-%m-%d %H:%M:%S"))?;

        match (level >= Level::DEBUG, metadata.file()) {
            // DEBUG and TRACE compare greater than INFO
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}")?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{line}")?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
