//! Logging setup shared by the service and the CLI.
//!
//! Everything is collected by `tracing`. Records emitted through the `log`
//! facade (the IPC crate logs that way) are forwarded into the same sinks.

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, registry::LookupSpan, EnvFilter, Layer};

/// Prefix of the daily log files
pub const LOG_FILE_PREFIX: &str = "tunnel-manager";

/// How logs are emitted
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Most verbose level kept unless `RUST_LOG` says otherwise
    pub level: Level,

    /// Emit JSON lines instead of human-readable text
    pub json_format: bool,

    /// Also write daily rotated files into this directory
    pub log_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            json_format: false,
            log_dir: None,
        }
    }
}

/// Parse a level name, falling back to INFO for anything unrecognized.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn format_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let layer = fmt::layer().with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive until exit when file logging is enabled,
/// otherwise buffered lines are lost. Installing twice in one process is a
/// no-op.
///
/// ```
/// use shared_utils::logging::{init_logging, LogOptions};
///
/// let _guard = init_logging(LogOptions {
///     level: tracing::Level::DEBUG,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let mut layers = vec![format_layer(options.json_format)];

    let guard = options.log_dir.as_ref().map(|dir| {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        let (writer, guard) = NonBlocking::new(appender);
        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer);
        layers.push(if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        });
        guard
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}
