//! Log output for a node
//!
//! Two layers of the crate are chatty at debug: the transport logs every
//! dial attempt and frame, the coordinator logs every dispatch. `-v` opens
//! the coordinator to debug while the transport stays at info, `-vv` opens
//! everything under `peercoms` to trace. Other crates stay at warn. A set
//! `RUST_LOG` replaces the computed filter.
//!
//! Console output goes to stderr so `config show` keeps stdout clean. An
//! optional log file gets its own non-blocking writer.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Keeps the file writer flushing; hold until the node exits
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Levels for the crate as a whole and for its transport modules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity {
    pub node: Level,
    pub transport: Level,
}

impl Verbosity {
    /// Combine the configured level with `-v`/`--quiet`
    pub fn resolve(configured: Level, verbose: u8, quiet: bool) -> Self {
        let (node, transport) = match (quiet, verbose) {
            (true, _) => (Level::ERROR, Level::ERROR),
            (false, 0) => (configured, configured),
            (false, 1) => (Level::DEBUG, Level::INFO),
            (false, _) => (Level::TRACE, Level::TRACE),
        };
        Self { node, transport }
    }

    fn directives(&self) -> String {
        format!(
            "warn,peercoms={},peercoms::transport={}",
            lower(self.node),
            lower(self.transport)
        )
    }
}

fn lower(level: Level) -> String {
    level.as_str().to_lowercase()
}

/// Install the global subscriber for `peercoms run`
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let verbosity = Verbosity::resolve(configured_level(settings)?, verbose, quiet);
    let filter = build_filter(&verbosity)?;

    let (file_layer, file_guard) = match settings.file {
        Some(ref log_file) => {
            let (layer, guard) = build_file_layer(log_file, settings.max_file_size_mb, settings.max_files, settings.json_format)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(build_console_layer(settings.json_format))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(
        node = %verbosity.node,
        transport = %verbosity.transport,
        file = ?settings.file,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

fn configured_level(settings: &LoggingSettings) -> Result<Level> {
    settings
        .level
        .parse()
        .map_err(|_| Error::config_field_invalid("logging.level", format!("Invalid log level '{}'", settings.level)))
}

fn build_filter(verbosity: &Verbosity) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = verbosity.directives();
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Internal(format!("Invalid log filter '{}': {}", directives, e)))
}

fn build_console_layer<S>(json_format: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_format {
        Box::new(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
    } else {
        Box::new(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(true)
                .with_writer(std::io::stderr),
        )
    }
}

/// Small size limits rotate hourly, anything else daily
fn rotation_for(max_size_mb: u64) -> Rotation {
    if max_size_mb > 0 && max_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    }
}

fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json_format: bool,
) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let prefix = path.file_stem().and_then(|n| n.to_str()).unwrap_or("node");
    let appender = RollingFileAppender::builder()
        .rotation(rotation_for(max_size_mb))
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Internal(format!("Failed to create log file appender: {}", e)))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);

    // Files always carry thread ids; the worker pool interleaves otherwise
    let layer: Box<dyn Layer<S> + Send + Sync> = if json_format {
        Box::new(fmt::layer().json().with_writer(writer).with_thread_ids(true).with_ansi(false))
    } else {
        Box::new(fmt::layer().with_writer(writer).with_thread_ids(true).with_ansi(false))
    };

    Ok((layer, guard))
}

/// Warn-level stderr logging for the `config` commands
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}
