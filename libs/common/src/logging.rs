//! Logging setup for twinrule binaries
//!
//! Console output plus an optional daily rolling file, both in the
//! `timestamp [LEVEL] message` format. `RUST_LOG` overrides the configured
//! level when set.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable naming the log directory
pub const LOG_DIR_ENV: &str = "TWINRULE_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Loaded 12 rules`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the file writer alive for the life of the process
static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// Log directory: `TWINRULE_LOG_DIR`, then `configured`, then `logs`
pub fn log_root(configured: Option<&str>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| configured.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("logs")))
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Prefix of the log file names (e.g., "twinctl")
    pub service_name: String,
    pub log_dir: PathBuf,
    pub level: Level,
    /// Also write daily rolling files under `log_dir`
    pub log_to_file: bool,
    /// JSON lines in the file instead of the bracketed format
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "twinrule".to_string(),
            log_dir: log_root(None),
            level: Level::INFO,
            log_to_file: false,
            enable_json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives: `RUST_LOG` wins, else the configured level with
    /// the twinrule crates one step more verbose at debug
    fn filter(&self) -> EnvFilter {
        match std::env::var("RUST_LOG") {
            Ok(env) if !env.is_empty() => EnvFilter::new(env),
            _ => EnvFilter::new(filter_directives(self.level)),
        }
    }
}

fn filter_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    if level == "debug" || level == "trace" {
        format!("info,twinrule_engine={0},twinrule_graph={0},twinrule_calc={0},twinctl={0}", level)
    } else {
        level
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.log_to_file {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, format!("{}.log", config.service_name));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let slot = GUARD.get_or_init(|| Mutex::new(None));
        match slot.lock() {
            Ok(mut slot) => *slot = Some(guard),
            Err(poisoned) => {
                eprintln!("Warning: log guard lock was poisoned, recovering...");
                *poisoned.into_inner() = Some(guard);
            },
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.log_to_file {
        tracing::debug!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    }
    Ok(())
}
