//! Log level resolution and subscriber installation.

use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::env::vars;
use crate::config::{Config, keys};
use crate::paths::{LOG_FILE, PathConfig};

/// Keeps the file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::WARN;

/// Parse a level name. `panic` and `fatal` map to `error`.
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => Some(LevelFilter::ERROR),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Effective log level; the first of these that yields a level wins:
///
/// 1. `voldrive.logLevel`, unless it is only the registered default
/// 2. `libvol.logging.level`, same condition
/// 3. `VOLDRIVE_DEBUG`, then `LIBVOL_DEBUG` (debug)
/// 4. `VOLDRIVE_LOGLEVEL`, then `LIBVOL_LOGGING_LEVEL`
/// 5. `warn`
pub fn resolve_log_level(config: &Config) -> LevelFilter {
    for key in [keys::LOG_LEVEL, keys::CORE_LOG_LEVEL] {
        if !config.is_set(key) {
            continue;
        }
        if let Some(level) = config.get_string(key).as_deref().and_then(parse_level) {
            return level;
        }
    }

    let env = config.env();
    for name in [vars::VOLDRIVE_DEBUG, vars::LIBVOL_DEBUG] {
        if env.get_bool(name) == Some(true) {
            return LevelFilter::DEBUG;
        }
    }
    for name in [vars::VOLDRIVE_LOGLEVEL, vars::LIBVOL_LOGGING_LEVEL] {
        if let Some(level) = env.get(name).and_then(parse_level) {
            return level;
        }
    }

    DEFAULT_LEVEL
}

fn filter_for(level: LevelFilter) -> EnvFilter {
    // RUST_LOG wins when present.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Install the global subscriber: stderr plus `<paths.log>/voldrive.log`.
///
/// Only the first call has an effect. A log directory that cannot be created
/// leaves stderr logging in place.
pub fn init_logging(level: LevelFilter, paths: &PathConfig) {
    LOG_GUARD.get_or_init(|| {
        let file = match std::fs::create_dir_all(&paths.log) {
            Ok(()) => {
                let appender = tracing_appender::rolling::never(&paths.log, LOG_FILE);
                Some(tracing_appender::non_blocking(appender))
            }
            Err(e) => {
                eprintln!("voldrive: logging to stderr only, cannot create {}: {}", paths.log.display(), e);
                None
            }
        };
        let (writer, guard) = match file {
            Some((writer, guard)) => (Some(writer), Some(guard)),
            None => (None, None),
        };

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter_for(level));
        let file_layer = writer.map(|w| {
            fmt::layer()
                .with_writer(w)
                .with_ansi(false)
                .with_filter(filter_for(level))
        });

        // Another subscriber may already be installed (embedding, tests).
        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init();
        guard
    });
}

/// Stderr-only subscriber for the executor binary.
pub fn init_stderr_logging(level: LevelFilter) {
    LOG_GUARD.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_filter(filter_for(level)),
            )
            .try_init();
        None
    });
}
