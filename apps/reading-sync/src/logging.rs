use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let level = config.level.to_filter();
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        // stdout belongs to the command loop
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let (env_filter, throttled_deps) = build_env_filter(level);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if throttled_deps {
        eprintln!(
            "[reading-log] suppressing dependency trace noise; set READING_TRACE_DEPS=1 or READING_LOG_FILTER to override"
        );
    }
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var("READING_LOG_FILTER") {
        return (EnvFilter::new(filter), false);
    }
    let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
    (EnvFilter::new(filter), throttled)
}

const TRACE_DEP_TARGETS: &[&str] = &[
    "hyper",
    "reqwest",
    "rustls",
    "tokio_tungstenite",
    "tungstenite",
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "mio",
];

fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
    let base = match level {
        LevelFilter::TRACE => "info,reading_session=trace,realtime_bus=trace,reading_sync=trace",
        LevelFilter::DEBUG => "info,reading_session=debug,realtime_bus=debug,reading_sync=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level == LevelFilter::TRACE && !allow_deps {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        (filter, true)
    } else {
        (base.to_owned(), false)
    }
}

fn allow_dependency_traces() -> bool {
    std::env::var("READING_TRACE_DEPS")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_level_scopes_to_our_crates() {
        let (filter, throttled) = default_filter_for(LevelFilter::DEBUG, false);
        assert!(filter.contains("reading_session=debug"));
        assert!(!throttled);
    }

    #[test]
    fn trace_level_quiets_dependencies_unless_asked() {
        let (filter, throttled) = default_filter_for(LevelFilter::TRACE, false);
        assert!(throttled);
        assert!(filter.contains("webrtc=info"));

        let (filter, throttled) = default_filter_for(LevelFilter::TRACE, true);
        assert!(!throttled);
        assert!(!filter.contains("webrtc=info"));
    }
}
