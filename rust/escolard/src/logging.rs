use std::io;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_ENV: &str = "ESCOLARD_LOG";
pub const LOG_FORMAT_ENV: &str = "ESCOLARD_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Installs the global subscriber. Everything goes to stderr: stdout carries
/// IPC responses and must only ever see one JSON object per line.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_FILTER_ENV)
        .from_env_lossy();
    let format = std::env::var(LOG_FORMAT_ENV)
        .map(|v| LogFormat::parse(&v))
        .unwrap_or(LogFormat::Pretty);

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_ansi(false)
            .with_target(true)
            .try_init(),
    };
    if let Err(e) = result {
        // Logging must not keep the sidecar from serving requests.
        eprintln!("escolard: logging disabled: {e}");
    }
}
