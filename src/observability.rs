//! Logging configuration and run-level structured events.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::assembler::FeatureSpec;
use crate::config::RunConfig;
use crate::splitter::SplitSummary;

const ENV_LOG_LEVEL: &str = "DETECTLAB_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "DETECTLAB_LOG_FORMAT";
const ENV_LOG_TARGET: &str = "DETECTLAB_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = env::var(ENV_LOG_LEVEL)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        config.level = level;
    }

    if let Some(format) = env::var(ENV_LOG_FORMAT).ok().as_deref().and_then(parse_log_format) {
        config.format = format;
    }

    if let Some(include_target) = env::var(ENV_LOG_TARGET).ok().as_deref().and_then(parse_bool) {
        config.include_target = include_target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_run_start(logging: &LoggingConfig, run: &RunConfig) {
    info!(
        component = "run",
        event = "run.start",
        timezone = %run.timezone,
        seed = run.seed,
        log_level = %logging.level,
        log_format = ?logging.format
    );
}

pub fn log_feature_spec(spec: &FeatureSpec) {
    info!(
        component = "run",
        event = "run.feature_spec",
        event_kind = spec.event_kind.as_str(),
        spec_version = spec.spec_version,
        feature_columns = spec.feature_columns.len(),
        fingerprint = %spec.fingerprint
    );
}

pub fn log_split_summary(summary: &SplitSummary) {
    info!(
        component = "run",
        event = "run.split_summary",
        train_rows = summary.train_rows,
        time_eval_rows = summary.time_eval_rows,
        user_holdout_rows = summary.user_holdout_rows,
        holdout_users = summary.holdout_users,
        boundary_ts = %summary.boundary_ts
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "text" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
