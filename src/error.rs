//! Error taxonomy shared by the feature and split engines.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unsupported window '{0}' (use like 1h, 6h, 24h, 7d)")]
    InvalidWindow(String),
    #[error("duplicate window label: {0}")]
    DuplicateWindow(String),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("{field} must be in (0, 1), got {value}")]
    InvalidFraction { field: &'static str, value: f64 },
    #[error("at least one window is required")]
    EmptyWindows,
    #[error("at least one entity is required")]
    EmptyEntities,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: String },
    #[error("table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },
    #[error("table '{table}' row has {found} values, expected {expected}")]
    RowWidth {
        table: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown schema: {name} (known: {known:?})")]
    UnknownSchema { name: String, known: Vec<String> },
    #[error("row {row}: column '{column}' must not be null")]
    NullKey { column: String, row: usize },
    #[error("event {event_id}: invalid timestamp '{value}'")]
    InvalidTimestamp { event_id: String, value: String },
    #[error("duplicate event_id: {0}")]
    DuplicateEventId(String),
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("feature spec version mismatch: expected {expected}, got {actual}")]
    SpecVersionMismatch { expected: u32, actual: u32 },
    #[error("feature spec fingerprint mismatch: expected {expected}, got {actual}")]
    SpecFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum SplitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}
