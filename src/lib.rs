//! Detectlab feature and split crate.
//!
//! Current implemented scope:
//! - event schemas and canonical ordering of login and checkout streams
//! - past-only rolling aggregates, distinct counts and cross-event windows
//! - feature table assembly with a versioned, fingerprinted spec
//! - user holdout plus time-based train/eval splitting

mod assembler;
mod config;
mod cross_event;
mod dedup;
mod error;
mod events;
mod observability;
mod rolling;
mod schema;
mod splitter;
mod window;

pub use assembler::{
    assert_spec_compatible, build_feature_table, FeatureRow, FeatureSpec, FeatureTable,
    FEATURE_SPEC_VERSION,
};
pub use config::{
    parse_timezone, EntityKey, EventKind, FeatureConfig, RunConfig, SplitConfig, DEFAULT_TIMEZONE,
};
pub use cross_event::cross_event_window_sums;
pub use dedup::unique_count_window;
pub use error::{ConfigError, FeatureError, SchemaError, SplitError};
pub use events::{
    canonical_cmp, canonicalize, canonicalize_kind, CanonicalEvent, CanonicalTable, EventTable,
    Value, MISSING_KEY,
};
pub use observability::{
    init_logging, log_feature_spec, log_run_start, log_split_summary, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use rolling::{rolling_aggregate, safe_rate, NumericColumn, RollingColumns};
pub use schema::{
    get_schema, list_schemas, schema_for, ColumnSpec, ColumnType, EventSchema,
    CHECKOUT_ATTEMPT_SCHEMA, LOGIN_ATTEMPT_SCHEMA,
};
pub use splitter::{
    holdout_user_count, split_dataset, time_boundary, SplitAssignment, SplitName, SplitSummary,
};
pub use window::{parse_window, parse_windows, Window};
