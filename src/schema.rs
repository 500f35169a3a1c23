//! Named raw-event schemas.

use serde::Serialize;

use crate::config::EventKind;
use crate::error::SchemaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Bool,
    Int64,
    Float64,
    TimestampTz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub dtype: ColumnType,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventSchema {
    pub name: &'static str,
    pub version: u32,
    pub columns: &'static [ColumnSpec],
}

const fn col(name: &'static str, dtype: ColumnType, required: bool) -> ColumnSpec {
    ColumnSpec {
        name,
        dtype,
        required,
    }
}

pub static LOGIN_ATTEMPT_SCHEMA: EventSchema = EventSchema {
    name: "login_attempt",
    version: 1,
    columns: &[
        col("event_id", ColumnType::String, true),
        col("event_ts", ColumnType::TimestampTz, true),
        col("user_id", ColumnType::String, true),
        col("session_id", ColumnType::String, false),
        col("ip_hash", ColumnType::String, false),
        col("device_fingerprint_hash", ColumnType::String, false),
        col("login_result", ColumnType::String, true),
        col("support_contacted", ColumnType::Bool, false),
        col("support_cost_usd", ColumnType::Float64, false),
        col("support_wait_seconds", ColumnType::Float64, false),
        col("support_handle_seconds", ColumnType::Float64, false),
        col("is_fraud", ColumnType::Bool, false),
        col("label_replicators", ColumnType::Bool, false),
        col("label_the_mule", ColumnType::Bool, false),
        col("label_the_chameleon", ColumnType::Bool, false),
        col("label_benign", ColumnType::Bool, false),
    ],
};

pub static CHECKOUT_ATTEMPT_SCHEMA: EventSchema = EventSchema {
    name: "checkout_attempt",
    version: 1,
    columns: &[
        col("event_id", ColumnType::String, true),
        col("event_ts", ColumnType::TimestampTz, true),
        col("user_id", ColumnType::String, true),
        col("session_id", ColumnType::String, false),
        col("ip_hash", ColumnType::String, false),
        col("device_fingerprint_hash", ColumnType::String, false),
        col("payment_value", ColumnType::Float64, true),
        col("basket_size", ColumnType::Int64, true),
        col("credit_card_hash", ColumnType::String, false),
        col("checkout_result", ColumnType::String, true),
    ],
};

static REGISTRY: [&EventSchema; 2] = [&LOGIN_ATTEMPT_SCHEMA, &CHECKOUT_ATTEMPT_SCHEMA];

impl EventSchema {
    pub fn required_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .filter(|c| c.required)
            .map(|c| c.name)
            .collect()
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

pub fn list_schemas() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.iter().map(|s| s.name).collect();
    names.sort_unstable();
    names
}

pub fn get_schema(name: &str) -> Result<&'static EventSchema, SchemaError> {
    REGISTRY
        .iter()
        .copied()
        .find(|s| s.name == name)
        .ok_or_else(|| SchemaError::UnknownSchema {
            name: name.to_string(),
            known: list_schemas().iter().map(|s| s.to_string()).collect(),
        })
}

pub fn schema_for(kind: EventKind) -> &'static EventSchema {
    match kind {
        EventKind::LoginAttempt => &LOGIN_ATTEMPT_SCHEMA,
        EventKind::CheckoutAttempt => &CHECKOUT_ATTEMPT_SCHEMA,
    }
}
