//! Raw event tables and the canonicalizer.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use tracing::info;

use crate::config::{EntityKey, EventKind};
use crate::error::SchemaError;
use crate::schema::schema_for;

/// Group key used for rows whose grouping column is null.
pub const MISSING_KEY: &str = "<NA>";

const KEY_COLUMNS: [&str; 5] = [
    "user_id",
    "session_id",
    "ip_hash",
    "device_fingerprint_hash",
    "credit_card_hash",
];

const NAIVE_TS_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<FixedOffset>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn key_repr(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Null => None,
            Self::Str(s) => Some(Cow::Borrowed(s)),
            Self::Bool(b) => Some(Cow::Owned(b.to_string())),
            Self::Int(i) => Some(Cow::Owned(i.to_string())),
            Self::Float(f) => Some(Cow::Owned(f.to_string())),
            Self::Timestamp(ts) => Some(Cow::Owned(ts.to_rfc3339())),
        }
    }

    pub fn to_f64_lossy(&self) -> f64 {
        let raw = match self {
            Self::Null | Self::Timestamp(_) => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Int(i) => *i as f64,
            Self::Float(f) => *f,
            Self::Str(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        };
        if raw.is_finite() {
            raw
        } else {
            0.0
        }
    }

    pub fn to_bool_lossy(&self) -> bool {
        match self {
            Self::Null | Self::Timestamp(_) => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0 && !f.is_nan(),
            Self::Str(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "t"
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<Z: TimeZone> From<DateTime<Z>> for Value {
    fn from(value: DateTime<Z>) -> Self {
        Self::Timestamp(value.fixed_offset())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl EventTable {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), SchemaError> {
        if row.len() != self.columns.len() {
            return Err(SchemaError::RowWidth {
                table: self.name.clone(),
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn push_record<'a, I>(&mut self, record: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut row = vec![Value::Null; self.columns.len()];
        for (column, value) in record {
            let idx = self
                .column_index(column)
                .ok_or_else(|| SchemaError::UnknownColumn {
                    table: self.name.clone(),
                    column: column.to_string(),
                })?;
            row[idx] = value;
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), SchemaError> {
        require_columns(&self.name, &self.columns, required)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub event_ts: DateTime<Tz>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub ip_id: Option<String>,
    pub device_id: Option<String>,
    values: Vec<Value>,
}

impl CanonicalEvent {
    pub fn entity(&self, entity: EntityKey) -> Option<&str> {
        match entity {
            EntityKey::User => self.user_id.as_deref(),
            EntityKey::Ip => self.ip_id.as_deref(),
            EntityKey::Device => self.device_id.as_deref(),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalTable {
    name: String,
    timezone: Tz,
    columns: Vec<String>,
    events: Vec<CanonicalEvent>,
}

impl CanonicalTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn require_columns(&self, required: &[&str]) -> Result<(), SchemaError> {
        require_columns(&self.name, &self.columns, required)
    }

    pub fn event_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.event_id.as_str()).collect()
    }

    pub fn key_column(&self, column: &str) -> Result<Vec<Cow<'_, str>>, SchemaError> {
        let idx = self.required_index(column)?;
        Ok(self
            .events
            .iter()
            .map(|e| {
                e.values[idx]
                    .key_repr()
                    .unwrap_or(Cow::Borrowed(MISSING_KEY))
            })
            .collect())
    }

    pub fn numeric_column(&self, column: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(column)?;
        Some(
            self.events
                .iter()
                .map(|e| e.values[idx].to_f64_lossy())
                .collect(),
        )
    }

    pub fn bool_column(&self, column: &str) -> Option<Vec<bool>> {
        let idx = self.column_index(column)?;
        Some(
            self.events
                .iter()
                .map(|e| e.values[idx].to_bool_lossy())
                .collect(),
        )
    }

    pub fn indicator_column(&self, column: &str, expected: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(column)?;
        Some(
            self.events
                .iter()
                .map(|e| {
                    if e.values[idx].as_str() == Some(expected) {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect(),
        )
    }

    pub fn group_indices(
        &self,
        entity: EntityKey,
    ) -> Result<BTreeMap<String, Vec<usize>>, SchemaError> {
        self.required_index(entity.column())?;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, event) in self.events.iter().enumerate() {
            let key = event.entity(entity).unwrap_or(MISSING_KEY);
            match groups.get_mut(key) {
                Some(rows) => rows.push(idx),
                None => {
                    groups.insert(key.to_string(), vec![idx]);
                }
            }
        }
        Ok(groups)
    }

    pub fn subset(&self, mut keep: impl FnMut(&CanonicalEvent) -> bool) -> CanonicalTable {
        CanonicalTable {
            name: self.name.clone(),
            timezone: self.timezone,
            columns: self.columns.clone(),
            events: self.events.iter().filter(|e| keep(e)).cloned().collect(),
        }
    }

    fn required_index(&self, column: &str) -> Result<usize, SchemaError> {
        self.column_index(column)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }
}

pub fn canonicalize(
    table: &EventTable,
    required: &[&str],
    timezone: Tz,
) -> Result<CanonicalTable, SchemaError> {
    table.require_columns(&["event_id", "event_ts"])?;
    table.require_columns(required)?;

    let id_idx = index_of(table, "event_id")?;
    let ts_idx = index_of(table, "event_ts")?;
    let key_indices: Vec<usize> = KEY_COLUMNS
        .iter()
        .filter_map(|c| table.column_index(c))
        .collect();

    let mut seen_ids = HashSet::with_capacity(table.len());
    let mut events = Vec::with_capacity(table.len());
    for (row_idx, row) in table.rows().iter().enumerate() {
        let event_id = row[id_idx]
            .key_repr()
            .ok_or_else(|| SchemaError::NullKey {
                column: "event_id".to_string(),
                row: row_idx,
            })?
            .into_owned();
        if !seen_ids.insert(event_id.clone()) {
            return Err(SchemaError::DuplicateEventId(event_id));
        }

        let event_ts = normalize_timestamp(&row[ts_idx], timezone, &event_id)?;

        let mut values = row.clone();
        values[id_idx] = Value::Str(event_id.clone());
        values[ts_idx] = Value::Timestamp(event_ts.fixed_offset());
        for &idx in &key_indices {
            values[idx] = normalize_key(&values[idx]);
        }

        let key_of = |column: &str| {
            table
                .column_index(column)
                .and_then(|idx| values[idx].as_str().map(str::to_string))
        };
        let user_id = key_of("user_id");
        let session_id = key_of("session_id");
        let ip_id = key_of(EntityKey::Ip.column());
        let device_id = key_of(EntityKey::Device.column());

        events.push(CanonicalEvent {
            event_id,
            event_ts,
            user_id,
            session_id,
            ip_id,
            device_id,
            values,
        });
    }

    // `sort_by` is stable; with unique event ids the order is total anyway.
    events.sort_by(canonical_cmp);

    info!(
        component = "events",
        event = "events.canonicalize.finish",
        table = table.name(),
        rows = events.len(),
        columns = table.columns().len(),
        timezone = %timezone
    );

    Ok(CanonicalTable {
        name: table.name().to_string(),
        timezone,
        columns: table.columns().to_vec(),
        events,
    })
}

pub fn canonicalize_kind(
    table: &EventTable,
    kind: EventKind,
    timezone: Tz,
) -> Result<CanonicalTable, SchemaError> {
    let required = schema_for(kind).required_columns();
    canonicalize(table, &required, timezone)
}

/// Canonical total order: `(event_ts, user_id, event_id)`, null users last.
pub fn canonical_cmp(a: &CanonicalEvent, b: &CanonicalEvent) -> Ordering {
    a.event_ts
        .cmp(&b.event_ts)
        .then_with(|| cmp_nulls_last(a.user_id.as_deref(), b.user_id.as_deref()))
        .then_with(|| a.event_id.cmp(&b.event_id))
}

fn cmp_nulls_last(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn normalize_key(value: &Value) -> Value {
    match value.key_repr() {
        Some(key) => Value::Str(key.into_owned()),
        None => Value::Null,
    }
}

fn normalize_timestamp(
    value: &Value,
    timezone: Tz,
    event_id: &str,
) -> Result<DateTime<Tz>, SchemaError> {
    let parsed = match value {
        Value::Timestamp(ts) => Some(ts.with_timezone(&timezone)),
        Value::Str(raw) => parse_timestamp_str(raw.trim(), timezone),
        _ => None,
    };
    parsed.ok_or_else(|| SchemaError::InvalidTimestamp {
        event_id: event_id.to_string(),
        value: value.to_string(),
    })
}

fn parse_timestamp_str(raw: &str, timezone: Tz) -> Option<DateTime<Tz>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&timezone));
    }
    NAIVE_TS_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| timezone.from_local_datetime(&naive).earliest())
    })
}

fn index_of(table: &EventTable, column: &str) -> Result<usize, SchemaError> {
    table
        .column_index(column)
        .ok_or_else(|| SchemaError::MissingColumn {
            table: table.name().to_string(),
            column: column.to_string(),
        })
}

fn require_columns(table: &str, columns: &[String], required: &[&str]) -> Result<(), SchemaError> {
    for column in required {
        if !columns.iter().any(|c| c == column) {
            return Err(SchemaError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
    }
    Ok(())
}
