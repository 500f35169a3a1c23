//! Feature table assembly for login and checkout streams.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{EntityKey, EventKind, FeatureConfig};
use crate::cross_event::cross_event_window_sums;
use crate::dedup::unique_count_window;
use crate::error::{FeatureError, SchemaError};
use crate::events::{CanonicalTable, MISSING_KEY};
use crate::rolling::{rolling_aggregate, safe_rate, NumericColumn, RollingColumns};
use crate::splitter::{SplitAssignment, SplitName};
use crate::window::Window;

pub const FEATURE_SPEC_VERSION: u32 = 1;

const LOGIN_LABEL_COLUMNS: [&str; 4] = [
    "label_replicators",
    "label_the_mule",
    "label_the_chameleon",
    "label_benign",
];
const FRAUD_LABEL_COLUMNS: [&str; 3] = [
    "label_replicators",
    "label_the_mule",
    "label_the_chameleon",
];
const SUPPORT_FLAG_COLUMN: &str = "support_contacted";
const SUPPORT_SUM_COLUMNS: [&str; 3] = [
    "support_cost_usd",
    "support_wait_seconds",
    "support_handle_seconds",
];
const ADVERSE: &str = "adverse";
const EVENT_ONE: &str = "event";

struct OutcomeProfile {
    column: &'static str,
    outcomes: &'static [&'static str],
    rated: &'static [&'static str],
    adverse: &'static [&'static str],
    amounts: &'static [&'static str],
}

static LOGIN_PROFILE: OutcomeProfile = OutcomeProfile {
    column: "login_result",
    outcomes: &["success", "failure", "challenge", "lockout"],
    rated: &["success", "failure", "challenge", "lockout"],
    adverse: &[],
    amounts: &[],
};

static CHECKOUT_PROFILE: OutcomeProfile = OutcomeProfile {
    column: "checkout_result",
    outcomes: &["success", "failure", "review"],
    rated: &["success", "failure", "review"],
    adverse: &["failure", "review"],
    amounts: &["payment_value", "basket_size"],
};

fn profile(kind: EventKind) -> &'static OutcomeProfile {
    match kind {
        EventKind::LoginAttempt => &LOGIN_PROFILE,
        EventKind::CheckoutAttempt => &CHECKOUT_PROFILE,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub spec_version: u32,
    pub event_kind: EventKind,
    pub windows: Vec<String>,
    pub entities: Vec<EntityKey>,
    pub strict_past_only: bool,
    pub include_support: bool,
    pub include_cross_event: bool,
    pub keys: Vec<String>,
    pub label_columns: Vec<String>,
    pub feature_columns: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub event_id: String,
    pub event_ts: DateTime<Tz>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub labels: Vec<bool>,
    pub values: Vec<f64>,
    pub split: Option<SplitName>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    spec: FeatureSpec,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn key_columns(&self) -> &[String] {
        &self.spec.keys
    }

    pub fn label_columns(&self) -> &[String] {
        &self.spec.label_columns
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.spec.feature_columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.spec.feature_columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r.values[idx]).collect())
    }

    pub fn label(&self, name: &str) -> Option<Vec<bool>> {
        let idx = self.spec.label_columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r.labels[idx]).collect())
    }

    pub fn row(&self, event_id: &str) -> Option<&FeatureRow> {
        self.rows.iter().find(|r| r.event_id == event_id)
    }

    pub fn value(&self, event_id: &str, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.row(event_id).map(|r| r.values[idx])
    }

    pub fn with_splits(mut self, assignment: &SplitAssignment) -> Self {
        let membership = assignment.membership();
        for row in &mut self.rows {
            row.split = membership.get(row.event_id.as_str()).copied();
        }
        self
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.spec.fingerprint.as_bytes());
        for row in &self.rows {
            hasher.update([0x1e_u8]);
            for field in [
                row.event_id.as_str(),
                row.event_ts.to_rfc3339().as_str(),
                row.user_id.as_deref().unwrap_or(MISSING_KEY),
                row.session_id.as_deref().unwrap_or(MISSING_KEY),
                row.split.map(SplitName::as_str).unwrap_or(""),
            ] {
                hasher.update(field.as_bytes());
                hasher.update([0x1f_u8]);
            }
            for label in &row.labels {
                hasher.update([u8::from(*label)]);
            }
            for value in &row.values {
                hasher.update(value.to_bits().to_le_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

pub fn assert_spec_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSpec,
) -> Result<(), FeatureError> {
    if expected_version != actual.spec_version {
        return Err(FeatureError::SpecVersionMismatch {
            expected: expected_version,
            actual: actual.spec_version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SpecFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

struct CrossPlan<'a> {
    table: &'a CanonicalTable,
    kind: EventKind,
    signals: Vec<NumericColumn>,
    outcomes: Vec<&'static str>,
    payment: bool,
}

struct FeaturePlan<'a> {
    windows: Vec<Window>,
    entities: Vec<EntityKey>,
    signals: Vec<NumericColumn>,
    outcomes: Vec<&'static str>,
    rated: &'static [&'static str],
    support_flag: bool,
    support_sums: Vec<&'static str>,
    amounts: Vec<&'static str>,
    distinct: bool,
    cross: Option<CrossPlan<'a>>,
}

pub fn build_feature_table(
    kind: EventKind,
    primary: &CanonicalTable,
    secondary: Option<&CanonicalTable>,
    cfg: &FeatureConfig,
) -> Result<FeatureTable, FeatureError> {
    let plan = resolve_plan(kind, primary, secondary, cfg)?;

    info!(
        component = "features",
        event = "features.build.start",
        event_kind = kind.as_str(),
        rows = primary.len(),
        windows = ?cfg.windows,
        entities = ?plan.entities,
        strict_past_only = cfg.strict_past_only,
        cross_event = plan.cross.is_some()
    );

    let mut features: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for &entity in &plan.entities {
        for window in &plan.windows {
            let prefix = format!("{}_{}__", entity.as_str(), window.label);
            let rolling = rolling_aggregate(
                primary,
                entity,
                window,
                &plan.signals,
                cfg.strict_past_only,
            )?;
            add_rolling_columns(&mut features, &prefix, &rolling, &plan);

            if plan.distinct {
                for attr in distinct_attributes(kind, entity) {
                    if !primary.has_column(attr) {
                        continue;
                    }
                    let counts = unique_count_window(primary, entity, attr, window)?;
                    features.insert(
                        format!("{prefix}uniq_{attr}_cnt"),
                        counts.into_iter().map(|c| c as f64).collect(),
                    );
                }
            }

            if let Some(cross) = &plan.cross {
                if cross.table.has_column(entity.column()) {
                    let sums = cross_event_window_sums(
                        primary,
                        cross.table,
                        entity,
                        &cross.signals,
                        window,
                    )?;
                    let cross_prefix = format!(
                        "cross__{}__{}_{}__",
                        cross.kind.as_str(),
                        entity.as_str(),
                        window.label
                    );
                    add_cross_columns(&mut features, &cross_prefix, sums, cross);
                }
            }

            debug!(
                component = "features",
                event = "features.build.window",
                entity = entity.as_str(),
                window = %window.label,
                columns_so_far = features.len()
            );
        }
    }

    let labels = label_columns(kind, primary)?;
    let mut keys = vec![
        "event_id".to_string(),
        "event_ts".to_string(),
        "user_id".to_string(),
    ];
    if primary.has_column("session_id") {
        keys.push("session_id".to_string());
    }

    let rows = primary
        .events()
        .iter()
        .enumerate()
        .map(|(i, event)| FeatureRow {
            event_id: event.event_id.clone(),
            event_ts: event.event_ts,
            user_id: event.user_id.clone(),
            session_id: event.session_id.clone(),
            labels: labels.iter().map(|(_, values)| values[i]).collect(),
            values: features.values().map(|column| column[i]).collect(),
            split: None,
        })
        .collect();

    let mut spec = FeatureSpec {
        spec_version: FEATURE_SPEC_VERSION,
        event_kind: kind,
        windows: plan.windows.iter().map(|w| w.label.clone()).collect(),
        entities: cfg.unique_entities(),
        strict_past_only: cfg.strict_past_only,
        include_support: cfg.include_support,
        include_cross_event: cfg.include_cross_event,
        keys,
        label_columns: labels.into_iter().map(|(name, _)| name).collect(),
        feature_columns: features.into_keys().collect(),
        fingerprint: String::new(),
    };
    spec.fingerprint = spec_fingerprint(&spec);

    info!(
        component = "features",
        event = "features.build.finish",
        event_kind = kind.as_str(),
        rows = primary.len(),
        feature_columns = spec.feature_columns.len(),
        fingerprint = %spec.fingerprint
    );

    Ok(FeatureTable { spec, rows })
}

fn resolve_plan<'a>(
    kind: EventKind,
    primary: &CanonicalTable,
    secondary: Option<&'a CanonicalTable>,
    cfg: &FeatureConfig,
) -> Result<FeaturePlan<'a>, FeatureError> {
    let windows = cfg.validate()?;
    let profile = profile(kind);

    let entities: Vec<EntityKey> = cfg
        .unique_entities()
        .into_iter()
        .filter(|e| {
            let present = primary.has_column(e.column());
            if !present {
                debug!(
                    component = "features",
                    event = "features.entity.skipped",
                    entity = e.as_str(),
                    column = e.column()
                );
            }
            present
        })
        .collect();

    let (mut signals, outcomes) = outcome_signals(primary, profile)?;

    let support_flag = kind == EventKind::LoginAttempt
        && cfg.include_support
        && primary.has_column(SUPPORT_FLAG_COLUMN);
    let mut support_sums = Vec::new();
    if support_flag {
        if let Some(flags) = primary.bool_column(SUPPORT_FLAG_COLUMN) {
            signals.push(NumericColumn::new(
                SUPPORT_FLAG_COLUMN,
                flags.into_iter().map(|f| f64::from(u8::from(f))).collect(),
            ));
        }
        for column in SUPPORT_SUM_COLUMNS {
            if let Some(values) = primary.numeric_column(column) {
                signals.push(NumericColumn::new(column, values));
                support_sums.push(column);
            }
        }
    }

    let mut amounts = Vec::new();
    for &column in profile.amounts {
        if let Some(values) = primary.numeric_column(column) {
            signals.push(NumericColumn::new(column, values));
            amounts.push(column);
        }
    }

    let cross = match secondary {
        Some(table) if cfg.include_cross_event && !table.is_empty() => {
            Some(resolve_cross_plan(kind.counterpart(), table)?)
        }
        _ => {
            if cfg.include_cross_event {
                debug!(
                    component = "features",
                    event = "features.cross_event.skipped",
                    event_kind = kind.as_str(),
                    reason = "no_secondary_rows"
                );
            }
            None
        }
    };

    Ok(FeaturePlan {
        windows,
        entities,
        signals,
        outcomes,
        rated: profile.rated,
        support_flag,
        support_sums,
        amounts,
        distinct: cfg.strict_past_only,
        cross,
    })
}

fn resolve_cross_plan(
    kind: EventKind,
    table: &CanonicalTable,
) -> Result<CrossPlan<'_>, SchemaError> {
    let (outcome_signals, outcomes) = outcome_signals(table, profile(kind))?;
    let mut signals = Vec::with_capacity(outcome_signals.len() + 2);
    signals.push(NumericColumn::new(EVENT_ONE, vec![1.0; table.len()]));
    signals.extend(outcome_signals);

    let mut payment = false;
    if kind == EventKind::CheckoutAttempt {
        if let Some(values) = table.numeric_column("payment_value") {
            signals.push(NumericColumn::new("payment_value", values));
            payment = true;
        }
    }

    Ok(CrossPlan {
        table,
        kind,
        signals,
        outcomes,
        payment,
    })
}

fn outcome_signals(
    table: &CanonicalTable,
    profile: &OutcomeProfile,
) -> Result<(Vec<NumericColumn>, Vec<&'static str>), SchemaError> {
    let idx = result_column(table, profile.column)?;

    let mut signals = Vec::with_capacity(profile.outcomes.len() + 1);
    let mut names = Vec::with_capacity(profile.outcomes.len() + 1);
    for &outcome in profile.outcomes {
        let values = table
            .events()
            .iter()
            .map(|e| f64::from(u8::from(e.values()[idx].as_str() == Some(outcome))))
            .collect();
        signals.push(NumericColumn::new(outcome, values));
        names.push(outcome);
    }

    if !profile.adverse.is_empty() {
        let values = table
            .events()
            .iter()
            .map(|e| {
                let result = e.values()[idx].as_str();
                f64::from(u8::from(profile.adverse.iter().any(|a| result == Some(*a))))
            })
            .collect();
        signals.push(NumericColumn::new(ADVERSE, values));
        names.push(ADVERSE);
    }

    Ok((signals, names))
}

fn result_column(table: &CanonicalTable, column: &str) -> Result<usize, SchemaError> {
    table
        .column_index(column)
        .ok_or_else(|| SchemaError::MissingColumn {
            table: table.name().to_string(),
            column: column.to_string(),
        })
}

fn add_rolling_columns(
    features: &mut BTreeMap<String, Vec<f64>>,
    prefix: &str,
    rolling: &RollingColumns,
    plan: &FeaturePlan<'_>,
) {
    let count = &rolling.attempt_cnt;
    let rate_of = |sum: &[f64]| -> Vec<f64> {
        sum.iter()
            .zip(count)
            .map(|(s, c)| safe_rate(*s, *c))
            .collect()
    };

    features.insert(format!("{prefix}attempt_cnt"), count.clone());

    for &outcome in &plan.outcomes {
        if let Some(sum) = rolling.sum(outcome) {
            features.insert(format!("{prefix}{outcome}_cnt"), sum.to_vec());
        }
    }
    for &outcome in plan.rated {
        if let Some(sum) = rolling.sum(outcome) {
            features.insert(format!("{prefix}{outcome}_rate"), rate_of(sum));
        }
    }

    if plan.support_flag {
        if let Some(sum) = rolling.sum(SUPPORT_FLAG_COLUMN) {
            features.insert(format!("{prefix}{SUPPORT_FLAG_COLUMN}_cnt"), sum.to_vec());
        }
    }
    for &column in &plan.support_sums {
        if let Some(sum) = rolling.sum(column) {
            features.insert(format!("{prefix}{column}_sum"), sum.to_vec());
        }
    }

    for &column in &plan.amounts {
        if let Some(sum) = rolling.sum(column) {
            features.insert(format!("{prefix}{column}_sum"), sum.to_vec());
            features.insert(format!("{prefix}{column}_mean"), rate_of(sum));
        }
    }
}

fn add_cross_columns(
    features: &mut BTreeMap<String, Vec<f64>>,
    prefix: &str,
    sums: Vec<NumericColumn>,
    cross: &CrossPlan<'_>,
) {
    let mut by_name: BTreeMap<String, Vec<f64>> =
        sums.into_iter().map(|c| (c.name, c.values)).collect();
    let Some(count) = by_name.remove(EVENT_ONE) else {
        return;
    };
    let rate_of = |sum: &[f64]| -> Vec<f64> {
        sum.iter()
            .zip(&count)
            .map(|(s, c)| safe_rate(*s, *c))
            .collect()
    };

    for &outcome in &cross.outcomes {
        if let Some(sum) = by_name.remove(outcome) {
            features.insert(format!("{prefix}{outcome}_rate"), rate_of(&sum));
            features.insert(format!("{prefix}{outcome}_cnt"), sum);
        }
    }
    if cross.payment {
        if let Some(sum) = by_name.remove("payment_value") {
            features.insert(format!("{prefix}payment_value_mean"), rate_of(&sum));
            features.insert(format!("{prefix}payment_value_sum"), sum);
        }
    }
    features.insert(format!("{prefix}event_cnt"), count);
}

fn distinct_attributes(kind: EventKind, entity: EntityKey) -> &'static [&'static str] {
    match (kind, entity) {
        (EventKind::LoginAttempt, EntityKey::User) => &["ip_hash", "device_fingerprint_hash"],
        (EventKind::CheckoutAttempt, EntityKey::User) => {
            &["ip_hash", "device_fingerprint_hash", "credit_card_hash"]
        }
        (_, EntityKey::Ip) => &["user_id", "device_fingerprint_hash"],
        (_, EntityKey::Device) => &["user_id", "ip_hash"],
    }
}

fn label_columns(
    kind: EventKind,
    table: &CanonicalTable,
) -> Result<Vec<(String, Vec<bool>)>, SchemaError> {
    let mut out = Vec::new();
    match kind {
        EventKind::LoginAttempt => {
            for column in LOGIN_LABEL_COLUMNS {
                if let Some(values) = table.bool_column(column) {
                    out.push((column.to_string(), values));
                }
            }
            let is_fraud = if let Some(values) = table.bool_column("is_fraud") {
                values
            } else if FRAUD_LABEL_COLUMNS.iter().all(|c| table.has_column(c)) {
                let mut merged = vec![false; table.len()];
                for column in FRAUD_LABEL_COLUMNS {
                    if let Some(values) = table.bool_column(column) {
                        for (acc, v) in merged.iter_mut().zip(values) {
                            *acc |= v;
                        }
                    }
                }
                merged
            } else {
                vec![false; table.len()]
            };
            out.push(("is_fraud".to_string(), is_fraud));
        }
        EventKind::CheckoutAttempt => {
            let idx = result_column(table, CHECKOUT_PROFILE.column)?;
            let is_adverse = table
                .events()
                .iter()
                .map(|e| e.values()[idx].as_str() != Some("success"))
                .collect();
            out.push(("is_adverse".to_string(), is_adverse));
        }
    }
    Ok(out)
}

fn spec_fingerprint(spec: &FeatureSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", spec.spec_version));
    hasher.update(format!("kind:{};", spec.event_kind.as_str()));
    hasher.update("windows:");
    for window in &spec.windows {
        hasher.update(format!("{window},"));
    }
    hasher.update(";entities:");
    for entity in &spec.entities {
        hasher.update(format!("{},", entity.as_str()));
    }
    hasher.update(format!(
        ";strict:{};support:{};cross:{};columns:",
        spec.strict_past_only, spec.include_support, spec.include_cross_event
    ));
    for column in spec
        .keys
        .iter()
        .chain(&spec.label_columns)
        .chain(&spec.feature_columns)
    {
        hasher.update(column.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}
