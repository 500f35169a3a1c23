//! Leakage-aware dataset partitioning.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SplitConfig;
use crate::error::SplitError;
use crate::events::{CanonicalTable, MISSING_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitName {
    Train,
    TimeEval,
    UserHoldout,
}

impl SplitName {
    pub const ALL: [SplitName; 3] = [SplitName::Train, SplitName::TimeEval, SplitName::UserHoldout];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::TimeEval => "time_eval",
            Self::UserHoldout => "user_holdout",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitAssignment {
    pub train: CanonicalTable,
    pub time_eval: CanonicalTable,
    pub user_holdout: CanonicalTable,
    pub boundary_ts: DateTime<Tz>,
    pub holdout_users: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub train_rows: usize,
    pub time_eval_rows: usize,
    pub user_holdout_rows: usize,
    pub holdout_users: usize,
    pub boundary_ts: String,
}

impl SplitAssignment {
    pub fn partition(&self, name: SplitName) -> &CanonicalTable {
        match name {
            SplitName::Train => &self.train,
            SplitName::TimeEval => &self.time_eval,
            SplitName::UserHoldout => &self.user_holdout,
        }
    }

    pub fn membership(&self) -> HashMap<&str, SplitName> {
        let mut out = HashMap::new();
        for name in SplitName::ALL {
            for event in self.partition(name).events() {
                out.insert(event.event_id.as_str(), name);
            }
        }
        out
    }

    pub fn summary(&self) -> SplitSummary {
        SplitSummary {
            train_rows: self.train.len(),
            time_eval_rows: self.time_eval.len(),
            user_holdout_rows: self.user_holdout.len(),
            holdout_users: self.holdout_users.len(),
            boundary_ts: self.boundary_ts.to_rfc3339(),
        }
    }
}

pub fn holdout_user_count(n_users: usize, frac: f64) -> usize {
    if n_users == 0 {
        return 0;
    }
    let raw = (n_users as f64 * frac).round_ties_even();
    let raw = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };
    raw.clamp(1, n_users)
}

pub fn time_boundary(t_min: DateTime<Tz>, t_max: DateTime<Tz>, frac: f64) -> DateTime<Tz> {
    let span = t_max.signed_duration_since(t_min);
    let offset = match span.num_nanoseconds() {
        Some(ns) => TimeDelta::nanoseconds((ns as f64 * frac).round() as i64),
        None => TimeDelta::milliseconds((span.num_milliseconds() as f64 * frac).round() as i64),
    };
    t_min + offset
}

pub fn split_dataset<R: Rng + ?Sized>(
    table: &CanonicalTable,
    cfg: &SplitConfig,
    rng: &mut R,
) -> Result<SplitAssignment, SplitError> {
    cfg.validate()?;

    if table.is_empty() {
        let boundary_ts = Utc::now().with_timezone(&table.timezone());
        warn!(
            component = "splitter",
            event = "splitter.split.empty_input",
            table = table.name(),
            boundary_ts = %boundary_ts.to_rfc3339()
        );
        return Ok(SplitAssignment {
            train: table.clone(),
            time_eval: table.clone(),
            user_holdout: table.clone(),
            boundary_ts,
            holdout_users: BTreeSet::new(),
        });
    }

    table.require_columns(&["user_id", "event_ts"])?;

    let users: Vec<&str> = table
        .events()
        .iter()
        .map(|e| e.user_id.as_deref().unwrap_or(MISSING_KEY))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let k = holdout_user_count(users.len(), cfg.user_holdout_frac);
    let holdout_users: BTreeSet<String> = rand::seq::index::sample(rng, users.len(), k)
        .into_iter()
        .map(|i| users[i].to_string())
        .collect();

    let is_holdout = |user: Option<&str>| holdout_users.contains(user.unwrap_or(MISSING_KEY));
    let user_holdout = table.subset(|e| is_holdout(e.user_id.as_deref()));
    let remaining = table.subset(|e| !is_holdout(e.user_id.as_deref()));

    // Canonical order is time-first, so the extremes sit at both ends. With
    // every user held out there is no range and the boundary falls back to now.
    let boundary_ts = match (remaining.events().first(), remaining.events().last()) {
        (Some(first), Some(last)) => time_boundary(first.event_ts, last.event_ts, cfg.time_split),
        _ => Utc::now().with_timezone(&table.timezone()),
    };

    let train = remaining.subset(|e| e.event_ts < boundary_ts);
    let time_eval = remaining.subset(|e| e.event_ts >= boundary_ts);

    info!(
        component = "splitter",
        event = "splitter.split.finish",
        table = table.name(),
        users = users.len(),
        holdout_users = holdout_users.len(),
        train_rows = train.len(),
        time_eval_rows = time_eval.len(),
        user_holdout_rows = user_holdout.len(),
        boundary_ts = %boundary_ts.to_rfc3339()
    );

    Ok(SplitAssignment {
        train,
        time_eval,
        user_holdout,
        boundary_ts,
        holdout_users,
    })
}
