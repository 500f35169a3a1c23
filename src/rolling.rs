//! Per-entity trailing-window counts and sums.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::EntityKey;
use crate::error::SchemaError;
use crate::events::CanonicalTable;
use crate::window::{window_start, Window};

#[derive(Debug, Clone, PartialEq)]
pub struct NumericColumn {
    pub name: String,
    pub values: Vec<f64>,
}

impl NumericColumn {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollingColumns {
    pub entity: EntityKey,
    pub window_label: String,
    pub attempt_cnt: Vec<f64>,
    pub sums: Vec<NumericColumn>,
}

impl RollingColumns {
    pub fn sum(&self, name: &str) -> Option<&[f64]> {
        self.sums
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_slice())
    }
}

/// `sum / count` when `count > 0`, else `0.0`. Never NaN or infinite.
pub fn safe_rate(sum: f64, count: f64) -> f64 {
    if count > 0.0 {
        let rate = sum / count;
        if rate.is_finite() {
            return rate;
        }
    }
    0.0
}

// Neumaier sum: rows leaving the window must not leave rounding residue.
#[derive(Debug, Clone, Copy, Default)]
struct CompensatedSum {
    sum: f64,
    comp: f64,
}

impl CompensatedSum {
    fn add(&mut self, x: f64) {
        let t = self.sum + x;
        if self.sum.abs() >= x.abs() {
            self.comp += (self.sum - t) + x;
        } else {
            self.comp += (x - t) + self.sum;
        }
        self.sum = t;
    }

    fn value(&self) -> f64 {
        self.sum + self.comp
    }
}

#[derive(Debug, Clone)]
struct RollingState {
    count: u64,
    sums: Vec<CompensatedSum>,
}

impl RollingState {
    fn new(width: usize) -> Self {
        Self {
            count: 0,
            sums: vec![CompensatedSum::default(); width],
        }
    }

    fn admit(&mut self, row: usize, signals: &[NumericColumn]) {
        self.count += 1;
        for (acc, signal) in self.sums.iter_mut().zip(signals) {
            acc.add(signal.values[row]);
        }
    }

    fn evict(&mut self, row: usize, signals: &[NumericColumn]) {
        self.count -= 1;
        for (acc, signal) in self.sums.iter_mut().zip(signals) {
            acc.add(-signal.values[row]);
        }
        if self.count == 0 {
            self.sums.fill(CompensatedSum::default());
        }
    }
}

pub fn rolling_aggregate(
    table: &CanonicalTable,
    entity: EntityKey,
    window: &Window,
    signals: &[NumericColumn],
    strict_past_only: bool,
) -> Result<RollingColumns, SchemaError> {
    for signal in signals {
        if signal.values.len() != table.len() {
            return Err(SchemaError::RowWidth {
                table: format!("{}:{}", table.name(), signal.name),
                expected: table.len(),
                found: signal.values.len(),
            });
        }
    }

    let groups = table.group_indices(entity)?;
    let events = table.events();

    let mut attempt_cnt = vec![0.0; table.len()];
    let mut sums: Vec<NumericColumn> = signals
        .iter()
        .map(|s| NumericColumn::new(s.name.clone(), vec![0.0; table.len()]))
        .collect();

    for rows in groups.values() {
        let ts: Vec<DateTime<Utc>> = rows
            .iter()
            .map(|&r| events[r].event_ts.with_timezone(&Utc))
            .collect();
        let mut state = RollingState::new(signals.len());
        let mut left = 0;
        let mut admitted = 0;
        let mut bucket_start = 0;

        while bucket_start < rows.len() {
            let t = ts[bucket_start];
            let bucket_end = bucket_start
                + ts[bucket_start..]
                    .iter()
                    .take_while(|x| **x == t)
                    .count();

            // Strict windows are [t - d, t); otherwise the whole bucket at t is visible.
            if !strict_past_only {
                while admitted < bucket_end {
                    state.admit(rows[admitted], signals);
                    admitted += 1;
                }
            }

            let lower = window_start(t, window.duration);
            while left < admitted && ts[left] < lower {
                state.evict(rows[left], signals);
                left += 1;
            }

            for &row in &rows[bucket_start..bucket_end] {
                attempt_cnt[row] = state.count as f64;
                for (out, acc) in sums.iter_mut().zip(&state.sums) {
                    out.values[row] = acc.value();
                }
            }

            while admitted < bucket_end {
                state.admit(rows[admitted], signals);
                admitted += 1;
            }
            bucket_start = bucket_end;
        }
    }

    debug!(
        component = "rolling",
        event = "rolling.aggregate.finish",
        entity = entity.as_str(),
        window = %window.label,
        strict_past_only,
        groups = groups.len(),
        rows = table.len(),
        signals = signals.len()
    );

    Ok(RollingColumns {
        entity,
        window_label: window.label.clone(),
        attempt_cnt,
        sums,
    })
}
