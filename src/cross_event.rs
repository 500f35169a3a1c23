//! Windowed sums of a secondary event stream aligned onto a primary stream.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::EntityKey;
use crate::error::SchemaError;
use crate::events::{CanonicalTable, MISSING_KEY};
use crate::rolling::NumericColumn;
use crate::window::{window_start, Window};

#[derive(Debug)]
struct SecondaryGroup {
    ts: Vec<DateTime<Utc>>,
    cumsums: Vec<Vec<f64>>,
}

impl SecondaryGroup {
    fn build(table: &CanonicalTable, rows: &[usize], signals: &[NumericColumn]) -> Self {
        let events = table.events();
        let ts = rows
            .iter()
            .map(|&r| events[r].event_ts.with_timezone(&Utc))
            .collect();
        let cumsums = signals
            .iter()
            .map(|signal| {
                let mut acc = Vec::with_capacity(rows.len() + 1);
                acc.push(0.0);
                let mut running = 0.0;
                for &r in rows {
                    running += signal.values[r];
                    acc.push(running);
                }
                acc
            })
            .collect();
        Self { ts, cumsums }
    }

    /// Half-open index range of secondary rows with `ts` in `[lower, t)`.
    fn range(&self, lower: DateTime<Utc>, t: DateTime<Utc>) -> (usize, usize) {
        let right = self.ts.partition_point(|x| *x < t);
        let left = self.ts.partition_point(|x| *x < lower);
        (left, right.max(left))
    }
}

pub fn cross_event_window_sums(
    primary: &CanonicalTable,
    secondary: &CanonicalTable,
    entity: EntityKey,
    signals: &[NumericColumn],
    window: &Window,
) -> Result<Vec<NumericColumn>, SchemaError> {
    primary.require_columns(&[entity.column()])?;
    for signal in signals {
        if signal.values.len() != secondary.len() {
            return Err(SchemaError::RowWidth {
                table: format!("{}:{}", secondary.name(), signal.name),
                expected: secondary.len(),
                found: signal.values.len(),
            });
        }
    }

    let groups: BTreeMap<String, SecondaryGroup> = secondary
        .group_indices(entity)?
        .into_iter()
        .map(|(key, rows)| (key, SecondaryGroup::build(secondary, &rows, signals)))
        .collect();

    let mut out: Vec<NumericColumn> = signals
        .iter()
        .map(|s| NumericColumn::new(s.name.clone(), vec![0.0; primary.len()]))
        .collect();

    let mut matched_rows = 0_usize;
    for (row, event) in primary.events().iter().enumerate() {
        let key = event.entity(entity).unwrap_or(MISSING_KEY);
        let Some(group) = groups.get(key) else {
            continue;
        };

        let t = event.event_ts.with_timezone(&Utc);
        let (left, right) = group.range(window_start(t, window.duration), t);
        if right > left {
            matched_rows += 1;
        }
        for (column, cumsum) in out.iter_mut().zip(&group.cumsums) {
            column.values[row] = cumsum[right] - cumsum[left];
        }
    }

    debug!(
        component = "cross_event",
        event = "cross_event.window_sums.finish",
        primary = primary.name(),
        secondary = secondary.name(),
        entity = entity.as_str(),
        window = %window.label,
        secondary_groups = groups.len(),
        matched_rows
    );

    Ok(out)
}
