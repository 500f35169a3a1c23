//! Distinct-value counts over a trailing window, strict past-only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::EntityKey;
use crate::error::SchemaError;
use crate::events::CanonicalTable;
use crate::window::{window_start, Window};

#[derive(Debug, Default)]
struct DedupWindowState<'a> {
    left: usize,
    counts: HashMap<&'a str, usize>,
}

impl<'a> DedupWindowState<'a> {
    fn insert(&mut self, value: &'a str) {
        *self.counts.entry(value).or_insert(0) += 1;
    }

    fn remove(&mut self, value: &'a str) {
        if let Some(count) = self.counts.get_mut(value) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(value);
            }
        }
    }

    fn distinct(&self) -> usize {
        self.counts.len()
    }
}

pub fn unique_count_window(
    table: &CanonicalTable,
    entity: EntityKey,
    value_column: &str,
    window: &Window,
) -> Result<Vec<u64>, SchemaError> {
    let groups = table.group_indices(entity)?;
    let values = table.key_column(value_column)?;
    let events = table.events();
    let mut out = vec![0_u64; table.len()];

    for rows in groups.values() {
        let ts: Vec<DateTime<Utc>> = rows
            .iter()
            .map(|&r| events[r].event_ts.with_timezone(&Utc))
            .collect();
        let mut state = DedupWindowState::default();
        let mut bucket_start = 0;

        while bucket_start < rows.len() {
            let t = ts[bucket_start];
            let mut bucket_end = bucket_start;
            while bucket_end < rows.len() && ts[bucket_end] == t {
                bucket_end += 1;
            }

            // Expire ts <= t - d, record, then insert the bucket.
            let expire_upto = window_start(t, window.duration);
            while state.left < bucket_start && ts[state.left] <= expire_upto {
                state.remove(&values[rows[state.left]]);
                state.left += 1;
            }

            let distinct = state.distinct() as u64;
            for &row in &rows[bucket_start..bucket_end] {
                out[row] = distinct;
            }

            for &row in &rows[bucket_start..bucket_end] {
                state.insert(&values[row]);
            }
            bucket_start = bucket_end;
        }
    }

    debug!(
        component = "dedup",
        event = "dedup.unique_count.finish",
        entity = entity.as_str(),
        value_column,
        window = %window.label,
        groups = groups.len(),
        rows = table.len()
    );

    Ok(out)
}
