//! Trailing window tokens.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Window {
    pub label: String,
    pub duration: TimeDelta,
}

pub fn parse_window(raw: &str) -> Result<Window, ConfigError> {
    let token = raw.trim().to_ascii_lowercase();
    let invalid = || ConfigError::InvalidWindow(raw.to_string());

    let (digits, unit) = match token.char_indices().last() {
        Some((idx, unit @ ('h' | 'd'))) => (&token[..idx], unit),
        _ => return Err(invalid()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let n: i64 = digits.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }

    let duration = match unit {
        'h' => TimeDelta::try_hours(n),
        _ => TimeDelta::try_days(n),
    }
    .ok_or_else(invalid)?;

    Ok(Window {
        label: format!("{n}{unit}"),
        duration,
    })
}

pub fn parse_windows<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Window>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::EmptyWindows);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for token in raw {
        let window = parse_window(token.as_ref())?;
        if !seen.insert(window.label.clone()) {
            return Err(ConfigError::DuplicateWindow(window.label));
        }
        out.push(window);
    }
    Ok(out)
}

pub(crate) fn window_start(t: DateTime<Utc>, duration: TimeDelta) -> DateTime<Utc> {
    t.checked_sub_signed(duration).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
