//! Compact human-readable durations: `3d2h1m`, `90s`, `500ms`.

use std::time::Duration;

use crate::error::DurationError;

const UNITS: &[(&str, u64)] = &[
    ("d", 86_400_000),
    ("h", 3_600_000),
    ("m", 60_000),
    ("s", 1_000),
    ("ms", 1),
];

/// Parse a duration string into a [`Duration`].
///
/// Supports components `Xd`, `Xh`, `Xm`, `Xs` and `Xms`, combinable
/// in any order ("2h30m", "1d12h", "1s500ms"). A bare number with no unit at
/// all is read as seconds ("90" == "90s").
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let overflow = || DurationError::Overflow(s.to_string());
    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }

        let mut unit = ch.to_string();
        if ch == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let factor = UNITS
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, f)| *f)
            .ok_or_else(|| DurationError::UnknownUnit {
                input: s.to_string(),
                unit: unit.clone(),
            })?;

        if num_buf.is_empty() {
            return Err(DurationError::MissingNumber(s.to_string()));
        }
        let n: u64 = num_buf.parse().map_err(|_| overflow())?;
        num_buf.clear();
        total_ms = n
            .checked_mul(factor)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(overflow)?;
        found_unit = true;
    }

    if !num_buf.is_empty() {
        if found_unit {
            // "30m15" is ambiguous.
            return Err(DurationError::TrailingNumber(s.to_string()));
        }
        let n: u64 = num_buf.parse().map_err(|_| overflow())?;
        total_ms = n.checked_mul(1_000).ok_or_else(overflow)?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Canonical compact form, largest unit first. Sub-millisecond precision is
/// dropped; zero formats as `0s`.
pub fn format_duration(d: Duration) -> String {
    let mut remaining = d.as_millis();
    if remaining == 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, factor) in UNITS {
        let factor = *factor as u128;
        let n = remaining / factor;
        if n > 0 {
            out.push_str(&n.to_string());
            out.push_str(unit);
            remaining -= n * factor;
        }
    }
    out
}
