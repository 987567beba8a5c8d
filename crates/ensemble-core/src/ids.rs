//! Date-scoped sequential identifiers such as `ERR-20260131-007`.

use chrono::{DateTime, Utc};

/// Next free id `<prefix>-YYYYMMDD-NNN` for the UTC date of `now`.
///
/// The sequence continues after the highest number already used that day,
/// so gaps left by removed records are never reused.
pub fn next_id<I, S>(prefix: &str, now: DateTime<Utc>, existing: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let stem = format!("{prefix}-{}-", now.format("%Y%m%d"));
    let next = existing
        .into_iter()
        .filter_map(|id| {
            id.as_ref()
                .strip_prefix(&stem)
                .and_then(|seq| seq.parse::<u32>().ok())
        })
        .max()
        .map_or(1, |highest| highest.saturating_add(1));
    format!("{stem}{next:03}")
}
