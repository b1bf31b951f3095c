//! Timestamp parsing and formatting.
//!
//! Workers and documents carry timestamps as text in several shapes: RFC 3339
//! with `Z` or an explicit offset, naive ISO timestamps (taken as UTC), and the
//! human form `YYYY-mm-dd HH:MM:SS MSK`. Everything is normalized to
//! `DateTime<Utc>` on the way in and written back as RFC 3339 with a `+00:00`
//! offset.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

/// Offset of the `MSK` suffix and the default display zone.
pub const MSK_OFFSET_SECS: i32 = 3 * 3600;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"];

/// The fixed display zone used for hour labels (UTC+3).
pub fn msk() -> FixedOffset {
    FixedOffset::east_opt(MSK_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Parse a permissively encoded timestamp.
///
/// Returns `None` for blank or unparsable input; callers drop the owning
/// record rather than guess a time.
///
/// # Example
///
/// ```rust
/// use pulsewatch_types::parse_timestamp;
///
/// let a = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
/// let b = parse_timestamp("2024-05-01 13:00:00 MSK").unwrap();
/// let c = parse_timestamp("2024-05-01T10:00:00").unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a, c);
/// assert!(parse_timestamp("yesterday").is_none());
/// ```
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(base) = value.strip_suffix(" MSK") {
        let naive = NaiveDateTime::parse_from_str(base.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
        return msk()
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc));
    }

    let owned;
    let value = match value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        Some(base) => {
            owned = format!("{base}+00:00");
            owned.as_str()
        }
        None => value,
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a timestamp held in an arbitrary JSON value.
///
/// Only strings are considered; anything else is unknown.
pub fn parse_timestamp_value(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value.and_then(|v| v.as_str()).and_then(parse_timestamp)
}

/// Format a timestamp the way every persisted record stores it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

/// Format `start..end` as `HH:MM–HH:MM` in the given display zone.
pub fn format_hour_range(start: DateTime<Utc>, end: DateTime<Utc>, zone: &FixedOffset) -> String {
    format!(
        "{}–{}",
        start.with_timezone(zone).format("%H:%M"),
        end.with_timezone(zone).format("%H:%M")
    )
}

/// Resolve a post publish time from a scraped `dateTime` field.
///
/// The field is either a plain string or an object carrying `raw`, `msk`, or
/// `msk_human`, tried in that order.
pub fn parse_post_time(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let raw = match value? {
        serde_json::Value::Object(map) => ["raw", "msk", "msk_human"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())?
            .to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    parse_timestamp(&raw)
}

/// Serde adapter for optional timestamps that never fails.
///
/// Unparsable or non-string values deserialize as `None`; `None` serializes as
/// an empty string so older readers still see the key.
pub mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => s.serialize_str(&super::format_timestamp(*ts)),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        Ok(super::parse_timestamp_value(Some(&value)))
    }
}
