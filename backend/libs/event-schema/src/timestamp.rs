use chrono::{DateTime, Utc};
use serde_json::Value;

/// Parse a captured timestamp column.
///
/// The connector emits RFC3339 strings or epoch integers depending on the
/// column type and its `time.precision.mode`. Integers are interpreted by
/// magnitude: seconds, milliseconds, then microseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // timestamp without time zone, e.g. "2024-05-18T12:34:56.123456"
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(num) => {
            let raw = num.as_i64()?;
            let magnitude = raw.unsigned_abs();
            if magnitude < 100_000_000_000 {
                DateTime::<Utc>::from_timestamp(raw, 0)
            } else if magnitude < 100_000_000_000_000 {
                DateTime::<Utc>::from_timestamp_millis(raw)
            } else {
                DateTime::<Utc>::from_timestamp_micros(raw)
            }
        }
        _ => None,
    }
}
