//! Human-readable durations like `"500ms"`, `"5s"`, `"2m"`, `"1h"`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a duration string.
///
/// Supported formats:
/// - `"Nms"` - N milliseconds
/// - `"Ns"` - N seconds
/// - `"Nm"` - N minutes
/// - `"Nh"` - N hours
/// - `"N"` - N seconds
///
/// Returns `None` if the string cannot be parsed.
///
/// ```
/// use service_orchestration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
/// ```
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (digits, unit_ms): (&str, u64) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    digits
        .parse::<u64>()
        .ok()?
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
}

/// Render a duration the way [`parse_duration`] reads it back
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

/// `#[serde(with = "duration::serde_str")]` for `Duration` fields
pub mod serde_str {
    use super::*;

    /// Serialize as `"5s"` / `"500ms"`
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    /// Accept a duration string or a bare number of seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(d)? {
            RawDuration::Seconds(n) => Ok(Duration::from_secs(n)),
            RawDuration::Text(s) => parse_duration(&s).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "invalid duration '{s}', expected e.g. 500ms, 5s, 2m, 1h"
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(parse_duration("1.5s"), None);
    }

    #[test]
    fn test_format() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_serde_accepts_number_and_string() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(with = "serde_str")]
            d: Duration,
        }

        let h: Holder = serde_json::from_str(r#"{"d": 7}"#).unwrap();
        assert_eq!(h.d, Duration::from_secs(7));
        let h: Holder = serde_json::from_str(r#"{"d": "250ms"}"#).unwrap();
        assert_eq!(h.d, Duration::from_millis(250));
        assert!(serde_json::from_str::<Holder>(r#"{"d": "soon"}"#).is_err());
    }
}
