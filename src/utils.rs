use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

pub fn now_ms() -> i64 {
    (now_ts() * 1000.0) as i64
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
];

/// Permissive date-string parser returning epoch milliseconds.
///
/// Accepts RFC 3339, RFC 2822, the common ISO-ish layouts with or without a
/// time part, month-name dates and `YYYY-MM`. Naive values are read as UTC.
/// Bare numbers are never dates.
pub fn parse_date_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() || s.parse::<f64>().is_ok() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc().timestamp_millis());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc().timestamp_millis());
        }
    }
    // YYYY-MM
    if s.len() == 7 && s.as_bytes()[4] == b'-' {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc().timestamp_millis());
        }
    }
    None
}

pub fn is_date_like(v: &JsonValue) -> bool {
    match v {
        JsonValue::String(s) => parse_date_ms(s).is_some(),
        _ => false,
    }
}

/// Numeric view of a JSON value: finite numbers, or strings holding one.
pub fn parse_number(v: &JsonValue) -> Option<f64> {
    match v {
        JsonValue::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        JsonValue::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return None;
            }
            t.parse::<f64>().ok().filter(|x| x.is_finite())
        }
        _ => None,
    }
}

pub fn parse_number_opt(v: Option<&JsonValue>) -> Option<f64> {
    v.and_then(parse_number)
}

/// First of `keys` present on `obj` with a non-null value.
pub fn first_present<'a>(obj: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    let map = obj.as_object()?;
    keys.iter().find_map(|k| map.get(*k).filter(|v| !v.is_null()))
}

pub fn iso_from_ms(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Loose truthiness used when routing socket frames.
pub fn is_truthy(v: &JsonValue) -> bool {
    match v {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|x| x != 0.0 && !x.is_nan()).unwrap_or(true),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date_ms("2024-01-01").is_some());
        assert!(parse_date_ms("2024-01-01T10:30:00Z").is_some());
        assert!(parse_date_ms("2024-01-01 10:30:00").is_some());
        assert!(parse_date_ms("Tue, 02 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date_ms("Jan 2, 2024").is_some());
        assert!(parse_date_ms("2024-03").is_some());
        assert_eq!(
            parse_date_ms("2024-01-02").unwrap() - parse_date_ms("2024-01-01").unwrap(),
            86_400_000
        );
    }

    #[test]
    fn test_parse_date_rejects_numbers_and_words() {
        assert!(parse_date_ms("101.5").is_none());
        assert!(parse_date_ms("2024").is_none());
        assert!(parse_date_ms("").is_none());
        assert!(parse_date_ms("AAPL").is_none());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(&json!(1.5)), Some(1.5));
        assert_eq!(parse_number(&json!(" 101.5 ")), Some(101.5));
        assert_eq!(parse_number(&json!("")), None);
        assert_eq!(parse_number(&json!("NaN")), None);
        assert_eq!(parse_number(&json!("abc")), None);
        assert_eq!(parse_number(&json!(true)), None);
        assert_eq!(parse_number(&JsonValue::Null), None);
    }

    #[test]
    fn test_first_present_skips_null() {
        let v = json!({"price": null, "value": 3});
        assert_eq!(first_present(&v, &["price", "value", "last"]), Some(&json!(3)));
        assert_eq!(first_present(&json!(1), &["price"]), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!(7)));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_iso_from_ms() {
        assert_eq!(iso_from_ms(0).as_deref(), Some("1970-01-01T00:00:00.000Z"));
    }
}
