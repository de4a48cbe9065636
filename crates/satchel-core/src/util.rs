//! Shared utility functions used across multiple modules.

use serde_json::Value;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read a timestamp stored either as unix milliseconds or as an RFC 3339 string.
///
/// Returns `None` for missing, null or unparseable values.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_timestamp_ms(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                chrono::DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|parsed| parsed.timestamp_millis())
            })
        }
        _ => None,
    }
}

/// Interpret a JSON value as a boolean flag (`true`, `1`, `"true"`, `"1"`).
pub fn value_is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ),
        _ => false,
    }
}

/// Format unix milliseconds as a UTC label.
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |datetime| datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn parse_timestamp_accepts_millis_and_rfc3339() {
        assert_eq!(
            parse_timestamp_ms(Some(&json!(1_700_000_000_000_i64))),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            parse_timestamp_ms(Some(&json!("1700000000000"))),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            parse_timestamp_ms(Some(&json!("1970-01-01T00:00:01Z"))),
            Some(1000)
        );
        assert_eq!(parse_timestamp_ms(Some(&json!("yesterday"))), None);
        assert_eq!(parse_timestamp_ms(Some(&Value::Null)), None);
        assert_eq!(parse_timestamp_ms(None), None);
    }

    #[test]
    fn truthy_values() {
        assert!(value_is_truthy(Some(&json!(true))));
        assert!(value_is_truthy(Some(&json!(1))));
        assert!(value_is_truthy(Some(&json!("true"))));
        assert!(!value_is_truthy(Some(&json!(0))));
        assert!(!value_is_truthy(None));
    }

    #[test]
    fn format_timestamp_returns_utc_label() {
        assert_eq!(format_timestamp_ms(0), "1970-01-01 00:00:00 UTC");
    }
}
