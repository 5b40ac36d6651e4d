//! Helpers for reading and writing response/request bodies.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ErrorInfo;

/// Deserialize a response body, classifying failures as `Malformed`.
pub fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ErrorInfo> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "failed to parse response body");
        ErrorInfo::malformed(format!("invalid JSON: {e}"))
    })
}

/// Deserialize an already-parsed JSON value.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(value).map_err(|e| {
        tracing::warn!(error = %e, "unexpected response shape");
        ErrorInfo::malformed(format!("unexpected response shape: {e}"))
    })
}

pub fn json_body(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// `application/x-www-form-urlencoded` body.
pub fn form_body(pairs: &[(&str, &str)]) -> Vec<u8> {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
        .into_bytes()
}

/// Parse the date part of `YYYY-MM-DD`, `YYYY-MM` or a full timestamp.
///
/// Partial dates are filled with the first month/day.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    let date_part = s.get(..10).unwrap_or(s);
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(date);
    }
    let mut parts = s.split('-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next().and_then(|m| m.parse().ok()).unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_body_encodes() {
        let body = form_body(&[("grant_type", "password"), ("password", "a b&c")]);
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "grant_type=password&password=a+b%26c"
        );
    }

    #[test]
    fn test_parse_date_variants() {
        let d = NaiveDate::from_ymd_opt(2023, 9, 29);
        assert_eq!(parse_date("2023-09-29"), d);
        assert_eq!(parse_date("2023-09-29T00:00:00.000Z"), d);
        assert_eq!(parse_date("2023-09"), NaiveDate::from_ymd_opt(2023, 9, 1));
        assert_eq!(parse_date("2023"), NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse::<Value>(b"<html>").unwrap_err();
        assert!(err.is(crate::error::ErrorClass::Malformed));
    }
}
