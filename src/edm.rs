//! Literal formatting for key predicates and synthesized filters.

use crate::error::ODataError;
use chrono::{DateTime, NaiveDate, SecondsFormat};
use serde_json::Value;

/// Write `value` as a URL literal of the declared primitive type.
/// `None` means the property is absent on the source, which is an error.
pub fn escape(value: Option<&Value>, type_name: Option<&str>) -> Result<String, ODataError> {
    let value = value.ok_or_else(|| ODataError::Literal("missing value".into()))?;
    let type_name = type_name.unwrap_or("");
    match value {
        Value::Null => Ok("null".into()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => {
            if type_name == "Edm.String" {
                Ok(quote(&n.to_string()))
            } else {
                Ok(n.to_string())
            }
        }
        Value::String(s) => escape_str(s, type_name),
        Value::Array(_) | Value::Object(_) => Err(ODataError::Literal(format!(
            "structured value cannot be a {} literal",
            if type_name.is_empty() { "key" } else { type_name }
        ))),
    }
}

fn escape_str(s: &str, type_name: &str) -> Result<String, ODataError> {
    match type_name {
        "Edm.Guid" => uuid::Uuid::parse_str(s)
            .map(|u| u.to_string())
            .map_err(|_| ODataError::Literal(format!("invalid guid '{}'", s))),
        "Edm.DateTimeOffset" => DateTime::parse_from_rfc3339(s)
            .map(|d| d.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            .map_err(|_| ODataError::Literal(format!("invalid datetime '{}'", s))),
        "Edm.Date" => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| d.format("%Y-%m-%d").to_string())
            .map_err(|_| ODataError::Literal(format!("invalid date '{}'", s))),
        "Edm.Binary" => Ok(format!("binary'{}'", s)),
        "Edm.Int16" | "Edm.Int32" | "Edm.Int64" | "Edm.Byte" | "Edm.SByte" | "Edm.Double"
        | "Edm.Single" | "Edm.Decimal" => {
            if s.parse::<f64>().is_ok() {
                Ok(s.to_string())
            } else {
                Err(ODataError::Literal(format!("invalid number '{}'", s)))
            }
        }
        _ => Ok(quote(s)),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_are_quoted_with_doubled_apostrophes() {
        assert_eq!(escape(Some(&json!("O'Neil")), Some("Edm.String")).unwrap(), "'O''Neil'");
        assert_eq!(escape(Some(&json!("plain")), None).unwrap(), "'plain'");
    }

    #[test]
    fn numbers_and_guids_are_bare() {
        assert_eq!(escape(Some(&json!(42)), Some("Edm.Int32")).unwrap(), "42");
        let id = "6f1c1c1e-8d0b-4a6e-9f43-0c3e8b2d9a11";
        assert_eq!(escape(Some(&json!(id)), Some("Edm.Guid")).unwrap(), id);
        assert!(escape(Some(&json!("nope")), Some("Edm.Guid")).is_err());
    }

    #[test]
    fn missing_and_structured_values_fail() {
        assert!(escape(None, Some("Edm.Int32")).is_err());
        assert!(escape(Some(&json!({"a": 1})), None).is_err());
    }
}
