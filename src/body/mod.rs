//! Body parsing middleware and declarative request validation.
//!
//! Parsers materialise `ctx.state[state_keys::BODY]` as a parsed
//! [`serde_json::Value`] when the request's `Content-Type` matches, and pass
//! through untouched otherwise. [`validate`] then checks an arbitrary JSON
//! value against a [`Schema`], aggregating every violation instead of
//! failing on the first one.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::context::{state_keys, Context, StateValue};
use crate::error::TypedError;

/// One declarative field rule.
#[derive(Debug, Clone)]
pub enum Rule {
    RequiredString { min_length: Option<usize>, max_length: Option<usize>, pattern: Option<String> },
    OptionalString { min_length: Option<usize>, max_length: Option<usize>, pattern: Option<String> },
    RequiredNumber { min: Option<f64>, max: Option<f64>, integer: bool },
    RequiredBoolean,
    RequiredEmail,
    RequiredUrl,
    RequiredEnum { values: Vec<String> },
    RequiredArray { min_items: Option<usize>, max_items: Option<usize>, item_rule: Option<Box<Rule>> },
}

impl Rule {
    pub fn required_string() -> Self {
        Rule::RequiredString { min_length: None, max_length: None, pattern: None }
    }

    pub fn min_length(mut self, n: usize) -> Self {
        match &mut self {
            Rule::RequiredString { min_length, .. } | Rule::OptionalString { min_length, .. } => {
                *min_length = Some(n);
            }
            _ => {}
        }
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        match &mut self {
            Rule::RequiredString { max_length, .. } | Rule::OptionalString { max_length, .. } => {
                *max_length = Some(n);
            }
            _ => {}
        }
        self
    }
}

/// A schema is a mapping from field name to [`Rule`].
pub type Schema = HashMap<String, Rule>;

/// Builds a [`Schema`] from `(field, rule)` pairs.
pub fn schema(fields: impl IntoIterator<Item = (&'static str, Rule)>) -> Schema {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[^\s]+$").unwrap())
}

/// Runs every field's rule against `value`, collecting *all* violations.
///
/// Missing required fields, wrong types, and rule violations each produce
/// one [`crate::error::ValidationDetail`] entry.
pub fn validate(value: &Value, schema: &Schema) -> Vec<crate::error::ValidationDetail> {
    let mut errors = Vec::new();
    let obj = value.as_object();

    for (field, rule) in schema {
        let field_value = obj.and_then(|o| o.get(field));
        validate_field(field, field_value, rule, &mut errors);
    }

    errors
}

fn validate_field(
    field: &str,
    value: Option<&Value>,
    rule: &Rule,
    errors: &mut Vec<crate::error::ValidationDetail>,
) {
    let push = |errors: &mut Vec<crate::error::ValidationDetail>, message: String, value: &Value| {
        errors.push(crate::error::ValidationDetail {
            field: field.to_string(),
            message,
            value: value.clone(),
        });
    };

    match rule {
        Rule::OptionalString { min_length, max_length, pattern } => {
            let Some(v) = value else { return };
            if v.is_null() {
                return;
            }
            validate_string_rule(field, v, *min_length, *max_length, pattern.as_deref(), errors);
        }
        Rule::RequiredString { min_length, max_length, pattern } => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            validate_string_rule(field, v, *min_length, *max_length, pattern.as_deref(), errors);
        }
        Rule::RequiredNumber { min, max, integer } => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            let Some(n) = v.as_f64() else {
                push(errors, format!("{field}: expected a number"), v);
                return;
            };
            if *integer && n.fract() != 0.0 {
                push(errors, format!("{field}: must be an integer"), v);
            }
            if let Some(min) = min {
                if n < *min {
                    push(errors, format!("{field}: minimum value {min}"), v);
                }
            }
            if let Some(max) = max {
                if n > *max {
                    push(errors, format!("{field}: maximum value {max}"), v);
                }
            }
        }
        Rule::RequiredBoolean => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            if !v.is_boolean() {
                push(errors, format!("{field}: expected a boolean"), v);
            }
        }
        Rule::RequiredEmail => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            match v.as_str() {
                Some(s) if email_re().is_match(s) => {}
                _ => push(errors, format!("{field}: invalid email address"), v),
            }
        }
        Rule::RequiredUrl => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            match v.as_str() {
                Some(s) if url_re().is_match(s) => {}
                _ => push(errors, format!("{field}: invalid URL"), v),
            }
        }
        Rule::RequiredEnum { values } => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            match v.as_str() {
                Some(s) if values.iter().any(|allowed| allowed == s) => {}
                _ => push(
                    errors,
                    format!("{field}: must be one of {}", values.join(", ")),
                    v,
                ),
            }
        }
        Rule::RequiredArray { min_items, max_items, item_rule } => {
            let Some(v) = value.filter(|v| !v.is_null()) else {
                push(errors, format!("{field} is required"), &Value::Null);
                return;
            };
            let Some(items) = v.as_array() else {
                push(errors, format!("{field}: expected an array"), v);
                return;
            };
            if let Some(min) = min_items {
                if items.len() < *min {
                    push(errors, format!("{field}: minimum {min} item(s)"), v);
                }
            }
            if let Some(max) = max_items {
                if items.len() > *max {
                    push(errors, format!("{field}: maximum {max} item(s)"), v);
                }
            }
            if let Some(item_rule) = item_rule {
                for (i, item) in items.iter().enumerate() {
                    validate_field(&format!("{field}[{i}]"), Some(item), item_rule, errors);
                }
            }
        }
    }
}

fn validate_string_rule(
    field: &str,
    value: &Value,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<&str>,
    errors: &mut Vec<crate::error::ValidationDetail>,
) {
    let Some(s) = value.as_str() else {
        errors.push(crate::error::ValidationDetail {
            field: field.to_string(),
            message: format!("{field}: expected a string"),
            value: value.clone(),
        });
        return;
    };
    if let Some(min) = min_length {
        if s.len() < min {
            errors.push(crate::error::ValidationDetail {
                field: field.to_string(),
                message: format!("{field}: minimum length {min}"),
                value: value.clone(),
            });
        }
    }
    if let Some(max) = max_length {
        if s.len() > max {
            errors.push(crate::error::ValidationDetail {
                field: field.to_string(),
                message: format!("{field}: maximum length {max}"),
                value: value.clone(),
            });
        }
    }
    if let Some(pattern) = pattern {
        if let Ok(re) = Regex::new(pattern) {
            if !re.is_match(s) {
                errors.push(crate::error::ValidationDetail {
                    field: field.to_string(),
                    message: format!("{field}: does not match required pattern"),
                    value: value.clone(),
                });
            }
        }
    }
}

/// Parses the raw request body according to `Content-Type` and stashes the
/// result as `ctx.state[state_keys::BODY]`. Unrecognised content types pass
/// through untouched.
///
/// Returns a [`TypedError::Validation`] (field `"body"`) on parse failure.
pub fn parse_body(ctx: &mut Context) -> Result<(), TypedError> {
    let content_type = ctx
        .request()
        .headers()
        .get("content-type")
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let raw = ctx.request().body();
    if raw.is_empty() {
        return Ok(());
    }

    let parsed = match content_type.as_str() {
        "application/json" => serde_json::from_slice::<Value>(raw)
            .map_err(|e| TypedError::validation("body", e.to_string()))?,
        "application/x-www-form-urlencoded" => {
            let text = std::str::from_utf8(raw).map_err(|_| TypedError::validation("body", "invalid utf-8"))?;
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_str(text).map_err(|e| TypedError::validation("body", e.to_string()))?;
            Value::Object(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        }
        ct if ct.starts_with("multipart/form-data") => parse_multipart(raw, &content_type)?,
        "text/plain" => Value::String(
            std::str::from_utf8(raw)
                .map_err(|_| TypedError::validation("body", "invalid utf-8"))?
                .to_string(),
        ),
        _ => return Ok(()),
    };

    ctx.state_mut()
        .insert(state_keys::BODY.to_string(), StateValue::Json(parsed));
    Ok(())
}

/// One part of a parsed multipart body.
#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

fn parse_multipart(raw: &[u8], content_type: &str) -> Result<Value, TypedError> {
    let boundary = content_type
        .split(';')
        .find_map(|part| part.trim().strip_prefix("boundary="))
        .ok_or_else(|| TypedError::validation("body", "missing multipart boundary"))?
        .trim_matches('"');
    let delimiter = format!("--{boundary}").into_bytes();

    let mut fields = Vec::new();
    for chunk in split_on(raw, &delimiter) {
        if chunk.is_empty() || chunk == b"--\r\n" || chunk == b"--" {
            continue;
        }
        if let Some(field) = parse_multipart_part(chunk) {
            fields.push(field);
        }
    }

    Ok(Value::Array(
        fields
            .into_iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "filename": f.filename,
                    "contentType": f.content_type,
                    "bytes": f.bytes,
                })
            })
            .collect(),
    ))
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find_subslice(rest, needle) {
        out.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push(rest);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_multipart_part(part: &[u8]) -> Option<MultipartField> {
    let separator = b"\r\n\r\n";
    let header_end = find_subslice(part, separator)?;
    let header_bytes = &part[..header_end];
    let mut body = &part[header_end + separator.len()..];
    if body.ends_with(b"\r\n") {
        body = &body[..body.len() - 2];
    }

    let headers = std::str::from_utf8(header_bytes).ok()?;
    let disposition = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))?;
    let name = extract_quoted(disposition, "name=")?;
    let filename = extract_quoted(disposition, "filename=");
    let content_type = headers
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-type"))
        .and_then(|l| l.split(':').nth(1))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Some(MultipartField {
        name,
        filename,
        content_type,
        bytes: body.to_vec(),
    })
}

fn extract_quoted(haystack: &str, key: &str) -> Option<String> {
    let idx = haystack.find(key)? + key.len();
    let rest = &haystack[idx..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn ctx_with_json(json: &str) -> Context {
        let raw = format!(
            "POST /x HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{json}",
            json.len()
        );
        Context::new(Request::parse(raw.as_bytes()).unwrap().0)
    }

    #[test]
    fn parses_json_body_into_state() {
        let mut ctx = ctx_with_json(r#"{"title":"buy milk"}"#);
        parse_body(&mut ctx).unwrap();
        let body = ctx.state().get(state_keys::BODY).unwrap().as_json().unwrap();
        assert_eq!(body["title"], "buy milk");
    }

    #[test]
    fn invalid_json_is_validation_error() {
        let mut ctx = ctx_with_json("{not json");
        let err = parse_body(&mut ctx).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::Validation { .. }));
    }

    #[test]
    fn required_string_missing_and_too_short_both_reported() {
        let schema = schema([("title", Rule::required_string().min_length(1).max_length(100))]);
        let errors = validate(&serde_json::json!({"title": ""}), &schema);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "title: minimum length 1");
    }

    #[test]
    fn aggregates_all_errors_not_fail_fast() {
        let schema = schema([
            ("title", Rule::required_string().min_length(1)),
            ("age", Rule::RequiredNumber { min: Some(0.0), max: None, integer: true }),
        ]);
        let errors = validate(&serde_json::json!({}), &schema);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn email_rule_rejects_malformed_address() {
        let schema = schema([("email", Rule::RequiredEmail)]);
        let errors = validate(&serde_json::json!({"email": "not-an-email"}), &schema);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn enum_rule_accepts_listed_value() {
        let schema = schema([(
            "status",
            Rule::RequiredEnum { values: vec!["open".to_string(), "closed".to_string()] },
        )]);
        let errors = validate(&serde_json::json!({"status": "open"}), &schema);
        assert!(errors.is_empty());
    }
}
