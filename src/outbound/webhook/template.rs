//! Sandboxed string templates for integration payloads.
//!
//! A template is literal text with `{{ ... }}` expressions. An expression is
//! a dotted variable path followed by zero or more filters:
//!
//! ```text
//! {{ event.case.title | upper }}
//! {{ timestamp | date:"[year]-[month]-[day]" }}
//! {{ event.case.owner | default:"unassigned" | json }}
//! ```
//!
//! Only variable lookup and the fixed filter set below are supported; there
//! are no loops, calls or side effects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated expression starting at byte {0}")]
    Unterminated(usize),

    #[error("empty expression at byte {0}")]
    EmptyExpression(usize),

    #[error("invalid variable path '{0}'")]
    InvalidPath(String),

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("filter '{filter}': {reason}")]
    FilterFailed { filter: String, reason: String },

    #[error("rendered {field} is invalid: {reason}")]
    InvalidOutput { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Expression),
}

#[derive(Debug, Clone, PartialEq)]
struct Expression {
    path: Vec<String>,
    filters: Vec<FilterCall>,
}

#[derive(Debug, Clone, PartialEq)]
struct FilterCall {
    name: String,
    arg: Option<String>,
}

const FILTERS: [&str; 6] = ["upper", "lower", "json", "default", "date", "truncate"];

/// A parsed template, ready to render against a variable namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;

            segments.push(Segment::Expr(parse_expression(
                &after_open[..end],
                offset + start,
            )?));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, namespace: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&evaluate(expr, namespace)?),
            }
        }
        Ok(out)
    }
}

/// Parse and render in one go.
pub fn render_str(source: &str, namespace: &Value) -> Result<String, TemplateError> {
    Template::parse(source)?.render(namespace)
}

fn parse_expression(raw: &str, position: usize) -> Result<Expression, TemplateError> {
    let mut parts = split_pipes(raw).into_iter();

    let path_src = parts.next().map(str::trim).unwrap_or_default();
    if path_src.is_empty() {
        return Err(TemplateError::EmptyExpression(position));
    }

    let path: Vec<String> = path_src.split('.').map(str::to_string).collect();
    let valid_segment = |s: &String| {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if !path.iter().all(valid_segment) {
        return Err(TemplateError::InvalidPath(path_src.to_string()));
    }

    let mut filters = Vec::new();
    for part in parts {
        let part = part.trim();
        let (name, arg) = match part.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(unquote(arg.trim()))),
            None => (part, None),
        };
        if !FILTERS.contains(&name) {
            return Err(TemplateError::UnknownFilter(name.to_string()));
        }
        filters.push(FilterCall {
            name: name.to_string(),
            arg,
        });
    }

    Ok(Expression { path, filters })
}

/// Split on `|` outside of double-quoted arguments.
fn split_pipes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '|' if !in_quotes => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn unquote(arg: &str) -> String {
    arg.strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
        .unwrap_or(arg)
        .to_string()
}

fn lookup<'a>(namespace: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(namespace, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn evaluate(expr: &Expression, namespace: &Value) -> Result<String, TemplateError> {
    let mut value = lookup(namespace, &expr.path).filter(|v| !v.is_null()).cloned();

    for filter in &expr.filters {
        value = Some(apply_filter(filter, value, &expr.path)?);
    }

    match value {
        Some(v) => Ok(display(&v)),
        None => Err(TemplateError::UndefinedVariable(expr.path.join("."))),
    }
}

fn apply_filter(
    filter: &FilterCall,
    value: Option<Value>,
    path: &[String],
) -> Result<Value, TemplateError> {
    if filter.name == "default" {
        return Ok(value.unwrap_or_else(|| Value::String(filter.arg.clone().unwrap_or_default())));
    }

    let value = value.ok_or_else(|| TemplateError::UndefinedVariable(path.join(".")))?;
    let failed = |reason: String| TemplateError::FilterFailed {
        filter: filter.name.clone(),
        reason,
    };

    match filter.name.as_str() {
        "upper" => Ok(Value::String(display(&value).to_uppercase())),
        "lower" => Ok(Value::String(display(&value).to_lowercase())),
        "json" => serde_json::to_string(&value)
            .map(Value::String)
            .map_err(|e| failed(e.to_string())),
        "truncate" => {
            let limit: usize = filter
                .arg
                .as_deref()
                .ok_or_else(|| failed("missing length argument".to_string()))?
                .parse()
                .map_err(|_| failed("length must be a non-negative integer".to_string()))?;
            Ok(Value::String(display(&value).chars().take(limit).collect()))
        }
        "date" => {
            let format = filter
                .arg
                .as_deref()
                .ok_or_else(|| failed("missing format argument".to_string()))?;
            let raw = value
                .as_str()
                .ok_or_else(|| failed("value is not an RFC 3339 string".to_string()))?;
            let parsed = OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| failed(e.to_string()))?;
            let description =
                time::format_description::parse_borrowed::<2>(format).map_err(|e| failed(e.to_string()))?;
            parsed
                .format(&description)
                .map(Value::String)
                .map_err(|e| failed(e.to_string()))
        }
        other => Err(TemplateError::UnknownFilter(other.to_string())),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A reusable integration template (chat, ticketing, SIEM, ...).
///
/// Overrides the default URL, method, headers and JSON envelope of the
/// subscription it is attached to. `config` is the fixed, user-supplied
/// namespace exposed to expressions as `config.*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    pub body: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

/// Output of rendering a [`WebhookTemplate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl WebhookTemplate {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Syntax check of every template string.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if let Some(url) = &self.url {
            Template::parse(url)?;
        }
        for value in self.headers.values() {
            Template::parse(value)?;
        }
        Template::parse(&self.body)?;
        Ok(())
    }

    /// Render all parts; any failure fails the whole render.
    pub fn render(&self, namespace: &Value) -> Result<RenderedTemplate, TemplateError> {
        let url = self
            .url
            .as_deref()
            .map(|u| render_str(u, namespace))
            .transpose()?;

        let mut headers = BTreeMap::new();
        for (name, value) in &self.headers {
            let rendered = render_str(value, namespace)?;
            if rendered.contains(['\r', '\n']) {
                return Err(TemplateError::InvalidOutput {
                    field: format!("header '{name}'"),
                    reason: "contains a line break".to_string(),
                });
            }
            headers.insert(name.clone(), rendered);
        }

        let body = render_str(&self.body, namespace)?;

        Ok(RenderedTemplate { url, headers, body })
    }
}
