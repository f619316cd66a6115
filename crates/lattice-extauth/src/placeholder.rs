//! Placeholder resolution over the evaluation context
//!
//! Templates use minijinja's default `{{ ... }}` variable syntax, evaluated
//! against the serialized authorization JSON:
//! - `{{ context.request.http.path }}` - request attributes
//! - `{{ auth.identity.sub }}` - identity phase output
//! - `{{ auth.metadata.user-info.email }}` - metadata by evaluator name
//!
//! Lookups of absent paths resolve to an absent value: empty text inside a
//! larger string, `null` when the placeholder is the whole value.
//! Objects and arrays interpolated into text are written as JSON.

use std::fmt::Write as _;
use std::sync::LazyLock;

use minijinja::value::ValueKind;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;

use crate::error::{ExtAuthError, Result};

static ENGINE: LazyLock<PlaceholderEngine> = LazyLock::new(PlaceholderEngine::new);

/// Template engine for `{{ path }}` placeholders
pub struct PlaceholderEngine {
    env: Environment<'static>,
}

impl Default for PlaceholderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderEngine {
    /// Create a new engine
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_formatter(|out, state, value| match value.kind() {
            ValueKind::Map | ValueKind::Seq => {
                let json = serde_json::to_string(value).map_err(|e| {
                    minijinja::Error::new(ErrorKind::BadSerialization, e.to_string())
                })?;
                out.write_str(&json)
                    .map_err(|e| minijinja::Error::new(ErrorKind::WriteFailure, e.to_string()))
            }
            ValueKind::None => out
                .write_str("null")
                .map_err(|e| minijinja::Error::new(ErrorKind::WriteFailure, e.to_string())),
            _ => minijinja::escape_formatter(out, state, value),
        });

        Self { env }
    }

    /// Shared process-wide engine
    pub fn global() -> &'static Self {
        &ENGINE
    }

    /// Check if a string contains any placeholder syntax
    pub fn has_placeholder(s: &str) -> bool {
        s.contains("{{")
    }

    /// Render a template string against the given context document
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String> {
        if !Self::has_placeholder(template) {
            return Ok(template.to_string());
        }

        let normalized = normalize_template_identifiers(template);
        self.env
            .render_str(&normalized, minijinja::Value::from_serialize(ctx))
            .map_err(|e| ExtAuthError::template(e.to_string()))
    }

    /// Resolve a JSON value template
    ///
    /// Strings that consist of exactly one placeholder resolve to the typed
    /// value found at that path. Other strings are rendered as text. Objects
    /// and arrays are resolved recursively.
    pub fn resolve(&self, template: &Value, ctx: &Value) -> Result<Value> {
        match template {
            Value::String(s) => match whole_placeholder(s) {
                Some(expression) => self.evaluate(expression, ctx),
                None => self.render(s, ctx).map(Value::String),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut resolved = serde_json::Map::with_capacity(fields.len());
                for (key, value) in fields {
                    resolved.insert(key.clone(), self.resolve(value, ctx)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a bare expression (no delimiters) to a typed value
    pub fn evaluate(&self, expression: &str, ctx: &Value) -> Result<Value> {
        let normalized = normalize_expression(expression.trim());
        let compiled = self
            .env
            .compile_expression(&normalized)
            .map_err(|e| ExtAuthError::template(e.to_string()))?;
        let value = compiled
            .eval(minijinja::Value::from_serialize(ctx))
            .map_err(|e| ExtAuthError::template(e.to_string()))?;

        if value.is_undefined() {
            return Ok(Value::Null);
        }
        serde_json::to_value(&value).map_err(|e| ExtAuthError::template(e.to_string()))
    }
}

/// Return the inner expression if `s` is exactly one `{{ ... }}` placeholder
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

/// Rewrite hyphenated path segments inside every `{{ ... }}` block.
fn normalize_template_identifiers(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("{{") {
        result.push_str(&remaining[..start + 2]);
        remaining = &remaining[start + 2..];

        if let Some(end) = remaining.find("}}") {
            result.push_str(&normalize_expression(&remaining[..end]));
            result.push_str("}}");
            remaining = &remaining[end + 2..];
        } else {
            result.push_str(remaining);
            remaining = "";
        }
    }

    result.push_str(remaining);
    result
}

/// Turn `.user-info` into `["user-info"]` so minijinja reads a key lookup
/// instead of a subtraction. Quoted strings are left alone.
fn normalize_expression(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut result = String::with_capacity(expr.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if let Some(q) = quote {
            result.push(ch);
            if ch == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                result.push(ch);
                i += 1;
            }
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_segment_char(&chars, end) {
                    end += 1;
                }
                let segment: String = chars[start..end].iter().collect();
                if segment.contains('-') {
                    let _ = write!(result, "[\"{}\"]", segment);
                } else {
                    result.push('.');
                    result.push_str(&segment);
                }
                i = end;
            }
            _ => {
                result.push(ch);
                i += 1;
            }
        }
    }

    result
}

fn is_segment_char(chars: &[char], idx: usize) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    match chars[idx] {
        '-' => {
            idx > 0
                && is_ident(chars[idx - 1])
                && chars.get(idx + 1).is_some_and(|next| is_ident(*next))
        }
        c => is_ident(c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth_json() -> Value {
        json!({
            "context": {
                "request": {
                    "http": { "method": "GET", "path": "/pets", "host": "talker-api" }
                }
            },
            "auth": {
                "identity": { "sub": "alice", "groups": ["admins", "dev"] },
                "metadata": { "user-info": { "email": "alice@example.com" } }
            }
        })
    }

    #[test]
    fn test_render_simple_path() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .render("https://users.svc/{{ auth.identity.sub }}", &auth_json())
            .unwrap();
        assert_eq!(out, "https://users.svc/alice");
    }

    #[test]
    fn test_render_without_placeholders_is_passthrough() {
        let engine = PlaceholderEngine::new();
        let out = engine.render("plain text", &auth_json()).unwrap();
        assert_eq!(out, "plain text");
    }

    #[test]
    fn test_render_hyphenated_segment() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .render("{{ auth.metadata.user-info.email }}", &auth_json())
            .unwrap();
        assert_eq!(out, "alice@example.com");
    }

    #[test]
    fn test_render_absent_path_is_empty() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .render("x={{ auth.metadata.missing.field }}", &auth_json())
            .unwrap();
        assert_eq!(out, "x=");
    }

    #[test]
    fn test_render_object_as_json() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .render("groups: {{ auth.identity.groups }}", &auth_json())
            .unwrap();
        assert_eq!(out, r#"groups: ["admins","dev"]"#);
    }

    #[test]
    fn test_resolve_whole_placeholder_keeps_type() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .resolve(&json!("{{ auth.identity.groups }}"), &auth_json())
            .unwrap();
        assert_eq!(out, json!(["admins", "dev"]));
    }

    #[test]
    fn test_resolve_absent_whole_placeholder_is_null() {
        let engine = PlaceholderEngine::new();
        let out = engine
            .resolve(&json!("{{ auth.metadata.nothing }}"), &auth_json())
            .unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn test_resolve_nested_template() {
        let engine = PlaceholderEngine::new();
        let template = json!({
            "user": "{{ auth.identity.sub }}",
            "request": { "path": "{{ context.request.http.path }}", "fixed": 42 },
            "tags": ["static", "{{ context.request.http.method }}"]
        });
        let out = engine.resolve(&template, &auth_json()).unwrap();
        assert_eq!(
            out,
            json!({
                "user": "alice",
                "request": { "path": "/pets", "fixed": 42 },
                "tags": ["static", "GET"]
            })
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let engine = PlaceholderEngine::new();
        let ctx = auth_json();
        let template = "{{ context.request.http.method }} {{ auth.identity }}";
        let first = engine.render(template, &ctx).unwrap();
        let second = engine.render(template, &ctx).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_template_is_error() {
        let engine = PlaceholderEngine::new();
        assert!(engine.render("{{ auth.identity. }}", &auth_json()).is_err());
    }

    #[test]
    fn test_normalize_expression_preserves_quotes() {
        assert_eq!(
            normalize_expression(r#"auth.metadata.user-info | default("my-val")"#),
            r#"auth.metadata["user-info"] | default("my-val")"#
        );
        assert_eq!(normalize_expression("a.b.c"), "a.b.c");
    }
}
