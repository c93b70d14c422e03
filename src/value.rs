//! Runtime value representation
//!
//! The core Value type for everything the evaluator produces: primitives,
//! `Rc`-shared aggregates, paths, executables, StructuredValue wrappers, and
//! the pipeline control returns (`retry`/`skip`/`done`).

use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::MlldError;
use crate::structured::StructuredValue;
use crate::variable::ExecutableDef;

/// A runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Array(Rc<Vec<Value>>),
    Object(Rc<IndexMap<String, Value>>),
    Path(PathValue),
    Executable(Rc<ExecutableDef>),
    Structured(Rc<StructuredValue>),
    Control(ControlValue),
}

/// A validated path bound by `/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValue {
    /// The path as written, before expansion
    pub raw: String,
    pub resolved: PathBuf,
}

/// Control return from a pipeline stage or when-action
#[derive(Debug, Clone)]
pub enum ControlValue {
    Retry(Option<Rc<Value>>),
    Skip,
    Done,
}

impl Value {
    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(values))
    }

    pub fn object(map: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(map))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Path(_) => "path",
            Value::Executable(_) => "executable",
            Value::Structured(_) => "structured",
            Value::Control(_) => "control",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Value::Control(_))
    }

    /// JavaScript-like truthiness after unwrapping StructuredValues
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Path(_) | Value::Executable(_) => true,
            Value::Structured(s) => s.data.truthy(),
            Value::Control(_) => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(true) => Some(1.0),
            Value::Bool(false) => Some(0.0),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Structured(s) => s.data.as_number(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Structured(s) => Some(&s.text),
            _ => None,
        }
    }

    /// Structural equality after unwrapping StructuredValues.
    /// Objects compare key-by-key in insertion order; numbers compare by
    /// value, so `30` written as text never equals the number `30`.
    pub fn loose_eq(&self, other: &Value) -> bool {
        let a = self.unwrapped();
        let b = other.unwrapped();
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Text(x), Value::Text(y)) => x == y,
            (Value::Path(x), Value::Path(y)) => x == y,
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| l.loose_eq(r))
            }
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| match y.get(k) {
                        Some(w) => v.loose_eq(w),
                        None => false,
                    })
            }
            (Value::Executable(x), Value::Executable(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    /// Numeric-or-textual ordering for `<`/`>` comparisons
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        let a = self.unwrapped();
        let b = other.unwrapped();
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return x.partial_cmp(&y);
        }
        match (a, b) {
            (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
            _ => None,
        }
    }

    /// Follow Structured wrappers down to their parsed data
    pub fn unwrapped(&self) -> &Value {
        match self {
            Value::Structured(s) => s.data.unwrapped(),
            other => other,
        }
    }

    /// What `/show` emits and what string coercion yields
    pub fn display_string(&self, pretty: bool) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Text(s) => s.clone(),
            Value::Path(p) => p.resolved.display().to_string(),
            Value::Executable(def) => format!("<executable @{}>", def.name),
            Value::Structured(s) => s.text.clone(),
            Value::Array(items) => {
                // Arrays of wrappers concatenate their texts in display contexts
                if !items.is_empty() && items.iter().all(|v| matches!(v, Value::Structured(_))) {
                    return items
                        .iter()
                        .map(|v| v.display_string(pretty))
                        .collect::<Vec<_>>()
                        .join("\n\n");
                }
                json_display(self, pretty)
            }
            Value::Object(_) => json_display(self, pretty),
            Value::Control(c) => match c {
                ControlValue::Retry(_) => "retry".to_string(),
                ControlValue::Skip => "skip".to_string(),
                ControlValue::Done => "done".to_string(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                // Integer-valued numbers serialize as JSON integers, so
                // display and canonical keys never grow a spurious `.0`
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
                    serde_json::Value::Number(serde_json::Number::from(*n as i64))
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Path(p) => serde_json::Value::String(p.resolved.display().to_string()),
            Value::Executable(def) => serde_json::Value::String(format!("<executable @{}>", def.name)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Structured(s) => s.data.to_json(),
            Value::Control(_) => serde_json::Value::Null,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Value::from_json(v));
                }
                Value::object(out)
            }
        }
    }

    /// Canonical JSON of this value; checkpoint keys and `/output json` use it
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.to_json()).unwrap_or_else(|_| "null".to_string())
    }

    /// Marker record injected when one property of an object/array fails to
    /// evaluate: `{__error: true, __message, __property}`
    pub fn error_marker(property: &str, error: &MlldError) -> Value {
        let mut map = IndexMap::new();
        map.insert("__error".to_string(), Value::Bool(true));
        map.insert("__message".to_string(), Value::Text(error.to_string()));
        map.insert("__property".to_string(), Value::Text(property.to_string()));
        Value::object(map)
    }

    pub fn is_error_marker(&self) -> bool {
        match self {
            Value::Object(map) => matches!(map.get("__error"), Some(Value::Bool(true))),
            _ => false,
        }
    }
}

/// Integer-valued floats print without a trailing `.0`
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn json_display(value: &Value, pretty: bool) -> String {
    let json = value.to_json();
    let rendered = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    rendered.unwrap_or_else(|_| "null".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Text(String::new()).truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(Value::Text("x".into()).truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn number_display_drops_integer_fraction() {
        assert_eq!(format_number(30.0), "30");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(-2.0), "-2");
    }

    #[test]
    fn loose_equality_is_structural() {
        let a = Value::array(vec![Value::Number(1.0), Value::Text("x".into())]);
        let b = Value::array(vec![Value::Number(1.0), Value::Text("x".into())]);
        assert!(a.loose_eq(&b));
        assert!(!a.loose_eq(&Value::array(vec![Value::Number(1.0)])));
    }

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"name":"Alice","scores":[95,87]}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn error_marker_shape() {
        let marker = Value::error_marker("age", &MlldError::resolution("bad field"));
        assert!(marker.is_error_marker());
    }
}
