//! StructuredValue: the content-first wrapper
//!
//! A StructuredValue carries three synchronized views of one piece of
//! content: `text` (canonical display string), `data` (parsed
//! representation), and `ctx` (metadata surface). Alligator loads, pipeline
//! stage inputs, and field access all flow through this wrapper. The source
//! design tags wrappers with a runtime symbol; here the nominal type itself
//! is the tag, so `Value::Structured` checks are O(1) pattern matches.

use indexmap::IndexMap;

use crate::error::MlldError;
use crate::value::Value;

/// Discriminates how `data` relates to `text`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredKind {
    Text,
    Object,
    Array,
    Html,
    Json,
    Jsonl,
}

impl StructuredKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StructuredKind::Text => "text",
            StructuredKind::Object => "object",
            StructuredKind::Array => "array",
            StructuredKind::Html => "html",
            StructuredKind::Json => "json",
            StructuredKind::Jsonl => "jsonl",
        }
    }
}

/// Metadata surface exposed as `.ctx` (and reachable through plain field
/// access when the key is not present on `data`)
#[derive(Debug, Clone, Default)]
pub struct ContentContext {
    pub filename: Option<String>,
    pub relative: Option<String>,
    pub absolute: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<u16>,
    pub headers: Option<IndexMap<String, String>>,
    pub html: Option<String>,
    pub tokens: Option<u64>,
    pub tokest: Option<u64>,
    /// Parsed frontmatter, when the content began with a `---` YAML block
    pub fm: Option<Value>,
    pub json: Option<Value>,
    pub errors: Vec<String>,
    pub retries: Option<Value>,
    pub source: Option<String>,
}

impl ContentContext {
    /// Read one metadata key as a Value; `None` when the key is unknown or unset
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "filename" => self.filename.clone().map(Value::Text),
            "relative" => self.relative.clone().map(Value::Text),
            "absolute" => self.absolute.clone().map(Value::Text),
            "url" => self.url.clone().map(Value::Text),
            "domain" => self.domain.clone().map(Value::Text),
            "title" => self.title.clone().map(Value::Text),
            "description" => self.description.clone().map(Value::Text),
            "status" => self.status.map(|s| Value::Number(f64::from(s))),
            "headers" => self.headers.as_ref().map(|h| {
                let mut map = IndexMap::new();
                for (k, v) in h {
                    map.insert(k.clone(), Value::Text(v.clone()));
                }
                Value::object(map)
            }),
            "html" => self.html.clone().map(Value::Text),
            "tokens" => self.tokens.map(|t| Value::Number(t as f64)),
            "tokest" => self.tokest.map(|t| Value::Number(t as f64)),
            "fm" => self.fm.clone(),
            "json" => self.json.clone(),
            "errors" => Some(Value::array(
                self.errors.iter().cloned().map(Value::Text).collect(),
            )),
            "retries" => self.retries.clone(),
            "source" => self.source.clone().map(Value::Text),
            _ => None,
        }
    }

    pub fn is_metadata_key(key: &str) -> bool {
        matches!(
            key,
            "filename"
                | "relative"
                | "absolute"
                | "url"
                | "domain"
                | "title"
                | "description"
                | "status"
                | "headers"
                | "html"
                | "tokens"
                | "tokest"
                | "fm"
                | "json"
                | "errors"
                | "retries"
                | "source"
        )
    }

    /// Snapshot of the whole metadata surface as an object value
    pub fn to_value(&self) -> Value {
        let mut map = IndexMap::new();
        for key in [
            "filename",
            "relative",
            "absolute",
            "url",
            "domain",
            "title",
            "description",
            "status",
            "tokens",
            "tokest",
            "fm",
            "source",
        ] {
            if let Some(v) = self.get(key) {
                map.insert(key.to_string(), v);
            }
        }
        if !self.errors.is_empty() {
            if let Some(v) = self.get("errors") {
                map.insert("errors".to_string(), v);
            }
        }
        Value::object(map)
    }
}

/// The wrapper itself. `text` is always the canonical display string;
/// `data` holds the parsed representation (the text itself for plain text).
#[derive(Debug, Clone)]
pub struct StructuredValue {
    pub kind: StructuredKind,
    pub text: String,
    pub data: Value,
    pub ctx: ContentContext,
    /// Optional security/provenance labels
    pub mx: Option<Value>,
}

impl StructuredValue {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: StructuredKind::Text,
            data: Value::Text(text.clone()),
            text,
            ctx: ContentContext::default(),
            mx: None,
        }
    }

    /// Parse `text` as JSON; `data` becomes the parsed value
    pub fn from_json_text(text: impl Into<String>) -> Result<Self, MlldError> {
        let text = text.into();
        let json: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| MlldError::StructuredCoerce {
                message: format!("invalid JSON: {e}"),
            })?;
        let data = Value::from_json(&json);
        let kind = match data {
            Value::Array(_) => StructuredKind::Array,
            Value::Object(_) => StructuredKind::Object,
            _ => StructuredKind::Json,
        };
        Ok(Self {
            kind,
            text,
            data,
            ctx: ContentContext::default(),
            mx: None,
        })
    }

    /// Parse JSONL line by line; parse errors carry the 1-based line number
    /// and a prefix of the offending line
    pub fn from_jsonl_text(text: impl Into<String>) -> Result<Self, MlldError> {
        let text = text.into();
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let json: serde_json::Value =
                serde_json::from_str(line).map_err(|_| MlldError::StructuredCoerce {
                    message: format!(
                        "invalid JSONL at line {}: {}",
                        idx + 1,
                        line.chars().take(60).collect::<String>()
                    ),
                })?;
            rows.push(Value::from_json(&json));
        }
        Ok(Self {
            kind: StructuredKind::Jsonl,
            text,
            data: Value::array(rows),
            ctx: ContentContext::default(),
            mx: None,
        })
    }

    pub fn with_ctx(mut self, ctx: ContentContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn into_value(self) -> Value {
        Value::Structured(std::rc::Rc::new(self))
    }
}

/// `as_text(v) === v.text` for wrappers; other values use display coercion
pub fn as_text(value: &Value) -> String {
    match value {
        Value::Structured(s) => s.text.clone(),
        other => other.display_string(false),
    }
}

/// Parsed representation: unwraps one wrapper layer, errors when the
/// wrapper's content never parsed
pub fn as_data(value: &Value) -> Result<Value, MlldError> {
    match value {
        Value::Structured(s) => {
            if matches!(s.kind, StructuredKind::Json | StructuredKind::Jsonl)
                && s.data.is_null()
                && !s.text.trim().is_empty()
            {
                return Err(MlldError::StructuredCoerce {
                    message: format!("content of kind {} is not parseable", s.kind.as_str()),
                });
            }
            Ok(s.data.clone())
        }
        other => Ok(other.clone()),
    }
}

/// Identity that signals intent: the wrapper must survive a host bridge
pub fn keep(value: Value) -> Value {
    value
}

/// O(1) wrapper check
pub fn is_structured(value: &Value) -> bool {
    matches!(value, Value::Structured(_))
}

/// Unwrap for a host-language boundary: a wrapper becomes its `.data`, an
/// array of wrappers becomes an array of `.data`. `keep` parameters skip this.
pub fn unwrap_for_host(value: &Value) -> Value {
    match value {
        Value::Structured(s) => s.data.clone(),
        Value::Array(items) if items.iter().any(is_structured) => Value::array(
            items
                .iter()
                .map(|v| match v {
                    Value::Structured(s) => s.data.clone(),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rough file-type buckets for KB-based token estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCategory {
    Text,
    Code,
    Data,
    Other,
}

impl ContentCategory {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "md" | "txt" | "rst" | "adoc" | "mld" => ContentCategory::Text,
            "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "rb" | "go" | "java" | "c" | "h"
            | "cpp" | "cs" | "sol" | "sh" => ContentCategory::Code,
            "json" | "jsonl" | "yaml" | "yml" | "toml" | "csv" | "xml" => ContentCategory::Data,
            _ => ContentCategory::Other,
        }
    }

    /// Tokens per KB for this bucket
    pub fn rate(self) -> u64 {
        match self {
            ContentCategory::Text => 750,
            ContentCategory::Code => 500,
            ContentCategory::Data => 400,
            ContentCategory::Other => 600,
        }
    }
}

/// KB-based token estimate used for both `.tokens` and `.tokest`
pub fn estimate_tokens(byte_len: usize, category: ContentCategory) -> u64 {
    let kb = byte_len as f64 / 1024.0;
    (kb * category.rate() as f64).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_wrapper_round_trip() {
        let sv = StructuredValue::from_text("hello");
        assert_eq!(as_text(&sv.clone().into_value()), "hello");
        assert!(is_structured(&sv.into_value()));
    }

    #[test]
    fn json_text_parses_into_data() {
        let sv = StructuredValue::from_json_text(r#"{"a":1}"#).unwrap();
        assert_eq!(sv.kind, StructuredKind::Object);
        let data = as_data(&sv.into_value()).unwrap();
        assert!(matches!(data, Value::Object(_)));
    }

    #[test]
    fn jsonl_error_names_line() {
        let err = StructuredValue::from_jsonl_text("{\"ok\":1}\n{bad}\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("line 2"));
        assert!(message.contains("{bad}"));
    }

    #[test]
    fn host_unwrap_descends_arrays() {
        let arr = Value::array(vec![
            StructuredValue::from_text("a").into_value(),
            StructuredValue::from_text("b").into_value(),
        ]);
        let unwrapped = unwrap_for_host(&arr);
        match unwrapped {
            Value::Array(items) => {
                assert!(items.iter().all(|v| matches!(v, Value::Text(_))));
            }
            other => panic!("expected array, got {}", other.type_name()),
        }
    }

    #[test]
    fn token_estimate_rates() {
        assert_eq!(estimate_tokens(1024, ContentCategory::Text), 750);
        assert_eq!(estimate_tokens(2048, ContentCategory::Data), 800);
    }
}
