//! Field access
//!
//! One place implements the chain rules for `a.b[0].c`: wrapper-level
//! reserved keys on variables, `data`-then-`ctx` precedence on
//! StructuredValues, bounds-checked numeric indexing on arrays, and metadata
//! broadcast over arrays of loaded content.

use indexmap::IndexMap;

use crate::ast::FieldAccess;
use crate::error::{MlldError, SourceLocation};
use crate::structured::ContentContext;
use crate::value::Value;
use crate::variable::Variable;

/// Keys that read the variable record itself instead of its value
const RESERVED_VARIABLE_KEYS: &[&str] = &["type", "isComplex", "source", "metadata"];

/// Result of an access that preserved ownership context
pub struct AccessOutcome {
    pub value: Value,
    pub parent_variable: Option<Variable>,
    pub access_path: Vec<FieldAccess>,
    pub is_variable: bool,
}

/// Apply a field chain to a resolved variable; missing fields are errors
pub fn apply_fields(
    variable: &Variable,
    fields: &[FieldAccess],
    location: &SourceLocation,
) -> Result<Value, MlldError> {
    apply_fields_opt(variable, fields, location, false)
}

/// Like [`apply_fields`], but a missing field yields `Null` when
/// `return_undefined_for_missing` is set
pub fn apply_fields_opt(
    variable: &Variable,
    fields: &[FieldAccess],
    location: &SourceLocation,
    return_undefined_for_missing: bool,
) -> Result<Value, MlldError> {
    if let Some((FieldAccess::Field(first), rest)) = fields.split_first() {
        if RESERVED_VARIABLE_KEYS.contains(&first.as_str()) {
            let head = variable_property(variable, first);
            return walk(head, rest, location, return_undefined_for_missing);
        }
    }
    walk(
        variable.value.clone(),
        fields,
        location,
        return_undefined_for_missing,
    )
}

/// Access with ownership context preserved for callers that need to know
/// where a value came from
pub fn apply_fields_with_context(
    variable: &Variable,
    fields: &[FieldAccess],
    location: &SourceLocation,
) -> Result<AccessOutcome, MlldError> {
    let value = apply_fields(variable, fields, location)?;
    Ok(AccessOutcome {
        value,
        parent_variable: Some(variable.clone()),
        access_path: fields.to_vec(),
        is_variable: fields.is_empty(),
    })
}

fn walk(
    mut value: Value,
    fields: &[FieldAccess],
    location: &SourceLocation,
    missing_ok: bool,
) -> Result<Value, MlldError> {
    for field in fields {
        value = match access_one(&value, field, location) {
            Ok(v) => v,
            Err(err) => {
                if missing_ok {
                    return Ok(Value::Null);
                }
                return Err(err);
            }
        };
    }
    Ok(value)
}

fn variable_property(variable: &Variable, key: &str) -> Value {
    match key {
        "type" => Value::Text(variable.kind.as_str().to_string()),
        "isComplex" => Value::Bool(variable.metadata.is_complex),
        "source" => {
            let mut map = IndexMap::new();
            map.insert(
                "directive".to_string(),
                Value::Text(variable.source.directive.clone()),
            );
            map.insert(
                "syntax".to_string(),
                Value::Text(variable.source.syntax.clone()),
            );
            map.insert(
                "hasInterpolation".to_string(),
                Value::Bool(variable.source.has_interpolation),
            );
            map.insert(
                "isMultiLine".to_string(),
                Value::Bool(variable.source.is_multi_line),
            );
            Value::object(map)
        }
        "metadata" => {
            let mut map = IndexMap::new();
            map.insert(
                "isImported".to_string(),
                Value::Bool(variable.metadata.is_imported),
            );
            if let Some(path) = &variable.metadata.import_path {
                map.insert("importPath".to_string(), Value::Text(path.clone()));
            }
            map.insert(
                "isSystem".to_string(),
                Value::Bool(variable.metadata.is_system),
            );
            Value::object(map)
        }
        _ => Value::Null,
    }
}

/// One step of the chain
pub fn access_one(
    value: &Value,
    field: &FieldAccess,
    location: &SourceLocation,
) -> Result<Value, MlldError> {
    match value {
        Value::Structured(wrapper) => {
            if let FieldAccess::Field(name) = field {
                // data first, ctx second, wrapper properties last
                if let Value::Object(map) = &wrapper.data {
                    if let Some(found) = map.get(name) {
                        return Ok(found.clone());
                    }
                }
                if ContentContext::is_metadata_key(name) {
                    if let Some(found) = wrapper.ctx.get(name) {
                        return Ok(found);
                    }
                }
                return match name.as_str() {
                    "text" | "content" => Ok(Value::Text(wrapper.text.clone())),
                    "data" => Ok(wrapper.data.clone()),
                    "ctx" => Ok(wrapper.ctx.to_value()),
                    "mx" => Ok(wrapper.mx.clone().unwrap_or(Value::Null)),
                    _ => Err(missing(name, "structured content", location)),
                };
            }
            access_one(&wrapper.data, field, location)
        }
        Value::Object(map) => {
            let key = match field {
                FieldAccess::Field(name) => name.clone(),
                FieldAccess::StringKey(key) => key.clone(),
                FieldAccess::Index(i) => i.to_string(),
            };
            map.get(&key)
                .cloned()
                .ok_or_else(|| missing(&key, "object", location))
        }
        Value::Array(items) => match field {
            FieldAccess::Index(i) => {
                let len = items.len() as i64;
                let resolved = if *i < 0 { len + *i } else { *i };
                usize::try_from(resolved)
                    .ok()
                    .and_then(|idx| items.get(idx))
                    .cloned()
                    .ok_or_else(|| {
                        MlldError::resolution_at(
                            format!("index {i} out of bounds for array of length {len}"),
                            location.clone(),
                        )
                    })
            }
            FieldAccess::Field(name) if name == "length" => {
                Ok(Value::Number(items.len() as f64))
            }
            FieldAccess::Field(name) if broadcasts(name) => {
                // Metadata broadcast over loaded-content arrays:
                // `files.relative` yields one entry per element
                if items.iter().all(|v| matches!(v, Value::Structured(_))) {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items.iter() {
                        out.push(access_one(item, field, location).unwrap_or(Value::Null));
                    }
                    return Ok(Value::array(out));
                }
                Err(missing(name, "array", location))
            }
            FieldAccess::Field(name) => Err(missing(name, "array", location)),
            FieldAccess::StringKey(key) => Err(missing(key, "array", location)),
        },
        Value::Null => Err(MlldError::resolution_at(
            "cannot access a field of null",
            location.clone(),
        )),
        other => {
            let shown = match field {
                FieldAccess::Field(name) => name.clone(),
                FieldAccess::StringKey(key) => key.clone(),
                FieldAccess::Index(i) => i.to_string(),
            };
            Err(MlldError::resolution_at(
                format!("cannot access .{shown} on a {}", other.type_name()),
                location.clone(),
            ))
        }
    }
}

fn broadcasts(name: &str) -> bool {
    ContentContext::is_metadata_key(name) || name == "content" || name == "text"
}

fn missing(key: &str, container: &str, location: &SourceLocation) -> MlldError {
    MlldError::resolution_at(
        format!("field '{key}' not found on {container}"),
        location.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured::StructuredValue;
    use crate::variable::Variable;

    fn loc() -> SourceLocation {
        SourceLocation::default()
    }

    #[test]
    fn reserved_keys_read_the_variable_record() {
        let var = Variable::simple_text("greeting", "hi");
        let value =
            apply_fields(&var, &[FieldAccess::Field("type".into())], &loc()).unwrap();
        assert_eq!(value.as_str(), Some("simple-text"));
    }

    #[test]
    fn structured_data_beats_ctx() {
        let mut sv = StructuredValue::from_json_text(r#"{"title":"from data"}"#).unwrap();
        sv.ctx.title = Some("from ctx".into());
        let value = access_one(
            &sv.into_value(),
            &FieldAccess::Field("title".into()),
            &loc(),
        )
        .unwrap();
        assert_eq!(value.as_str(), Some("from data"));
    }

    #[test]
    fn negative_index_counts_from_end() {
        let arr = Value::array(vec![
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        let value = access_one(&arr, &FieldAccess::Index(-1), &loc()).unwrap();
        assert!(value.loose_eq(&Value::Number(3.0)));
        assert!(access_one(&arr, &FieldAccess::Index(5), &loc()).is_err());
    }

    #[test]
    fn metadata_broadcast_over_content_arrays() {
        let mut a = StructuredValue::from_text("A");
        a.ctx.relative = Some("docs/a.md".into());
        let mut b = StructuredValue::from_text("B");
        b.ctx.relative = Some("docs/b.md".into());
        let arr = Value::array(vec![a.into_value(), b.into_value()]);
        let value = access_one(&arr, &FieldAccess::Field("relative".into()), &loc()).unwrap();
        let Value::Array(items) = value else {
            panic!("expected broadcast array");
        };
        assert_eq!(items[0].as_str(), Some("docs/a.md"));
        assert_eq!(items[1].as_str(), Some("docs/b.md"));
    }

    #[test]
    fn missing_field_can_yield_null() {
        let var = Variable::inferred("obj", Value::object(IndexMap::new()));
        let err = apply_fields(&var, &[FieldAccess::Field("nope".into())], &loc());
        assert!(err.is_err());
        let value = apply_fields_opt(&var, &[FieldAccess::Field("nope".into())], &loc(), true)
            .unwrap();
        assert!(value.is_null());
    }
}
