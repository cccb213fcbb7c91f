//! Per-run variable store and `{{name}}` template resolution

use crate::error::StepError;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;

/// Scoped name → value storage owned by a single run
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: HashMap<String, Value>,
}

impl VariableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a JSON object (trigger payload variables)
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Read a top-level variable
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Read a top-level variable, failing when it was never set
    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.get(name)
            .ok_or_else(|| StepError::UndefinedVariable(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a dotted reference (`response.body.items.0`)
    ///
    /// The first segment names the variable; later segments index into
    /// objects by key and arrays by position.
    #[must_use]
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        let mut segments = reference.split('.');
        let mut current = self.values.get(segments.next()?.trim())?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Substitute every `{{name}}` reference in a template
    ///
    /// Unresolved references fail rather than rendering as empty text. An
    /// unterminated `{{` is kept literally.
    pub fn resolve(&self, template: &str) -> Result<String, StepError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            out.push_str(&rest[..start]);
            let name = rest[start + 2..start + 2 + len].trim();
            let value = self
                .lookup(name)
                .ok_or_else(|| StepError::UnresolvedVariable(name.to_string()))?;
            out.push_str(&as_text(value));
            rest = &rest[start + 2 + len + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Resolve templates in every string inside a JSON value
    ///
    /// A string consisting of exactly one reference keeps the referenced
    /// value's type, so `"{{count}}"` yields a number when `count` is one.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, StepError> {
        match value {
            Value::String(s) => {
                if let Some(name) = single_reference(s) {
                    return self
                        .lookup(name)
                        .cloned()
                        .ok_or_else(|| StepError::UnresolvedVariable(name.to_string()));
                }
                self.resolve(s).map(Value::String)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.resolve_map(map).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve templates in a step config object
    pub fn resolve_map(&self, map: &Map<String, Value>) -> Result<Map<String, Value>, StepError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
            .collect()
    }

    /// Snapshot of all variables
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// `"{{ name }}"` → `Some("name")`
fn single_reference(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Coerce a value to a number
///
/// Numeric strings parse; anything else is a `TypeMismatch`.
pub fn as_number(value: &Value) -> Result<f64, StepError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| StepError::type_mismatch("number", value)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or_else(|| StepError::type_mismatch("number", value)),
        _ => Err(StepError::type_mismatch("number", value)),
    }
}

/// Coerce a value to a boolean
pub fn as_bool(value: &Value) -> Result<bool, StepError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(StepError::type_mismatch("boolean", value)),
        },
        _ => Err(StepError::type_mismatch("boolean", value)),
    }
}

/// Render a value as text for templates
#[must_use]
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Build a JSON number, preferring integers for whole results
#[must_use]
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}
