//! Typed builder configuration.
//!
//! Provider options arrive as a free-form key/value table. The only key the
//! orchestrator interprets is `instanceName`; it is decoded and validated
//! exactly once, in [`BuilderConfig::from_value`], and everything else is kept
//! verbatim for the provider.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INSTANCE_NAME_KEY: &str = "instanceName";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct BuilderConfig {
    instance_name: Option<String>,
    options: Map<String, Value>,
}

impl BuilderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a raw builder table.
    ///
    /// A missing or empty `instanceName` means "not set". Any other non-string
    /// value, `null` included, is rejected.
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let mut map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => return Err(SchemaError::MalformedBuilder(json_kind(&other).to_owned())),
        };

        let instance_name = match map.remove(INSTANCE_NAME_KEY) {
            None => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => return Err(SchemaError::MalformedInstanceName(other.to_string())),
        };

        Ok(Self {
            instance_name,
            options: map,
        })
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    pub fn set_instance_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.instance_name = if name.is_empty() { None } else { Some(name) };
    }

    #[must_use]
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.set_instance_name(name);
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a provider option. Setting `instanceName` is routed through
    /// [`set_instance_name`](Self::set_instance_name) when the value is a string.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if key == INSTANCE_NAME_KEY {
            if let Value::String(s) = value {
                self.set_instance_name(s);
                return;
            }
        }
        self.options.insert(key.to_owned(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.options.clone();
        if let Some(ref name) = self.instance_name {
            map.insert(INSTANCE_NAME_KEY.to_owned(), Value::String(name.clone()));
        }
        Value::Object(map)
    }
}

impl TryFrom<Value> for BuilderConfig {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<BuilderConfig> for Value {
    fn from(config: BuilderConfig) -> Self {
        config.to_value()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_preset_instance_name() {
        let config =
            BuilderConfig::from_value(json!({"instanceName": "foo", "region": "eu"})).unwrap();
        assert_eq!(config.instance_name(), Some("foo"));
        assert_eq!(config.get_str("region"), Some("eu"));
        assert!(config.get(INSTANCE_NAME_KEY).is_none());
    }

    #[test]
    fn empty_instance_name_is_unset() {
        let config = BuilderConfig::from_value(json!({"instanceName": ""})).unwrap();
        assert_eq!(config.instance_name(), None);
    }

    #[test]
    fn non_string_instance_name_is_malformed() {
        for bad in [json!(42), json!(null), json!(["a"]), json!({"x": 1}), json!(true)] {
            let err = BuilderConfig::from_value(json!({ "instanceName": bad })).unwrap_err();
            assert!(
                matches!(err, SchemaError::MalformedInstanceName(_)),
                "unexpected error: {err}"
            );
        }
    }

    #[test]
    fn non_table_builder_is_rejected() {
        let err = BuilderConfig::from_value(json!("oops")).unwrap_err();
        assert!(matches!(err, SchemaError::MalformedBuilder(ref k) if k == "string"));
    }

    #[test]
    fn null_builder_is_empty() {
        let config = BuilderConfig::from_value(Value::Null).unwrap();
        assert_eq!(config, BuilderConfig::default());
    }

    #[test]
    fn to_value_merges_instance_name_back() {
        let config = BuilderConfig::new()
            .with_option("image", "ubuntu")
            .with_instance_name("alice-1");
        let value = config.to_value();
        assert_eq!(value["instanceName"], "alice-1");
        assert_eq!(value["image"], "ubuntu");
    }

    #[test]
    fn deserializing_goes_through_validation() {
        let ok: BuilderConfig = serde_json::from_str(r#"{"instanceName":"vm"}"#).unwrap();
        assert_eq!(ok.instance_name(), Some("vm"));
        let bad: Result<BuilderConfig, _> = serde_json::from_str(r#"{"instanceName":7}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn set_routes_instance_name() {
        let mut config = BuilderConfig::new();
        config.set(INSTANCE_NAME_KEY, "bar");
        assert_eq!(config.instance_name(), Some("bar"));
        assert!(config.options().is_empty());
    }
}
