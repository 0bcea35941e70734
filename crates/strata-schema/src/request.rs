use crate::types::MachineId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// An inbound request to build one machine.
///
/// `builder` is kept exactly as it arrived; the orchestrator decodes it into a
/// [`BuilderConfig`](crate::BuilderConfig) once, when the build is prepared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    pub machine_id: MachineId,
    pub username: String,
    pub provider: String,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "empty_table")]
    pub builder: Value,
    #[serde(default)]
    pub current_data: Option<Value>,
}

fn empty_table() -> Value {
    Value::Object(serde_json::Map::new())
}

impl BuildRequest {
    pub fn new(
        machine_id: impl Into<MachineId>,
        username: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            username: username.into(),
            provider: provider.into(),
            credential: None,
            builder: empty_table(),
            current_data: None,
        }
    }

    #[must_use]
    pub fn with_builder(mut self, builder: Value) -> Self {
        self.builder = builder;
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    #[must_use]
    pub fn with_current_data(mut self, data: Value) -> Self {
        self.current_data = Some(data);
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.machine_id.is_empty() {
            return Err(SchemaError::EmptyMachineId);
        }
        if self.username.is_empty() {
            return Err(SchemaError::EmptyUsername);
        }
        if self.provider.is_empty() {
            return Err(SchemaError::EmptyProvider);
        }
        Ok(())
    }

    pub fn from_toml_str(input: &str) -> Result<Self, SchemaError> {
        let request: Self = toml::from_str(input)?;
        request.validate()?;
        Ok(request)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
