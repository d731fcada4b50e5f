//! Typed capability descriptors.
//!
//! A capability is a named operation a worker may invoke while the backend
//! executes its run. Each descriptor declares its parameter and return
//! types so the backend can validate arguments and advertise the operation
//! without inspecting the implementation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Type of a capability parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamType {
    /// JSON schema type name.
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }

    /// Returns true if `value` is an instance of this type.
    ///
    /// Integers are also accepted when passed as numeric strings, which is
    /// how models commonly emit identifiers.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value
                        .as_str()
                        .map(|s| s.trim().parse::<i64>().is_ok())
                        .unwrap_or(false)
            }
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// Declared return type of a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// Free-form text.
    #[default]
    Text,
    /// JSON-encoded rows.
    Rows,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            description: description.into(),
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, ty: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty, description)
        }
    }
}

/// Typed description of a named operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique capability name.
    pub name: String,

    /// Description shown to the worker.
    pub description: String,

    /// Declared parameters, in order.
    pub params: Vec<ParamSpec>,

    /// Declared return type.
    pub returns: ReturnType,
}

impl CapabilityDescriptor {
    /// Create a descriptor with no parameters returning text.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            returns: ReturnType::Text,
        }
    }

    /// Builder method to add a parameter.
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Builder method to set the return type.
    pub fn returning(mut self, returns: ReturnType) -> Self {
        self.returns = returns;
        self
    }

    /// Check `args` against the declared parameters.
    ///
    /// Returns a description of the first violation found.
    pub fn validate_args(&self, args: &Value) -> Result<(), String> {
        let empty = Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("arguments must be an object, got {}", other)),
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(format!("missing required parameter '{}'", param.name));
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.ty.accepts(value) => {
                    return Err(format!(
                        "parameter '{}' must be of type {}",
                        param.name,
                        param.ty.schema_name()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Function-tool definition in the JSON schema dialect hosted agents
    /// services expect.
    pub fn to_tool_definition(&self) -> Value {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({ "type": p.ty.schema_name(), "description": p.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }
}
