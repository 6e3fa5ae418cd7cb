//! Tool descriptors
//!
//! A descriptor tells the host what a tool is called, what it does and which
//! argument and result shapes it accepts, without invoking it. Schemas are
//! JSON Schema documents so they can be handed to an LLM unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Metadata describing one callable operation of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique across every loaded plugin (e.g., "read_file")
    pub name: String,
    /// Human-readable description
    pub summary: String,
    /// Explicit version tag; bump it (or rename) when a schema changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// JSON Schema for accepted arguments; always an object schema
    pub parameter_schema: Value,
    /// JSON Schema for successful payloads
    #[serde(default = "any_schema")]
    pub result_schema: Value,
}

fn any_schema() -> Value {
    json!({})
}

impl ToolDescriptor {
    /// Start building a descriptor
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            summary: String::new(),
            version: None,
            parameters: Vec::new(),
            result_schema: any_schema(),
        }
    }

    /// Names of the required top-level parameters
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameter_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Export in the common function-calling shape used by LLM APIs
    pub fn to_function_definition(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.summary,
                "parameters": self.parameter_schema,
            }
        })
    }
}

/// Parameter type, mirroring the JSON Schema primitive types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// Parameter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name
    pub name: String,
    /// Parameter type
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Whether parameter is required
    #[serde(default)]
    pub required: bool,
    /// Default value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Inclusive numeric bounds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Allowed values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    /// Regex the string value must match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Item schema for arrays, or full schema for nested objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: false,
            default: None,
            minimum: None,
            maximum: None,
            allowed: Vec::new(),
            pattern: None,
            items: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Boolean)
    }

    pub fn array(name: impl Into<String>, items: Value) -> Self {
        let mut def = Self::new(name, ParamType::Array);
        def.items = Some(items);
        def
    }

    pub fn object(name: impl Into<String>, schema: Value) -> Self {
        let mut def = Self::new(name, ParamType::Object);
        def.items = Some(schema);
        def
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.allowed = values.into_iter().collect();
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// JSON Schema fragment for this parameter
    pub fn to_schema(&self) -> Value {
        // Nested object parameters carry their complete schema
        let mut schema = match (self.param_type, &self.items) {
            (ParamType::Object, Some(Value::Object(nested))) => nested.clone(),
            _ => Map::new(),
        };

        schema.insert("type".into(), json!(self.param_type.as_str()));
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.clone());
        }
        if let Some(min) = self.minimum {
            schema.insert("minimum".into(), number_value(min));
        }
        if let Some(max) = self.maximum {
            schema.insert("maximum".into(), number_value(max));
        }
        if !self.allowed.is_empty() {
            schema.insert("enum".into(), Value::Array(self.allowed.clone()));
        }
        if let Some(pattern) = &self.pattern {
            schema.insert("pattern".into(), json!(pattern));
        }
        if let (ParamType::Array, Some(items)) = (self.param_type, &self.items) {
            schema.insert("items".into(), items.clone());
        }

        Value::Object(schema)
    }
}

/// Integral bounds render as integers so `"integer"` parameters stay tidy
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// Builder returned by [`ToolDescriptor::builder`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    name: String,
    summary: String,
    version: Option<String>,
    parameters: Vec<ParameterDef>,
    result_schema: Value,
}

impl DescriptorBuilder {
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn param(mut self, param: ParameterDef) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn returns(mut self, schema: Value) -> Self {
        self.result_schema = schema;
        self
    }

    pub fn build(self) -> ToolDescriptor {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            properties.insert(param.name.clone(), param.to_schema());
            if param.required {
                required.push(json!(param.name));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), json!("object"));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        schema.insert("additionalProperties".into(), json!(false));

        ToolDescriptor {
            name: self.name,
            summary: self.summary,
            version: self.version,
            parameter_schema: Value::Object(schema),
            result_schema: self.result_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_file() -> ToolDescriptor {
        ToolDescriptor::builder("read_file")
            .summary("Read contents of a file")
            .param(
                ParameterDef::string("path")
                    .describe("File path to read")
                    .required(),
            )
            .param(
                ParameterDef::integer("max_bytes")
                    .describe("Maximum bytes to read")
                    .range(Some(1.0), Some(1_048_576.0))
                    .default_value(json!(102400)),
            )
            .build()
    }

    #[test]
    fn test_builder_emits_object_schema() {
        let desc = read_file();
        assert_eq!(desc.parameter_schema["type"], "object");
        assert_eq!(desc.parameter_schema["properties"]["path"]["type"], "string");
        assert_eq!(desc.parameter_schema["properties"]["max_bytes"]["minimum"], 1);
        assert_eq!(desc.parameter_schema["additionalProperties"], false);
        assert_eq!(desc.required_parameters(), vec!["path"]);
    }

    #[test]
    fn test_nested_object_parameter_keeps_its_schema() {
        let desc = ToolDescriptor::builder("search")
            .param(
                ParameterDef::object(
                    "filter",
                    json!({
                        "properties": { "kind": { "type": "string" } },
                        "required": ["kind"]
                    }),
                )
                .required(),
            )
            .build();

        let filter = &desc.parameter_schema["properties"]["filter"];
        assert_eq!(filter["type"], "object");
        assert_eq!(filter["required"][0], "kind");
    }

    #[test]
    fn test_enum_and_pattern() {
        let def = ParameterDef::string("format")
            .one_of([json!("rfc3339"), json!("unix")])
            .pattern("^[a-z0-9]+$");
        let schema = def.to_schema();
        assert_eq!(schema["enum"].as_array().unwrap().len(), 2);
        assert_eq!(schema["pattern"], "^[a-z0-9]+$");
    }

    #[test]
    fn test_function_definition_shape() {
        let def = read_file().to_function_definition();
        assert_eq!(def["function"]["name"], "read_file");
        assert_eq!(def["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_descriptor_serialization() {
        let json = serde_json::to_string(&read_file()).unwrap();
        assert!(json.contains("read_file"));
        assert!(!json.contains("\"version\""));

        let back: ToolDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "read_file");
    }
}
