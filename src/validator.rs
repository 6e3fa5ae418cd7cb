//! Schema validation
//!
//! Parameter and result schemas are compiled once when a plugin is loaded
//! and reused for every invocation. Validation runs before any plugin code.

use crate::schema::ToolDescriptor;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A schema that failed to compile
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {message}")]
pub struct SchemaError {
    pub context: String,
    pub message: String,
}

/// One violated constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer into the argument payload ("" for the root)
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Arguments did not conform to a schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Compiled JSON Schema
pub struct CompiledSchema {
    validator: jsonschema::Validator,
    source: Value,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("source", &self.source)
            .finish()
    }
}

impl CompiledSchema {
    /// Compile a schema document
    pub fn compile(schema: &Value, context: &str) -> Result<Self, SchemaError> {
        let validator = jsonschema::validator_for(schema).map_err(|e| SchemaError {
            context: context.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            validator,
            source: schema.clone(),
        })
    }

    /// Validate an instance, collecting every violation
    pub fn validate(&self, instance: &Value) -> Result<(), ValidationError> {
        let violations: Vec<Violation> = self
            .validator
            .iter_errors(instance)
            .map(|e| Violation {
                path: e.instance_path().to_string(),
                message: e.to_string(),
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations })
        }
    }

}

/// Compiled parameter and result schemas of one descriptor
#[derive(Debug)]
pub struct DescriptorSchemas {
    pub parameters: CompiledSchema,
    pub result: CompiledSchema,
}

impl DescriptorSchemas {
    /// Compile a descriptor's schemas, checking the parameter schema is an
    /// object schema whose required fields are declared properties.
    pub fn compile(descriptor: &ToolDescriptor) -> Result<Self, SchemaError> {
        let context = format!("tool '{}'", descriptor.name);
        check_parameter_shape(&descriptor.parameter_schema, &context)?;

        Ok(Self {
            parameters: CompiledSchema::compile(
                &descriptor.parameter_schema,
                &format!("{context} parameter schema"),
            )?,
            result: CompiledSchema::compile(
                &descriptor.result_schema,
                &format!("{context} result schema"),
            )?,
        })
    }
}

fn check_parameter_shape(schema: &Value, context: &str) -> Result<(), SchemaError> {
    let fail = |message: String| SchemaError {
        context: format!("{context} parameter schema"),
        message,
    };

    let obj = schema
        .as_object()
        .ok_or_else(|| fail("must be a JSON object".to_string()))?;

    match obj.get("type") {
        Some(Value::String(t)) if t == "object" => {}
        other => {
            return Err(fail(format!(
                "must declare \"type\": \"object\", found {}",
                other.map(|v| v.to_string()).unwrap_or_else(|| "nothing".into())
            )))
        }
    }

    if let Some(required) = obj.get("required") {
        let properties = obj.get("properties").and_then(|p| p.as_object());
        let names = required
            .as_array()
            .ok_or_else(|| fail("\"required\" must be an array".to_string()))?;
        for name in names {
            let name = name
                .as_str()
                .ok_or_else(|| fail("\"required\" entries must be strings".to_string()))?;
            if !properties.is_some_and(|p| p.contains_key(name)) {
                return Err(fail(format!("required field '{name}' is not a declared property")));
            }
        }
    }

    Ok(())
}

/// One-shot validation without caching the compiled schema
pub fn validate(arguments: &Value, parameter_schema: &Value) -> Result<(), ValidationError> {
    match CompiledSchema::compile(parameter_schema, "parameter schema") {
        Ok(schema) => schema.validate(arguments),
        Err(e) => Err(ValidationError {
            violations: vec![Violation {
                path: String::new(),
                message: e.to_string(),
            }],
        }),
    }
}

/// `null` arguments mean "no arguments"
pub fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}
