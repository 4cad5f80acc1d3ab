//! Reference input validator.
//!
//! A command declares the shape of its raw inputs with an [`InputShape`];
//! validation reports every problem at once as `data` errors with data-paths,
//! then deserializes the inputs into the command's typed `Inputs`.
//!
//! ```ignore
//! fn validate_inputs(&self, raw: &RawInputs) -> Result<OrderInputs, Vec<CommandError>> {
//!     InputShape::new()
//!         .required("customer_id", FieldType::String)
//!         .required("lines", FieldType::array_of(FieldType::Object))
//!         .optional("note", FieldType::String)
//!         .validate(raw)
//! }
//! ```
//!
//! Validation is total: malformed input always produces errors, never a panic.

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CommandError, PathSegment};

/// Expected JSON type of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array(Box<FieldType>),
    Any,
}

impl FieldType {
    pub fn array_of(item: FieldType) -> Self {
        FieldType::Array(Box::new(item))
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array(_) => value.is_array(),
            FieldType::Any => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Integer => f.write_str("integer"),
            FieldType::Number => f.write_str("number"),
            FieldType::Boolean => f.write_str("boolean"),
            FieldType::Object => f.write_str("object"),
            FieldType::Array(item) => write!(f, "array of {item}"),
            FieldType::Any => f.write_str("any"),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
}

/// Declared shape of a command's raw inputs.
#[derive(Debug, Clone, Default)]
pub struct InputShape {
    fields: Vec<FieldSpec>,
    allow_unknown: bool,
}

impl InputShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    /// A field that may be absent or `null`.
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// Accept keys that are not declared instead of reporting them.
    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    /// Every shape error in `raw`, in declaration order, unknown keys last.
    pub fn check(&self, raw: &Value) -> Vec<CommandError> {
        let Some(object) = raw.as_object() else {
            return vec![invalid_type(&FieldType::Object, raw)];
        };

        let mut errors = Vec::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    errors.push(
                        CommandError::data(
                            "missing_required_attribute",
                            format!("{} is required", field.name),
                        )
                        .at_field(field.name.as_str()),
                    );
                }
                None | Some(Value::Null) => {}
                Some(value) => check_value(&field.name, &field.ty, value, &mut errors),
            }
        }

        if !self.allow_unknown {
            let mut unknown: Vec<_> = object
                .keys()
                .filter(|key| !self.fields.iter().any(|f| &f.name == *key))
                .collect();
            unknown.sort();
            for key in unknown {
                errors.push(
                    CommandError::data("unexpected_attribute", format!("{key} is not expected"))
                        .at_field(key.as_str()),
                );
            }
        }
        errors
    }

    /// Check the shape, then deserialize into `T`.
    pub fn validate<T: DeserializeOwned>(&self, raw: &Value) -> Result<T, Vec<CommandError>> {
        let errors = self.check(raw);
        if !errors.is_empty() {
            return Err(errors);
        }
        deserialize_inputs(raw)
    }
}

fn invalid_type(expected: &FieldType, actual: &Value) -> CommandError {
    CommandError::data(
        "invalid_type",
        format!("expected {expected}, got {}", json_type(actual)),
    )
    .with_context("expected", expected.to_string())
    .with_context("actual", json_type(actual))
}

fn check_value(field: &str, ty: &FieldType, value: &Value, errors: &mut Vec<CommandError>) {
    if !ty.accepts(value) {
        errors.push(invalid_type(ty, value).at_field(field));
        return;
    }
    // Element types are checked one level deep.
    if let (FieldType::Array(item), Value::Array(items)) = (ty, value) {
        for (index, element) in items.iter().enumerate() {
            if !item.accepts(element) {
                errors.push(invalid_type(item, element).at([
                    PathSegment::from(field),
                    PathSegment::Index(index),
                ]));
            }
        }
    }
}

/// Deserialize raw inputs into `T`, reporting a failure as one
/// `data/invalid_inputs` error.
pub fn deserialize_inputs<T: DeserializeOwned>(raw: &Value) -> Result<T, Vec<CommandError>> {
    serde_json::from_value(raw.clone()).map_err(|e| {
        vec![CommandError::data("invalid_inputs", "inputs could not be read")
            .with_context("reason", e.to_string())]
    })
}
