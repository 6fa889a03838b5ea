//! Port schemas and semantic format tags.
//!
//! A [`PortSchema`] is a small structural type (object, array, primitive,
//! one-of, any) that may carry a [`FormatTag`]. Task input and output
//! signatures are described by a [`TaskSchema`], an ordered list of named
//! ports.

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Semantic format tag: `name` or `name:qualifier`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatTag {
    name: String,
    qualifier: Option<String>,
}

impl FormatTag {
    /// Creates a bare tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            qualifier: None,
        }
    }

    /// Creates a qualified tag.
    pub fn qualified(name: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    /// Returns the tag name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the qualifier, if any.
    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }

    /// Returns true if the tag has no qualifier.
    pub fn is_bare(&self) -> bool {
        self.qualifier.is_none()
    }
}

impl FromStr for FormatTag {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchemaError::InvalidFormatTag(s.to_string());
        match s.split_once(':') {
            None if !s.is_empty() => Ok(Self::new(s)),
            None => Err(invalid()),
            Some((name, qualifier)) => {
                if name.is_empty() || qualifier.is_empty() || qualifier.contains(':') {
                    return Err(invalid());
                }
                Ok(Self::qualified(name, qualifier))
            }
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}:{}", self.name, q),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Serialize for FormatTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FormatTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Primitive JSON value kinds.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl PrimitiveKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

/// Structural part of a port schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaKind {
    /// Accepts every value
    Any,
    /// JSON object with named fields; fields listed in `required` must be present
    Object {
        #[serde(default)]
        fields: BTreeMap<String, PortSchema>,
        #[serde(default)]
        required: Vec<String>,
    },
    /// Homogeneous JSON array
    Array { items: Box<PortSchema> },
    /// Primitive value
    Primitive { kind: PrimitiveKind },
    /// One of several alternatives
    OneOf { alternatives: Vec<PortSchema> },
}

/// Structural type of a port, optionally carrying a semantic format tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSchema {
    #[serde(flatten)]
    pub kind: SchemaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatTag>,
}

impl PortSchema {
    /// Schema accepting every value.
    pub fn any() -> Self {
        Self::from_kind(SchemaKind::Any)
    }

    pub fn string() -> Self {
        Self::primitive(PrimitiveKind::String)
    }

    pub fn number() -> Self {
        Self::primitive(PrimitiveKind::Number)
    }

    pub fn integer() -> Self {
        Self::primitive(PrimitiveKind::Integer)
    }

    pub fn boolean() -> Self {
        Self::primitive(PrimitiveKind::Boolean)
    }

    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self::from_kind(SchemaKind::Primitive { kind })
    }

    /// Array of `items`.
    pub fn array(items: PortSchema) -> Self {
        Self::from_kind(SchemaKind::Array {
            items: Box::new(items),
        })
    }

    /// Object whose listed fields are all required.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, PortSchema)>,
        K: Into<String>,
    {
        let fields: BTreeMap<String, PortSchema> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let required = fields.keys().cloned().collect();
        Self::from_kind(SchemaKind::Object { fields, required })
    }

    /// One of several alternatives.
    pub fn one_of(alternatives: Vec<PortSchema>) -> Self {
        Self::from_kind(SchemaKind::OneOf { alternatives })
    }

    fn from_kind(kind: SchemaKind) -> Self {
        Self { kind, format: None }
    }

    /// Attaches a format tag.
    pub fn with_format(mut self, tag: FormatTag) -> Self {
        self.format = Some(tag);
        self
    }

    /// Parses and attaches a format tag.
    pub fn try_with_format(self, tag: &str) -> Result<Self, SchemaError> {
        Ok(self.with_format(tag.parse()?))
    }

    /// Returns true if this schema accepts every value.
    pub fn is_any(&self) -> bool {
        matches!(self.kind, SchemaKind::Any)
    }

    /// Checks a value against the structural part of the schema.
    ///
    /// Format tags are not checked here; they belong to the compatibility
    /// checker.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        validate_at(self, value, "$")
    }
}

fn validate_at(schema: &PortSchema, value: &Value, path: &str) -> Result<(), String> {
    match &schema.kind {
        SchemaKind::Any => Ok(()),
        SchemaKind::Primitive { kind } => {
            if kind.matches(value) {
                Ok(())
            } else {
                Err(format!("{}: expected {:?}, found {}", path, kind, type_name(value)))
            }
        }
        SchemaKind::Array { items } => {
            let arr = value
                .as_array()
                .ok_or_else(|| format!("{}: expected array, found {}", path, type_name(value)))?;
            for (i, item) in arr.iter().enumerate() {
                validate_at(items, item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        SchemaKind::Object { fields, required } => {
            let obj = value
                .as_object()
                .ok_or_else(|| format!("{}: expected object, found {}", path, type_name(value)))?;
            for name in required {
                if !obj.contains_key(name) {
                    return Err(format!("{}: missing field '{}'", path, name));
                }
            }
            for (name, field_schema) in fields {
                if let Some(v) = obj.get(name) {
                    validate_at(field_schema, v, &format!("{}.{}", path, name))?;
                }
            }
            Ok(())
        }
        SchemaKind::OneOf { alternatives } => {
            if alternatives
                .iter()
                .any(|alt| validate_at(alt, value, path).is_ok())
            {
                Ok(())
            } else {
                Err(format!("{}: {} matches none of the alternatives", path, type_name(value)))
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named input or output port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    /// Port name, unique within its schema
    pub id: String,
    /// Structural and semantic type
    pub schema: PortSchema,
    /// Whether the port must receive a value (inputs only)
    #[serde(default)]
    pub required: bool,
    /// Value used when nothing is wired or supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

impl PortDefinition {
    /// Creates a required port.
    pub fn required(id: impl Into<String>, schema: PortSchema) -> Self {
        Self {
            id: id.into(),
            schema,
            required: true,
            default_value: None,
        }
    }

    /// Creates an optional port.
    pub fn optional(id: impl Into<String>, schema: PortSchema) -> Self {
        Self {
            id: id.into(),
            schema,
            required: false,
            default_value: None,
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Ordered set of ports making up a task's input or output signature.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSchema {
    ports: Vec<PortDefinition>,
}

impl TaskSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from ports, rejecting duplicate names.
    pub fn from_ports(ports: Vec<PortDefinition>) -> Result<Self, SchemaError> {
        let mut schema = Self::new();
        for port in ports {
            schema = schema.try_port(port)?;
        }
        Ok(schema)
    }

    /// Adds a port, replacing any existing port with the same id.
    pub fn port(mut self, port: PortDefinition) -> Self {
        self.ports.retain(|p| p.id != port.id);
        self.ports.push(port);
        self
    }

    fn try_port(mut self, port: PortDefinition) -> Result<Self, SchemaError> {
        if self.get(&port.id).is_some() {
            return Err(SchemaError::DuplicatePort(port.id));
        }
        self.ports.push(port);
        Ok(self)
    }

    /// Looks up a port by id.
    pub fn get(&self, id: &str) -> Option<&PortDefinition> {
        self.ports.iter().find(|p| p.id == id)
    }

    pub fn ports(&self) -> &[PortDefinition] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Validates a port→value map: required ports present, every supplied
    /// declared port structurally valid. Undeclared keys are ignored.
    pub fn validate(&self, values: &serde_json::Map<String, Value>) -> Result<(), String> {
        for port in &self.ports {
            match values.get(&port.id) {
                Some(v) => port
                    .schema
                    .validate(v)
                    .map_err(|e| format!("port '{}': {}", port.id, e))?,
                None if port.required => {
                    return Err(format!("missing required port '{}'", port.id));
                }
                None => {}
            }
        }
        Ok(())
    }
}
