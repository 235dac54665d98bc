//! Record type declarations: attributes, relations and computed properties.

use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use super::Record;
use crate::error::StoreError;
use crate::store::DataHash;

/// JSON shape an attribute accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Integer => "integer",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        }
    }
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    Attr(ValueType),
    /// Holds the id (or placeholder store key) of one record of the named type.
    ToOne(String),
    /// Holds an array of ids (or placeholders) of records of the named type.
    ToMany(String),
}

pub type Validator = Rc<dyn Fn(&Value, &Record) -> Option<String>>;

#[derive(Clone)]
pub struct AttributeDef {
    pub key: String,
    pub kind: AttributeKind,
    pub nullable: bool,
    pub default: Option<Value>,
    pub no_sync: bool,
    pub validate: Option<Validator>,
    pub validity_dependencies: Vec<String>,
}

impl fmt::Debug for AttributeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDef")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("nullable", &self.nullable)
            .field("default", &self.default)
            .field("no_sync", &self.no_sync)
            .field("validated", &self.validate.is_some())
            .finish()
    }
}

impl AttributeDef {
    pub fn new(key: impl Into<String>, kind: AttributeKind) -> Self {
        AttributeDef {
            key: key.into(),
            kind,
            nullable: true,
            default: None,
            no_sync: false,
            validate: None,
            validity_dependencies: Vec::new(),
        }
    }

    pub fn attr(key: impl Into<String>, value_type: ValueType) -> Self {
        AttributeDef::new(key, AttributeKind::Attr(value_type))
    }

    pub fn to_one(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        AttributeDef::new(key, AttributeKind::ToOne(type_name.into()))
    }

    pub fn to_many(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        AttributeDef::new(key, AttributeKind::ToMany(type_name.into()))
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Keep the attribute local: it never appears in commit payloads and
    /// changing it does not make the record dirty.
    pub fn no_sync(mut self) -> Self {
        self.no_sync = true;
        self
    }

    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value, &Record) -> Option<String> + 'static,
    {
        self.validate = Some(Rc::new(validator));
        self
    }

    /// Other attributes whose changes re-run this attribute's validator.
    pub fn validity_dependencies(mut self, keys: &[&str]) -> Self {
        self.validity_dependencies = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn target_type(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::ToOne(t) | AttributeKind::ToMany(t) => Some(t),
            AttributeKind::Attr(_) => None,
        }
    }

    /// Check `value` before a write.
    ///
    /// `Ok(false)` rejects null on a non-nullable attribute without failing;
    /// a value of the wrong shape is an error.
    pub fn will_set(&self, value: &Value) -> Result<bool, StoreError> {
        if value.is_null() {
            return Ok(self.nullable);
        }
        let ok = match &self.kind {
            AttributeKind::Attr(value_type) => value_type.matches(value),
            AttributeKind::ToOne(_) => value.is_string(),
            AttributeKind::ToMany(_) => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
        };
        if ok {
            return Ok(true);
        }
        Err(StoreError::TypeMismatch {
            attribute: self.key.clone(),
            expected: self.expected_name(),
            found: describe(value).to_string(),
        })
    }

    fn expected_name(&self) -> String {
        match &self.kind {
            AttributeKind::Attr(value_type) => value_type.name().to_string(),
            AttributeKind::ToOne(t) => format!("reference to {}", t),
            AttributeKind::ToMany(t) => format!("references to {}", t),
        }
    }
}

pub type ComputeFn = Rc<dyn Fn(&Record) -> Value>;

#[derive(Clone)]
pub struct ComputedDef {
    pub key: String,
    pub dependencies: Vec<String>,
    pub volatile: bool,
    pub compute: ComputeFn,
}

impl fmt::Debug for ComputedDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedDef")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .field("volatile", &self.volatile)
            .finish()
    }
}

/// Declaration of a record type. The primary key is always `id`.
#[derive(Debug, Clone)]
pub struct RecordType {
    name: String,
    attributes: Vec<AttributeDef>,
    computed: Vec<ComputedDef>,
}

impl RecordType {
    pub const PRIMARY_KEY: &'static str = "id";

    pub fn new(name: impl Into<String>) -> Self {
        RecordType {
            name: name.into(),
            attributes: Vec::new(),
            computed: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.retain(|a| a.key != attribute.key);
        self.attributes.push(attribute);
        self
    }

    /// Declare a cached computed property over `dependencies`.
    pub fn with_computed<F>(mut self, key: &str, dependencies: &[&str], compute: F) -> Self
    where
        F: Fn(&Record) -> Value + 'static,
    {
        self.computed.push(ComputedDef {
            key: key.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            volatile: false,
            compute: Rc::new(compute),
        });
        self
    }

    /// Like [`with_computed`](Self::with_computed) but never cached and never
    /// announced to observers.
    pub fn with_volatile<F>(mut self, key: &str, dependencies: &[&str], compute: F) -> Self
    where
        F: Fn(&Record) -> Value + 'static,
    {
        self.computed.push(ComputedDef {
            key: key.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            volatile: true,
            compute: Rc::new(compute),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.key == key)
    }

    pub fn computed(&self) -> &[ComputedDef] {
        &self.computed
    }

    pub fn computed_property(&self, key: &str) -> Option<&ComputedDef> {
        self.computed.iter().find(|c| c.key == key)
    }

    /// Attribute values for a freshly created record.
    pub fn default_hash(&self) -> DataHash {
        self.attributes
            .iter()
            .filter_map(|a| a.default.clone().map(|v| (a.key.clone(), v)))
            .collect()
    }

    /// Whether changes to `key` are sent to sources. Keys without a
    /// declaration are synced.
    pub fn is_synced(&self, key: &str) -> bool {
        self.attribute(key).map(|a| !a.no_sync).unwrap_or(true)
    }

    /// Copy of `hash` without local-only attributes.
    pub fn synced_payload(&self, hash: &DataHash) -> DataHash {
        hash.iter()
            .filter(|(key, _)| self.is_synced(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Validated attributes affected by a change to any of `changed`.
    pub(crate) fn validators_for<'a>(
        &'a self,
        changed: &'a [String],
    ) -> impl Iterator<Item = &'a AttributeDef> + 'a {
        self.attributes.iter().filter(move |a| {
            a.validate.is_some()
                && (changed.contains(&a.key)
                    || a.validity_dependencies.iter().any(|d| changed.contains(d)))
        })
    }
}
