//! Work items and statuses.
//!
//! A [`WorkItem`] is the keyed unit of data flowing through a pipeline. It
//! carries a [`Status`] so that a failure on one item never has to be thrown:
//! callers inspect per-item status instead of catching errors.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Named payload fields of a work item.
pub type Fields = serde_json::Map<String, Value>;

/// Field names that are part of the item envelope rather than its payload.
const RESERVED_FIELDS: [&str; 3] = ["key", "status", "_shape"];

/// Outcome code attached to a work item or a worker result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    #[default]
    Ok,
    InternalError,
    ContentNotFound,
    ConnectionError,
    InvalidInput,
}

impl StatusCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InternalError => "internal_error",
            Self::ContentNotFound => "content_not_found",
            Self::ConnectionError => "connection_error",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code plus an optional human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Status {
    pub const fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, message)
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self.code, StatusCode::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Keyed, status-bearing unit of data.
///
/// The key is fixed at construction. Serialises flat: the key, the status and
/// every payload field sit side by side in one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    key: String,
    #[serde(default)]
    status: Status,
    /// Name of the shape this item was last coerced into, if any.
    #[serde(default, rename = "_shape", skip_serializing_if = "Option::is_none")]
    shape: Option<String>,
    #[serde(flatten)]
    fields: Fields,
}

impl WorkItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: Status::ok(),
            shape: None,
            fields: Fields::new(),
        }
    }

    /// Build an item from a JSON object.
    ///
    /// The key is read from `"key"`; when absent and `key_field` is given,
    /// the value of that field becomes the key (it must be a string or a
    /// number).
    pub fn from_value(value: Value, key_field: Option<&str>) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::InvalidItem("expected a JSON object".into()));
        };

        let key = match map.remove("key") {
            Some(key) => key_string(&key)?,
            None => {
                let field = key_field
                    .ok_or_else(|| Error::InvalidItem("missing 'key' field".into()))?;
                let key = map.get(field).ok_or_else(|| {
                    Error::InvalidItem(format!("missing key field '{field}'"))
                })?;
                key_string(key)?
            }
        };

        let status = match map.remove("status") {
            Some(status) => serde_json::from_value(status)?,
            None => Status::ok(),
        };
        let shape = match map.remove("_shape") {
            Some(Value::String(shape)) => Some(shape),
            _ => None,
        };

        Ok(Self {
            key,
            status,
            shape,
            fields: map,
        })
    }

    /// Build an item whose fields are the serialised form of `value`.
    pub fn from_typed<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        let mut item = Self::new(key);
        match serde_json::to_value(value)? {
            Value::Object(map) => {
                for (name, value) in map {
                    item.set(name, value);
                }
                Ok(item)
            }
            other => Err(Error::InvalidItem(format!(
                "typed value must serialise to an object, got {other}"
            ))),
        }
    }

    /// Deserialise the payload fields (plus `key`) into `T`.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        let mut map = self.fields.clone();
        map.insert("key".into(), Value::String(self.key.clone()));
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub const fn status(&self) -> &Status {
        &self.status
    }

    pub const fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn shape(&self) -> Option<&str> {
        self.shape.as_deref()
    }

    pub fn set_shape(&mut self, shape: impl Into<String>) {
        self.shape = Some(shape.into());
    }

    pub const fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Like [`get`](Self::get) but also resolves `"key"` to the item key.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if name == "key" {
            return Some(Value::String(self.key.clone()));
        }
        self.fields.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        name == "key" || self.fields.contains_key(name)
    }

    /// Set a payload field. Envelope names (`key`, `status`, `_shape`) are
    /// ignored.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        if RESERVED_FIELDS.contains(&name.as_str()) {
            tracing::debug!(key = %self.key, field = %name, "Ignoring reserved field name");
            return;
        }
        self.fields.insert(name, value.into());
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Overwrite fields with `fields`, keeping the key and the status.
    pub fn extend(&mut self, fields: Fields) {
        for (name, value) in fields {
            self.set(name, value);
        }
    }

    /// Combine two items: `other`'s fields win, `self`'s key is kept, and the
    /// status is always taken from `other`.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.extend(other.fields.clone());
        merged.status = other.status.clone();
        if other.shape.is_some() {
            merged.shape.clone_from(&other.shape);
        }
        merged
    }
}

fn key_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::InvalidItem(format!(
            "key must be a string or a number, got {other}"
        ))),
    }
}
