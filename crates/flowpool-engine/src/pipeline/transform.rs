//! Structural coercion between the item shapes steps expect.
//!
//! A [`Shape`] names a set of required fields. Converters can be registered
//! for a (source shape, destination shape) pair or for a destination alone,
//! in which case they accept items of any shape. Without a converter, an
//! item already tagged with the destination shape is passed through, and any
//! other item is accepted as long as it carries the destination's required
//! fields.

use std::collections::HashMap;
use std::sync::Arc;

use flowpool_core::WorkItem;
use serde_json::Value;

/// Errors from shape coercion.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Unknown shape: {name}")]
    UnknownShape { name: String },

    #[error("Item '{key}' is missing field '{field}' required by shape '{shape}'")]
    MissingField {
        key: String,
        shape: String,
        field: String,
    },

    #[error("Cannot build a '{shape}' item: {reason}")]
    Invalid { shape: String, reason: String },
}

/// A named item shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub name: String,
    pub required: Vec<String>,
    /// Field whose value becomes the key when building items from raw JSON.
    pub key_field: Option<String>,
}

impl Shape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: Vec::new(),
            key_field: None,
        }
    }

    #[must_use]
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    #[must_use]
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }
}

/// Where a converter accepts items from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// Any shape; used when no pair-specific converter matches.
    Any,
    Shape(String),
}

type Converter = Arc<dyn Fn(&WorkItem) -> Result<WorkItem, TransformError> + Send + Sync>;

/// Registry of shapes and converters.
#[derive(Clone, Default)]
pub struct DataTransformer {
    shapes: HashMap<String, Shape>,
    pairs: HashMap<(String, String), Converter>,
    fallbacks: HashMap<String, Converter>,
}

impl std::fmt::Debug for DataTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut shapes: Vec<_> = self.shapes.keys().collect();
        shapes.sort();
        f.debug_struct("DataTransformer")
            .field("shapes", &shapes)
            .field("converters", &(self.pairs.len() + self.fallbacks.len()))
            .finish()
    }
}

impl DataTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_shape(&mut self, shape: Shape) -> &mut Self {
        self.shapes.insert(shape.name.clone(), shape);
        self
    }

    pub fn shape(&self, name: &str) -> Option<&Shape> {
        self.shapes.get(name)
    }

    pub fn register<F>(&mut self, source: Source, dest: impl Into<String>, convert: F) -> &mut Self
    where
        F: Fn(&WorkItem) -> Result<WorkItem, TransformError> + Send + Sync + 'static,
    {
        let dest = dest.into();
        let convert: Converter = Arc::new(convert);
        match source {
            Source::Any => {
                self.fallbacks.insert(dest, convert);
            }
            Source::Shape(src) => {
                self.pairs.insert((src, dest), convert);
            }
        }
        self
    }

    /// Coerce `item` into shape `dest`. The result is tagged with `dest`.
    pub fn transform(&self, item: &WorkItem, dest: &str) -> Result<WorkItem, TransformError> {
        let pair = item
            .shape()
            .and_then(|src| self.pairs.get(&(src.to_string(), dest.to_string())));
        let mut out = match pair.or_else(|| self.fallbacks.get(dest)) {
            Some(convert) => convert(item)?,
            None => self.default_transform(item, dest)?,
        };
        out.set_shape(dest);
        Ok(out)
    }

    pub fn transform_list(
        &self,
        items: &[WorkItem],
        dest: &str,
    ) -> Result<Vec<WorkItem>, TransformError> {
        items.iter().map(|item| self.transform(item, dest)).collect()
    }

    /// Build an item of shape `dest` from raw JSON, deriving the key from
    /// the shape's key field when the value has no `key`.
    pub fn from_value(&self, value: Value, dest: &str) -> Result<WorkItem, TransformError> {
        let shape = self.shapes.get(dest).ok_or_else(|| TransformError::UnknownShape {
            name: dest.to_string(),
        })?;
        let item = WorkItem::from_value(value, shape.key_field.as_deref()).map_err(|e| {
            TransformError::Invalid {
                shape: dest.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.transform(&item, dest)
    }

    fn default_transform(&self, item: &WorkItem, dest: &str) -> Result<WorkItem, TransformError> {
        if item.shape() == Some(dest) {
            return Ok(item.clone());
        }
        let shape = self.shapes.get(dest).ok_or_else(|| TransformError::UnknownShape {
            name: dest.to_string(),
        })?;
        if let Some(field) = shape.required.iter().find(|field| !item.contains(field)) {
            return Err(TransformError::MissingField {
                key: item.key().to_string(),
                shape: dest.to_string(),
                field: field.clone(),
            });
        }
        Ok(item.clone())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer() -> DataTransformer {
        let mut t = DataTransformer::new();
        t.register_shape(Shape::new("document").require("text"))
            .register_shape(Shape::new("container").require("objects").key_field("container_id"))
            .register_shape(Shape::new("summary").require("words"));
        t
    }

    #[test]
    fn structural_default_checks_required_fields() {
        let t = transformer();
        let doc = t
            .transform(&WorkItem::new("d").with_field("text", "hi"), "document")
            .unwrap();
        assert_eq!(doc.shape(), Some("document"));

        let err = t.transform(&WorkItem::new("d"), "document").unwrap_err();
        assert!(matches!(err, TransformError::MissingField { field, .. } if field == "text"));
    }

    #[test]
    fn same_shape_is_identity() {
        let t = transformer();
        let mut item = WorkItem::new("d");
        item.set_shape("summary");
        // Already a summary, so the missing field is not re-checked.
        let out = t.transform(&item, "summary").unwrap();
        assert_eq!(out, item);
    }

    #[test]
    fn pair_converter_beats_fallback() {
        let mut t = transformer();
        t.register(Source::Any, "summary", |item| {
            Ok(item.clone().with_field("words", 0))
        })
        .register(Source::Shape("document".into()), "summary", |item| {
            let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(WorkItem::new(item.key()).with_field("words", text.split_whitespace().count()))
        });

        let mut doc = WorkItem::new("d").with_field("text", "one two three");
        doc.set_shape("document");
        assert_eq!(t.transform(&doc, "summary").unwrap().get("words"), Some(&json!(3)));

        let plain = WorkItem::new("p");
        assert_eq!(t.transform(&plain, "summary").unwrap().get("words"), Some(&json!(0)));
    }

    #[test]
    fn from_value_uses_key_field() {
        let t = transformer();
        let item = t
            .from_value(json!({"container_id": "c1", "objects": ["a"]}), "container")
            .unwrap();
        assert_eq!(item.key(), "c1");
        assert_eq!(item.shape(), Some("container"));

        assert!(matches!(
            t.from_value(json!({"objects": []}), "container"),
            Err(TransformError::Invalid { .. })
        ));
        assert!(matches!(
            t.from_value(json!({"key": "k"}), "nope"),
            Err(TransformError::UnknownShape { .. })
        ));
    }

    #[test]
    fn transform_list_fails_on_first_bad_item() {
        let t = transformer();
        let items = vec![
            WorkItem::new("a").with_field("text", "x"),
            WorkItem::new("b"),
        ];
        assert!(t.transform_list(&items, "document").is_err());
    }
}
