//! Declared step parameters and their resolution.
//!
//! Each step declares the parameters its processor needs. Before the
//! processor runs, every parameter is looked up, in order, in the current
//! item's fields, the item's meta snapshot, the invocation globals, and
//! finally the parameter's default. A missing required parameter fails the
//! invocation; a missing optional one is simply absent from [`Args`].

use std::collections::HashMap;

use flowpool_core::WorkItem;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::StepError;
use super::meta::Meta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Item field, then meta snapshot, then globals.
    Item,
    /// Meta snapshot, then globals; never the item itself.
    Meta,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: String,
    binding: Binding,
    required: bool,
    default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: Binding::Item,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            required: false,
            default: Some(default.into()),
            ..Self::required(name)
        }
    }

    /// Required parameter read only from metadata.
    pub fn meta(name: impl Into<String>) -> Self {
        Self {
            binding: Binding::Meta,
            ..Self::required(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, field: &str, item: Option<&WorkItem>, meta: &Meta) -> Option<Value> {
        if let Some(item) = item {
            if self.binding == Binding::Item
                && let Some(value) = item.lookup(field)
            {
                return Some(value);
            }
            if let Some(value) = meta.field(item.key(), field) {
                return Some(value);
            }
        }
        meta.global(&self.name)
            .or_else(|| self.default.clone())
    }
}

/// Resolve `params` for one invocation. `item` is the current item for
/// per-item calls and `None` for whole-batch calls; `renames` maps a
/// parameter name to the field it is read from.
pub(crate) fn resolve(
    params: &[Param],
    renames: &HashMap<String, String>,
    item: Option<&WorkItem>,
    meta: &Meta,
) -> Result<Args, StepError> {
    let mut values = HashMap::with_capacity(params.len());
    for param in params {
        let field = renames
            .get(&param.name)
            .map_or(param.name.as_str(), String::as_str);
        match param.lookup(field, item, meta) {
            Some(value) => {
                values.insert(param.name.clone(), value);
            }
            None if param.required => {
                return Err(StepError::MissingParam {
                    param: param.name.clone(),
                    key: item.map(|i| i.key().to_string()),
                });
            }
            None => {}
        }
    }
    Ok(Args { values })
}

/// Resolved parameter values handed to a processor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: HashMap<String, Value>,
}

impl Args {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Typed value of a parameter that must be present.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, StepError> {
        let value = self.values.get(name).ok_or_else(|| StepError::MissingParam {
            param: name.to_string(),
            key: None,
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| StepError::Failed(format!("parameter '{name}': {e}")))
    }

    /// Typed value of an optional parameter.
    pub fn opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StepError> {
        if self.contains(name) {
            self.get(name).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_renames() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn item_field_wins_over_meta_and_globals() {
        let meta = Meta::new().with_global("text", "global");
        meta.seed(&[WorkItem::new("x").with_field("text", "snapshot")]);
        let item = WorkItem::new("x").with_field("text", "item");

        let args = resolve(&[Param::required("text")], &no_renames(), Some(&item), &meta).unwrap();
        assert_eq!(args.get::<String>("text").unwrap(), "item");
    }

    #[test]
    fn falls_back_to_snapshot_then_globals_then_default() {
        let meta = Meta::new().with_global("language", "en");
        meta.seed(&[WorkItem::new("x").with_field("text", "from meta")]);
        let item = WorkItem::new("x");

        let params = [
            Param::required("text"),
            Param::required("language"),
            Param::with_default("min_len", 2),
        ];
        let args = resolve(&params, &no_renames(), Some(&item), &meta).unwrap();
        assert_eq!(args.get::<String>("text").unwrap(), "from meta");
        assert_eq!(args.get::<String>("language").unwrap(), "en");
        assert_eq!(args.get::<u32>("min_len").unwrap(), 2);
    }

    #[test]
    fn meta_binding_ignores_item_fields() {
        let meta = Meta::new();
        meta.seed(&[WorkItem::new("x").with_field("text", "original")]);
        let item = WorkItem::new("x").with_field("text", "rewritten");

        let args = resolve(&[Param::meta("text")], &no_renames(), Some(&item), &meta).unwrap();
        assert_eq!(args.value("text"), Some(&json!("original")));
    }

    #[test]
    fn rename_maps_param_to_field_and_key_resolves() {
        let renames = HashMap::from([
            ("text".to_string(), "content".to_string()),
            ("doc_id".to_string(), "key".to_string()),
        ]);
        let item = WorkItem::new("doc-7").with_field("content", "body");
        let params = [Param::required("text"), Param::required("doc_id")];

        let args = resolve(&params, &renames, Some(&item), &Meta::new()).unwrap();
        assert_eq!(args.get::<String>("text").unwrap(), "body");
        assert_eq!(args.get::<String>("doc_id").unwrap(), "doc-7");
    }

    #[test]
    fn missing_required_fails_and_optional_is_skipped() {
        let item = WorkItem::new("x");
        let err = resolve(&[Param::required("text")], &no_renames(), Some(&item), &Meta::new())
            .unwrap_err();
        assert!(
            matches!(err, StepError::MissingParam { param, key } if param == "text" && key.as_deref() == Some("x"))
        );

        let args = resolve(&[Param::optional("text")], &no_renames(), Some(&item), &Meta::new())
            .unwrap();
        assert!(!args.contains("text"));
        assert_eq!(args.opt::<String>("text").unwrap(), None);
    }

    #[test]
    fn batch_calls_only_see_globals() {
        let meta = Meta::new().with_global("bucket", "replies");
        let args = resolve(
            &[Param::required("bucket"), Param::optional("text")],
            &no_renames(),
            None,
            &meta,
        )
        .unwrap();
        assert_eq!(args.get::<String>("bucket").unwrap(), "replies");
        assert!(!args.contains("text"));
    }
}
