use kubemem_core::{Error, Result};
use kubemem_k8s_api::{Descriptor, ListMerge};
use serde_json::{Map, Value};

const DIRECTIVE: &str = "$patch";
const DELETE_FROM_SET: &str = "$deleteFromPrimitiveList/";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Directive {
    Merge,
    Replace,
    Delete,
}

/// Applies a strategic merge patch to `original`.
///
/// Maps merge recursively and `null` removes a key. Lists merge according to the strategy the
/// descriptor declares for their path; undeclared lists are replaced. The directives understood
/// are `$patch` (`merge`, `replace`, `delete`) on maps and list elements, and
/// `$deleteFromPrimitiveList/<field>` on the map holding a set-merged list. Other `$` keys are
/// ignored.
pub(crate) fn merge(descriptor: &Descriptor, original: &Value, patch: &Value) -> Result<Value> {
    let merger = Merger { descriptor };
    match merger.value("", Some(original), patch)? {
        Some(merged) => Ok(merged),
        None => Err(Error::InvalidPatch(
            "patch must not delete the object".to_string(),
        )),
    }
}

struct Merger<'d> {
    descriptor: &'d Descriptor,
}

// === impl Merger ===

impl Merger<'_> {
    /// Merges `patch` onto `target`, returning `None` if the value is to be removed.
    fn value(&self, path: &str, target: Option<&Value>, patch: &Value) -> Result<Option<Value>> {
        match patch {
            Value::Null => Ok(None),
            Value::Object(patch) => self.map(path, target.and_then(Value::as_object), patch),
            Value::Array(items) => {
                let target = target.and_then(Value::as_array);
                let merged = match self.descriptor.list_merge(path) {
                    Some(strategy) => self.list(path, target, items, strategy)?,
                    None => items.clone(),
                };
                Ok(Some(Value::Array(merged)))
            }
            scalar => Ok(Some(scalar.clone())),
        }
    }

    fn map(
        &self,
        path: &str,
        target: Option<&Map<String, Value>>,
        patch: &Map<String, Value>,
    ) -> Result<Option<Value>> {
        let mut merged = match directive(patch)? {
            Directive::Delete => return Ok(None),
            Directive::Replace => Map::new(),
            Directive::Merge => target.cloned().unwrap_or_default(),
        };

        let mut removals = Vec::new();
        for (key, value) in patch {
            if let Some(field) = key.strip_prefix(DELETE_FROM_SET) {
                removals.push((field, value));
                continue;
            }
            if key.starts_with('$') {
                continue;
            }
            match self.value(&join(path, key), merged.get(key), value)? {
                Some(value) => {
                    merged.insert(key.clone(), value);
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        for (field, values) in removals {
            let values = values.as_array().ok_or_else(|| {
                Error::InvalidPatch(format!(
                    "{}: {DELETE_FROM_SET}{field} must be a list",
                    join(path, field)
                ))
            })?;
            if let Some(Value::Array(list)) = merged.get_mut(field) {
                list.retain(|v| !values.contains(v));
            }
        }

        Ok(Some(Value::Object(merged)))
    }

    fn list(
        &self,
        path: &str,
        target: Option<&Vec<Value>>,
        items: &[Value],
        strategy: ListMerge,
    ) -> Result<Vec<Value>> {
        // A `{"$patch": "replace"}` element replaces the list with the patch's other elements.
        let replace = items.iter().any(|item| {
            item.as_object().is_some_and(|obj| {
                obj.len() == 1 && obj.get(DIRECTIVE).and_then(Value::as_str) == Some("replace")
            })
        });
        let mut merged = if replace {
            Vec::new()
        } else {
            target.cloned().unwrap_or_default()
        };
        let items = items.iter().filter(|item| {
            !(replace && item.as_object().is_some_and(|obj| obj.contains_key(DIRECTIVE) && obj.len() == 1))
        });

        match strategy {
            ListMerge::Set => {
                for item in items {
                    if !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
            }

            ListMerge::Key(key) => {
                for item in items {
                    let obj = item.as_object().ok_or_else(|| {
                        Error::InvalidPatch(format!(
                            "{path}: list elements must be objects keyed by {key:?}"
                        ))
                    })?;
                    let id = obj.get(key).filter(|v| !v.is_null()).ok_or_else(|| {
                        Error::InvalidPatch(format!("{path}: element is missing merge key {key:?}"))
                    })?;
                    let pos = merged.iter().position(|e| e.get(key) == Some(id));

                    if directive(obj)? == Directive::Delete {
                        if let Some(pos) = pos {
                            merged.remove(pos);
                        }
                        continue;
                    }

                    let existing = pos.and_then(|i| merged[i].as_object());
                    if let Some(element) = self.map(path, existing, obj)? {
                        match pos {
                            Some(i) => merged[i] = element,
                            None => merged.push(element),
                        }
                    }
                }
            }
        }

        Ok(merged)
    }
}

fn directive(patch: &Map<String, Value>) -> Result<Directive> {
    match patch.get(DIRECTIVE) {
        None => Ok(Directive::Merge),
        Some(Value::String(d)) if d == "merge" => Ok(Directive::Merge),
        Some(Value::String(d)) if d == "replace" => Ok(Directive::Replace),
        Some(Value::String(d)) if d == "delete" => Ok(Directive::Delete),
        Some(d) => Err(Error::InvalidPatch(format!("unknown {DIRECTIVE} directive: {d}"))),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
