use crate::Descriptor;
use kube::core::DynamicObject;
use kubemem_core::{labels, Error, Result, Selectable};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{borrow::Cow, sync::OnceLock};

/// An object viewed through its kind's descriptor, for evaluation by the match engine.
#[derive(Copy, Clone, Debug)]
pub struct Candidate<'a> {
    descriptor: &'a Descriptor,
    object: &'a DynamicObject,
}

/// Converts a typed resource into the dynamic form the store holds.
pub fn to_dynamic<K: Serialize>(resource: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(resource).map_err(|e| Error::Invalid(e.to_string()))?;
    decode(value)
}

/// Converts a stored object back into its typed form.
pub fn from_dynamic<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    let value = serde_json::to_value(object).map_err(|e| Error::Invalid(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::Invalid(e.to_string()))
}

/// Decodes a JSON document into a dynamic object whose `data` is always a JSON object.
pub fn decode(value: Value) -> Result<DynamicObject> {
    if !value.is_object() {
        return Err(Error::Invalid("object must be a JSON object".to_string()));
    }
    let mut obj: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::Invalid(e.to_string()))?;
    if !obj.data.is_object() {
        obj.data = Value::Object(Default::default());
    }
    Ok(obj)
}

pub(crate) fn name(obj: &DynamicObject) -> &str {
    obj.metadata.name.as_deref().unwrap_or("")
}

// === impl Candidate ===

impl<'a> Candidate<'a> {
    pub fn new(descriptor: &'a Descriptor, object: &'a DynamicObject) -> Self {
        Self { descriptor, object }
    }

    pub fn object(&self) -> &'a DynamicObject {
        self.object
    }
}

impl Selectable for Candidate<'_> {
    fn name(&self) -> &str {
        name(self.object)
    }

    fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    fn labels(&self) -> &labels::Map {
        static EMPTY: OnceLock<labels::Map> = OnceLock::new();
        self.object
            .metadata
            .labels
            .as_ref()
            .unwrap_or_else(|| EMPTY.get_or_init(labels::Map::new))
    }

    fn field(&self, path: &str) -> Option<Cow<'_, str>> {
        self.descriptor.field(self.object, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigMap, Node, NodeSpec, ObjectMeta, Pod, PodSpec};
    use kubemem_core::Criteria;
    use maplit::{btreemap, convert_args};

    #[test]
    fn typed_round_trip() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-0".to_string()),
                labels: Some(convert_args!(btreemap!("zone" => "a"))),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let dynamic = to_dynamic(&node).unwrap();
        assert_eq!(dynamic.metadata.name.as_deref(), Some("node-0"));
        assert_eq!(dynamic.data["spec"]["unschedulable"], true);
        assert_eq!(from_dynamic::<Node>(&dynamic).unwrap(), node);
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(decode(serde_json::json!([1, 2])).is_err());
        let cm = decode(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "c" },
        }))
        .unwrap();
        assert!(cm.data.is_object());
        from_dynamic::<ConfigMap>(&cm).expect("config map must decode");
    }

    #[test]
    fn candidates_resolve_fields_through_descriptor() {
        let pods = Descriptor::of::<Pod>().with_field("spec.nodeName");
        let pod = to_dynamic(&Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        let candidate = Candidate::new(&pods, &pod);

        assert!(candidate.labels().is_empty());
        assert!(Criteria::from_query(Some("ns"), Some(""), Some("spec.nodeName=node-0"))
            .unwrap()
            .matches(&candidate));
        assert!(!Criteria::from_query(None, Some("app"), None)
            .unwrap()
            .matches(&candidate));
        assert!(!Criteria::from_query(None, None, Some("spec.schedulerName=x"))
            .unwrap()
            .matches(&candidate));
    }
}
