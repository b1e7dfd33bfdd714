use crate::object;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use kubemem_core::{Error, ObjectKey, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{borrow::Cow, fmt, marker::PhantomData};

/// Describes a resource kind: its identity, scope, subresources and patch/selection schema.
pub struct Descriptor {
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    api_version: &'static str,
    plural: &'static str,
    list_kind: String,
    namespaced: bool,
    status_subresource: bool,
    lists: Vec<(&'static str, ListMerge)>,
    conditions: Vec<&'static str>,
    fields: Vec<FieldPath>,
    ops: Box<dyn KindOps>,
}

/// How a strategic merge patch combines a list field.
///
/// Lists without a declared strategy are replaced wholesale.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListMerge {
    /// Elements are objects identified by the named key; patch elements replace or extend the
    /// element with the same key.
    Key(&'static str),

    /// Elements are scalars; patch elements are added if missing.
    Set,
}

/// A field-selector label and the object path it reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    pub label: &'static str,
    pub path: &'static str,
}

/// The per-kind capabilities that depend on the kind's concrete type.
pub trait KindOps: Send + Sync + 'static {
    /// Returns a zero-valued object of this kind.
    fn empty(&self) -> Value;

    /// Checks that `object` decodes as this kind.
    fn validate(&self, object: &Value) -> std::result::Result<(), String>;
}

/// Maps a `k8s_openapi` resource scope to whether the kind is namespaced.
pub trait ResourceScopeExt {
    const NAMESPACED: bool;
}

struct Typed<K>(PhantomData<fn() -> K>);

// === impl Descriptor ===

impl Descriptor {
    /// Describes a `k8s_openapi` kind. Further schema is declared with the `with_*` builders.
    pub fn of<K>() -> Self
    where
        K: k8s_openapi::Resource + Default + Serialize + DeserializeOwned + 'static,
        K::Scope: ResourceScopeExt,
    {
        Self {
            group: K::GROUP,
            version: K::VERSION,
            kind: K::KIND,
            api_version: K::API_VERSION,
            plural: K::URL_PATH_SEGMENT,
            list_kind: format!("{}List", K::KIND),
            namespaced: <K::Scope as ResourceScopeExt>::NAMESPACED,
            status_subresource: false,
            lists: vec![
                ("metadata.ownerReferences", ListMerge::Key("uid")),
                ("metadata.finalizers", ListMerge::Set),
            ],
            conditions: Vec::new(),
            fields: Vec::new(),
            ops: Box::new(Typed::<K>(PhantomData)),
        }
    }

    pub fn with_status(mut self) -> Self {
        self.status_subresource = true;
        self
    }

    pub fn with_list(mut self, path: &'static str, merge: ListMerge) -> Self {
        self.lists.push((path, merge));
        self
    }

    /// Declares a list of conditions, merged by `type`, whose `lastTransitionTime` is maintained
    /// by the server.
    pub fn with_conditions(mut self, path: &'static str) -> Self {
        self.conditions.push(path);
        self.with_list(path, ListMerge::Key("type"))
    }

    pub fn with_field(self, path: &'static str) -> Self {
        self.with_field_alias(path, path)
    }

    /// Declares a field-selector label that reads a differently-named path.
    pub fn with_field_alias(mut self, label: &'static str, path: &'static str) -> Self {
        self.fields.push(FieldPath { label, path });
        self
    }

    pub fn group(&self) -> &'static str {
        self.group
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn api_version(&self) -> &'static str {
        self.api_version
    }

    pub fn plural(&self) -> &'static str {
        self.plural
    }

    pub fn list_kind(&self) -> &str {
        &self.list_kind
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group, self.version, self.kind)
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta {
            api_version: self.api_version.to_string(),
            kind: self.kind.to_string(),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    pub fn has_status(&self) -> bool {
        self.status_subresource
    }

    /// Returns the strategic-merge strategy for the list at `path`, if one is declared.
    ///
    /// Paths are dotted object keys; list elements do not contribute a segment, so the ports of
    /// every pod container are at `spec.containers.ports`.
    pub fn list_merge(&self, path: &str) -> Option<ListMerge> {
        self.lists
            .iter()
            .find(|(p, _)| *p == path)
            .map(|(_, merge)| *merge)
    }

    pub fn condition_paths(&self) -> &[&'static str] {
        &self.conditions
    }

    pub fn supports_field(&self, label: &str) -> bool {
        self.fields.iter().any(|f| f.label == label)
    }

    pub fn ops(&self) -> &dyn KindOps {
        &*self.ops
    }

    /// Returns a zero-valued object of this kind.
    pub fn empty(&self) -> Result<DynamicObject> {
        object::decode(self.ops.empty())
    }

    /// Returns an empty list of this kind at the given resource version.
    pub fn empty_list(&self, resource_version: kubemem_core::ResourceVersion) -> Value {
        serde_json::json!({
            "apiVersion": self.api_version,
            "kind": self.list_kind,
            "metadata": { "resourceVersion": resource_version.to_string() },
            "items": [],
        })
    }

    /// Checks that an object is well-formed for this kind: its type matches and its payload
    /// decodes as the kind's concrete type.
    pub fn validate(&self, obj: &DynamicObject) -> Result<()> {
        if let Some(types) = obj.types.as_ref() {
            if types.api_version != self.api_version || types.kind != self.kind {
                return Err(Error::Invalid(format!(
                    "expected {}/{}, got {}/{}",
                    self.api_version, self.kind, types.api_version, types.kind
                )));
            }
        }
        let value = serde_json::to_value(obj).map_err(|e| Error::Invalid(e.to_string()))?;
        self.ops
            .validate(&value)
            .map_err(|e| Error::Invalid(format!("{} {:?}: {e}", self.kind, object::name(obj))))
    }

    /// Returns an object's storage key, checking that its scope matches the kind's.
    pub fn key(&self, obj: &DynamicObject) -> Result<ObjectKey> {
        let name = match obj.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(Error::Invalid(format!(
                    "{}: metadata.name is required",
                    self.kind
                )))
            }
        };
        let namespace = obj.metadata.namespace.as_deref().filter(|ns| !ns.is_empty());
        match (self.namespaced, namespace) {
            (true, None) => Err(Error::Invalid(format!(
                "{} {name:?}: metadata.namespace is required",
                self.kind
            ))),
            (false, Some(ns)) => Err(Error::Invalid(format!(
                "{} {name:?} is cluster-scoped but has namespace {ns:?}",
                self.kind
            ))),
            (_, ns) => Ok(ObjectKey::new(ns, name)),
        }
    }

    pub fn status<'o>(&self, obj: &'o DynamicObject) -> Option<&'o Value> {
        obj.data.get("status")
    }

    /// Replaces an object's status subtree.
    pub fn set_status(&self, obj: &mut DynamicObject, status: Option<Value>) {
        if !obj.data.is_object() {
            obj.data = Value::Object(Default::default());
        }
        if let Some(data) = obj.data.as_object_mut() {
            match status {
                Some(status) => {
                    data.insert("status".to_string(), status);
                }
                None => {
                    data.remove("status");
                }
            }
        }
    }

    /// Resolves a field-selector label against an object.
    ///
    /// Returns `None` if the kind does not declare the label. A declared field that is unset
    /// resolves to the empty string.
    pub fn field<'o>(&self, obj: &'o DynamicObject, label: &str) -> Option<Cow<'o, str>> {
        let field = self.fields.iter().find(|f| f.label == label)?;
        let mut value = &obj.data;
        for segment in field.path.split('.') {
            value = match value.get(segment) {
                Some(v) => v,
                None => return Some(Cow::Borrowed("")),
            };
        }
        Some(match value {
            Value::String(s) => Cow::Borrowed(s.as_str()),
            Value::Bool(b) => Cow::Owned(b.to_string()),
            Value::Number(n) => Cow::Owned(n.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => Cow::Borrowed(""),
        })
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("api_version", &self.api_version)
            .field("kind", &self.kind)
            .field("plural", &self.plural)
            .field("namespaced", &self.namespaced)
            .field("status_subresource", &self.status_subresource)
            .finish()
    }
}

// === impl Typed ===

impl<K> KindOps for Typed<K>
where
    K: k8s_openapi::Resource + Default + Serialize + DeserializeOwned + 'static,
{
    fn empty(&self) -> Value {
        serde_json::to_value(K::default()).unwrap_or_else(|_| {
            serde_json::json!({
                "apiVersion": K::API_VERSION,
                "kind": K::KIND,
                "metadata": {},
            })
        })
    }

    fn validate(&self, object: &Value) -> std::result::Result<(), String> {
        K::deserialize(object).map(|_| ()).map_err(|e| e.to_string())
    }
}

// === impl ResourceScopeExt ===

impl ResourceScopeExt for k8s_openapi::NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ResourceScopeExt for k8s_openapi::ClusterResourceScope {
    const NAMESPACED: bool = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node, Pod};

    fn pod(data: Value) -> DynamicObject {
        object::decode(data).unwrap()
    }

    #[test]
    fn identity_from_openapi_type() {
        let desc = Descriptor::of::<Pod>();
        assert_eq!(desc.kind(), "Pod");
        assert_eq!(desc.group(), "");
        assert_eq!(desc.api_version(), "v1");
        assert_eq!(desc.plural(), "pods");
        assert_eq!(desc.list_kind(), "PodList");
        assert!(desc.is_namespaced());
        assert!(!Descriptor::of::<Node>().is_namespaced());
    }

    #[test]
    fn keys_follow_scope() {
        let pods = Descriptor::of::<Pod>();
        let nodes = Descriptor::of::<Node>();

        let namespaced = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": "p", "namespace": "ns" },
        }));
        assert_eq!(pods.key(&namespaced).unwrap(), ObjectKey::namespaced("ns", "p"));
        assert!(matches!(nodes.key(&namespaced), Err(Error::Invalid(_))));

        let unscoped = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" },
        }));
        assert!(matches!(pods.key(&unscoped), Err(Error::Invalid(_))));

        let unnamed = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": { "namespace": "ns" },
        }));
        assert!(matches!(pods.key(&unnamed), Err(Error::Invalid(_))));
    }

    #[test]
    fn validates_type_and_payload() {
        let desc = Descriptor::of::<Pod>();
        let ok = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": "p", "namespace": "ns" },
            "spec": { "containers": [{ "name": "c" }] },
        }));
        desc.validate(&ok).expect("pod must validate");

        let wrong_kind = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Node", "metadata": { "name": "p" },
        }));
        assert!(matches!(desc.validate(&wrong_kind), Err(Error::Invalid(_))));

        let bad_payload = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": "p", "namespace": "ns" },
            "spec": { "containers": "nope" },
        }));
        assert!(matches!(desc.validate(&bad_payload), Err(Error::Invalid(_))));
    }

    #[test]
    fn resolves_declared_fields() {
        let desc = Descriptor::of::<Pod>()
            .with_field("spec.nodeName")
            .with_field("spec.hostNetwork")
            .with_field("status.phase");
        let obj = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": "p", "namespace": "ns" },
            "spec": { "nodeName": "node-0", "hostNetwork": true },
        }));
        assert_eq!(desc.field(&obj, "spec.nodeName").as_deref(), Some("node-0"));
        assert_eq!(desc.field(&obj, "spec.hostNetwork").as_deref(), Some("true"));
        assert_eq!(desc.field(&obj, "status.phase").as_deref(), Some(""));
        assert_eq!(desc.field(&obj, "spec.schedulerName"), None);
    }

    #[test]
    fn status_subtree() {
        let desc = Descriptor::of::<Pod>().with_status();
        let mut obj = pod(serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": { "name": "p", "namespace": "ns" },
        }));
        assert_eq!(desc.status(&obj), None);
        desc.set_status(&mut obj, Some(serde_json::json!({ "phase": "Running" })));
        assert_eq!(
            desc.status(&obj),
            Some(&serde_json::json!({ "phase": "Running" }))
        );
        desc.set_status(&mut obj, None);
        assert_eq!(desc.status(&obj), None);
    }

    #[test]
    fn empty_objects() {
        let desc = Descriptor::of::<Node>();
        let empty = desc.empty().unwrap();
        assert_eq!(empty.types.as_ref().map(|t| t.kind.as_str()), Some("Node"));
        assert_eq!(
            desc.empty_list(kubemem_core::ResourceVersion::new(3))["kind"],
            "NodeList"
        );
    }
}
