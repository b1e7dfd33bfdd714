use crate::{List, Store, Watch};
use kubemem_core::{Criteria, Error, ObjectKey, ResourceVersion, Result};
use kubemem_k8s_api::{DynamicObject, Patch};
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc, time::Duration};

/// How derived views are addressed and marked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewConfig {
    /// The path prefix under which derived views are addressed, e.g. `/views`.
    pub prefix: String,

    /// The label that records which derived view an object belongs to.
    pub label: String,
}

/// The set of objects visible through a view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    /// Every object in the store.
    #[default]
    All,

    Partition(Arc<Partition>),
}

/// The objects labeled as belonging to one derived view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub value: String,

    /// If set, namespaced objects must be in one of these namespaces.
    pub namespaces: Option<BTreeSet<String>>,
}

/// A named, scoped facade over a [`Store`].
///
/// Every operation is confined to the view's [`Scope`], layered on top of the caller's criteria.
/// All views of a store share its tables, its resource-version sequence and its watch machinery.
#[derive(Clone, Debug)]
pub struct View {
    name: Option<Arc<str>>,
    path: Arc<str>,
    store: Store,
    scope: Scope,
}

// === impl ViewConfig ===

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            prefix: "/views".to_string(),
            label: "kubemem.io/view".to_string(),
        }
    }
}

impl ViewConfig {
    /// Returns the path that addresses the derived view `name`.
    pub fn path(&self, name: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), name)
    }

    /// Finds the derived view addressed by `path`, if any.
    ///
    /// A path addresses a view if it is the view's path or lies beneath it.
    pub fn parse<'p>(&self, path: &'p str) -> Option<&'p str> {
        let prefix = self.prefix.trim_end_matches('/');
        let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
        let name = rest.split('/').next().unwrap_or_default();
        (!name.is_empty()).then_some(name)
    }
}

// === impl Scope ===

impl Scope {
    pub fn partition(label: impl ToString, value: impl ToString) -> Self {
        Self::Partition(Arc::new(Partition {
            label: label.to_string(),
            value: value.to_string(),
            namespaces: None,
        }))
    }

    /// Restricts a partition's namespaced objects to the given namespaces.
    pub fn with_namespaces(self, namespaces: impl IntoIterator<Item = impl ToString>) -> Self {
        match self {
            Self::All => Self::All,
            Self::Partition(p) => Self::Partition(Arc::new(Partition {
                namespaces: Some(namespaces.into_iter().map(|ns| ns.to_string()).collect()),
                ..(*p).clone()
            })),
        }
    }

    pub fn contains(&self, obj: &DynamicObject) -> bool {
        let p = match self {
            Self::All => return true,
            Self::Partition(p) => p,
        };
        let labeled = obj
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&p.label))
            == Some(&p.value);
        labeled && p.allows_namespace(obj.metadata.namespace.as_deref())
    }

    /// Prepares an object for a write through this scope.
    ///
    /// Marks the object as belonging to the partition if it is not marked yet, and fails if it
    /// belongs to another partition or lies outside the allowed namespaces.
    pub fn admit(&self, kind: &str, obj: &mut DynamicObject) -> Result<()> {
        let p = match self {
            Self::All => return Ok(()),
            Self::Partition(p) => p,
        };

        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        let value = labels
            .entry(p.label.clone())
            .or_insert_with(|| p.value.clone());
        if *value != p.value {
            return Err(Error::Forbidden(format!(
                "{kind} is labeled {}={value}, outside of view {}",
                p.label, p.value
            )));
        }

        if !p.allows_namespace(obj.metadata.namespace.as_deref()) {
            return Err(Error::Forbidden(format!(
                "namespace {:?} is outside of view {}",
                obj.metadata.namespace.as_deref().unwrap_or_default(),
                p.value
            )));
        }
        Ok(())
    }
}

// === impl Partition ===

impl Partition {
    fn allows_namespace(&self, namespace: Option<&str>) -> bool {
        match (self.namespaces.as_ref(), namespace) {
            (Some(allowed), Some(ns)) => allowed.contains(ns),
            _ => true,
        }
    }
}

// === impl View ===

impl View {
    /// Returns the base view, which sees the whole store.
    pub fn base(store: Store) -> Self {
        Self {
            name: None,
            path: Arc::from("/"),
            store,
            scope: Scope::All,
        }
    }

    /// Returns a derived view addressed by `config.path(name)`.
    pub fn derived(store: Store, config: &ViewConfig, name: &str, scope: Scope) -> Self {
        Self {
            name: Some(Arc::from(name)),
            path: Arc::from(config.path(name)),
            store,
            scope,
        }
    }

    /// The view's name, or `None` for the base view.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn create(&self, kind: &str, obj: DynamicObject) -> Result<Arc<DynamicObject>> {
        self.store.kind(kind)?.create(&self.scope, obj)
    }

    pub fn get(&self, kind: &str, key: &ObjectKey) -> Result<Arc<DynamicObject>> {
        self.store.kind(kind)?.get(&self.scope, key)
    }

    pub fn list(&self, kind: &str, criteria: Criteria) -> Result<List> {
        self.store.kind(kind)?.list(&self.scope, criteria)
    }

    /// Watches the objects `criteria` selects, starting after `since`.
    ///
    /// Changes committed after `since` are replayed first; fails with `Gone` if they are no
    /// longer retained. With no starting version, every selected object is first reported as
    /// added.
    pub fn watch(
        &self,
        kind: &str,
        criteria: Criteria,
        since: Option<ResourceVersion>,
        timeout: Option<Duration>,
    ) -> Result<Watch> {
        self.store
            .kind(kind)?
            .watch(&self.scope, criteria, since, timeout)
    }

    /// Replaces an object or, if `subresource` is set, one of its subresources.
    pub fn update(
        &self,
        kind: &str,
        obj: DynamicObject,
        expected: Option<ResourceVersion>,
        subresource: Option<&str>,
    ) -> Result<Arc<DynamicObject>> {
        let kind = self.store.kind(kind)?;
        let subresource = subresource
            .map(|name| kubemem_k8s_patch::Subresource::resolve(kind.descriptor(), name))
            .transpose()?;
        kind.update(&self.scope, obj, expected, subresource)
    }

    pub fn patch(
        &self,
        kind: &str,
        key: &ObjectKey,
        subresource: Option<&str>,
        patch: &Patch<Value>,
    ) -> Result<Arc<DynamicObject>> {
        let kind = self.store.kind(kind)?;
        let subresource = subresource
            .map(|name| kubemem_k8s_patch::Subresource::resolve(kind.descriptor(), name))
            .transpose()?;
        kind.patch(&self.scope, key, subresource, patch)
    }

    pub fn delete(
        &self,
        kind: &str,
        key: &ObjectKey,
        precondition: Option<ResourceVersion>,
    ) -> Result<Arc<DynamicObject>> {
        self.store.kind(kind)?.delete(&self.scope, key, precondition)
    }

    pub fn delete_collection(
        &self,
        kind: &str,
        criteria: Criteria,
    ) -> Result<Vec<Arc<DynamicObject>>> {
        self.store.kind(kind)?.delete_collection(&self.scope, criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubemem_k8s_api::decode;
    use serde_json::json;

    fn cm(ns: &str, labels: Value) -> DynamicObject {
        decode(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c", "namespace": ns, "labels": labels},
        }))
        .unwrap()
    }

    #[test]
    fn paths() {
        let config = ViewConfig::default();
        assert_eq!(config.path("team-a"), "/views/team-a");
        assert_eq!(config.parse("/views/team-a"), Some("team-a"));
        assert_eq!(config.parse("/views/team-a/api/v1/pods"), Some("team-a"));
        assert_eq!(config.parse("/views/"), None);
        assert_eq!(config.parse("/viewsx/a"), None);
        assert_eq!(config.parse("/api/v1/pods"), None);
    }

    #[test]
    fn partitions() {
        let scope = Scope::partition("view", "a").with_namespaces(["ns-0"]);
        assert!(Scope::All.contains(&cm("ns-1", json!({}))));
        assert!(scope.contains(&cm("ns-0", json!({"view": "a"}))));
        assert!(!scope.contains(&cm("ns-0", json!({"view": "b"}))));
        assert!(!scope.contains(&cm("ns-0", json!({}))));
        assert!(!scope.contains(&cm("ns-1", json!({"view": "a"}))));
    }

    #[test]
    fn admission_stamps_label() {
        let scope = Scope::partition("view", "a").with_namespaces(["ns-0"]);

        let mut obj = cm("ns-0", json!({"app": "web"}));
        scope.admit("ConfigMap", &mut obj).unwrap();
        assert_eq!(
            obj.metadata.labels.as_ref().and_then(|l| l.get("view")),
            Some(&"a".to_string())
        );
        assert!(scope.contains(&obj));

        let mut other = cm("ns-0", json!({"view": "b"}));
        assert!(matches!(
            scope.admit("ConfigMap", &mut other),
            Err(Error::Forbidden(_))
        ));

        let mut elsewhere = cm("ns-1", json!({}));
        assert!(matches!(
            scope.admit("ConfigMap", &mut elsewhere),
            Err(Error::Forbidden(_))
        ));
    }
}
