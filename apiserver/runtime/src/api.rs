use futures::{stream, Stream, StreamExt};
use kubemem_core::{Closed, Criteria, Error, ObjectKey, ResourceVersion, Result};
use kubemem_k8s_api::{
    from_dynamic, to_dynamic, Descriptor, DynamicObject, ListParams, ObjectList, Patch,
    ResourceScopeExt, WatchEvent, WatchParams,
};
use kubemem_k8s_store::{EventType, List, View};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

/// Why a typed watch ended with an error.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum WatchError {
    /// The server closed the watch.
    #[error(transparent)]
    Closed(#[from] Closed),

    /// An event's object could not be decoded as the client's kind. The watch is stopped.
    #[error("failed to decode the event at resource version {version}: {error}")]
    Decode {
        version: ResourceVersion,
        error: Error,
    },
}

/// A typed client for one kind, bound to a view.
///
/// Mirrors the shape of `kube::Api`: a client built with [`Api::namespaced`] addresses objects in
/// one namespace, while one built with [`Api::all`] addresses cluster-scoped objects by name and
/// lists namespaced objects across every namespace.
pub struct Api<K> {
    view: View,
    descriptor: Arc<Descriptor>,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

// === impl Api ===

impl<K> Api<K>
where
    K: k8s_openapi::Resource + Clone + Default + Serialize + DeserializeOwned + Send + 'static,
    K::Scope: ResourceScopeExt,
{
    /// Returns a client for every object of kind `K` visible through `view`.
    ///
    /// Fails with `UnknownKind` if the view's store does not hold `K`.
    pub fn all(view: &View) -> Result<Self> {
        let descriptor = view.store().registry().get::<K>()?.clone();
        Ok(Self {
            view: view.clone(),
            descriptor,
            namespace: None,
            _kind: PhantomData,
        })
    }

    /// Returns a client for the objects of kind `K` in `namespace`.
    pub fn namespaced(view: &View, namespace: &str) -> Result<Self>
    where
        K: k8s_openapi::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    {
        Ok(Self {
            namespace: Some(namespace.to_string()),
            ..Self::all(view)?
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn create(&self, obj: &K) -> Result<K> {
        let obj = self.encode(obj)?;
        decode(&*self.view.create(self.kind(), obj)?)
    }

    pub fn get(&self, name: &str) -> Result<K> {
        decode(&*self.view.get(self.kind(), &self.key(name))?)
    }

    /// Like [`Api::get`], but returns `None` if the object does not exist.
    pub fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name) {
            Ok(obj) => Ok(Some(obj)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        let criteria = self.criteria(lp.label_selector.as_deref(), lp.field_selector.as_deref())?;
        let list = self.view.list(self.kind(), criteria)?;
        self.object_list(list)
    }

    /// Watches the selected objects, starting after `version`.
    ///
    /// An empty `version` starts the watch with an `Added` event for every selected object. The
    /// stream ends with `Err` if the server closes the watch or an event cannot be decoded.
    pub fn watch(
        &self,
        wp: &WatchParams,
        version: &str,
    ) -> Result<impl Stream<Item = Result<WatchEvent<K>, WatchError>> + Send + Unpin> {
        let criteria = self.criteria(wp.label_selector.as_deref(), wp.field_selector.as_deref())?;
        let since = ResourceVersion::parse_opt(version)?;
        let timeout = wp.timeout.map(|secs| Duration::from_secs(secs.into()));
        let watch = self.view.watch(self.kind(), criteria, since, timeout)?;

        let kind = self.kind();
        let events = stream::unfold(Some(watch), move |watch| async move {
            let mut watch = watch?;
            let event = match watch.next().await? {
                Ok(event) => event,
                Err(closed) => return Some((Err(WatchError::Closed(closed)), Some(watch))),
            };
            match decode::<K>(&*event.object) {
                Ok(obj) => {
                    let event = match event.type_ {
                        EventType::Added => WatchEvent::Added(obj),
                        EventType::Modified => WatchEvent::Modified(obj),
                        EventType::Deleted => WatchEvent::Deleted(obj),
                    };
                    Some((Ok(event), Some(watch)))
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        kind,
                        version = %event.resource_version,
                        "Stopping watch on an undecodable event"
                    );
                    watch.stop();
                    let error = WatchError::Decode {
                        version: event.resource_version,
                        error,
                    };
                    Some((Err(error), None))
                }
            }
        });
        Ok(Box::pin(events))
    }

    /// Replaces the object named `name`.
    ///
    /// If the object carries a `metadata.resourceVersion`, the replace only succeeds if it is
    /// current.
    pub fn replace(&self, name: &str, obj: &K) -> Result<K> {
        let obj = self.encode_named(name, obj)?;
        decode(&*self.view.update(self.kind(), obj, None, None)?)
    }

    /// Replaces the status of the object named `name`, leaving the rest of it unchanged.
    pub fn replace_status(&self, name: &str, obj: &K) -> Result<K> {
        let obj = self.encode_named(name, obj)?;
        decode(&*self.view.update(self.kind(), obj, None, Some("status"))?)
    }

    pub fn patch<P: Serialize>(&self, name: &str, patch: &Patch<P>) -> Result<K> {
        let patch = to_value(patch)?;
        decode(&*self.view.patch(self.kind(), &self.key(name), None, &patch)?)
    }

    pub fn patch_status<P: Serialize>(&self, name: &str, patch: &Patch<P>) -> Result<K> {
        let patch = to_value(patch)?;
        decode(
            &*self
                .view
                .patch(self.kind(), &self.key(name), Some("status"), &patch)?,
        )
    }

    /// Deletes the object named `name`, returning its final state.
    pub fn delete(&self, name: &str) -> Result<K> {
        decode(&*self.view.delete(self.kind(), &self.key(name), None)?)
    }

    /// Deletes every selected object, returning their final states.
    pub fn delete_collection(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        let criteria = self.criteria(lp.label_selector.as_deref(), lp.field_selector.as_deref())?;
        let items = self.view.delete_collection(self.kind(), criteria)?;
        self.object_list(List {
            items,
            resource_version: self.view.store().sequence().current(),
        })
    }

    fn kind(&self) -> &'static str {
        self.descriptor.kind()
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref(), name)
    }

    fn criteria(&self, labels: Option<&str>, fields: Option<&str>) -> Result<Criteria> {
        Criteria::from_query(self.namespace.as_deref(), labels, fields)
    }

    /// Encodes an object for a write, placing it in the client's namespace.
    fn encode(&self, obj: &K) -> Result<DynamicObject> {
        let mut obj = to_dynamic(obj)?;
        if let Some(ns) = self.namespace.as_deref() {
            match obj.metadata.namespace.take().filter(|other| !other.is_empty()) {
                Some(other) if other != ns => {
                    return Err(Error::Invalid(format!(
                        "the namespace of the object ({other}) does not match the namespace of the request ({ns})"
                    )))
                }
                _ => obj.metadata.namespace = Some(ns.to_string()),
            }
        }
        Ok(obj)
    }

    fn encode_named(&self, name: &str, obj: &K) -> Result<DynamicObject> {
        let obj = self.encode(obj)?;
        if obj.metadata.name.as_deref() != Some(name) {
            return Err(Error::Invalid(format!(
                "the name of the object ({}) does not match the name of the request ({name})",
                obj.metadata.name.as_deref().unwrap_or_default()
            )));
        }
        Ok(obj)
    }

    fn object_list(&self, list: List) -> Result<ObjectList<K>> {
        let mut value = self.descriptor.empty_list(list.resource_version);
        value["items"] = list
            .items
            .iter()
            .map(|obj| serde_json::to_value(&**obj))
            .collect::<serde_json::Result<Vec<_>>>()
            .map(Value::Array)
            .map_err(|e| Error::Invalid(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| Error::Invalid(e.to_string()))
    }
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            descriptor: self.descriptor.clone(),
            namespace: self.namespace.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for Api<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("kind", &self.descriptor.kind())
            .field("view", &self.view.path())
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    from_dynamic(obj)
}

fn to_value<P: Serialize>(patch: &Patch<P>) -> Result<Patch<Value>> {
    let value = |p: &P| serde_json::to_value(p).map_err(|e| Error::InvalidPatch(e.to_string()));
    Ok(match patch {
        Patch::Apply(p) => Patch::Apply(value(p)?),
        Patch::Json(p) => Patch::Json(p.clone()),
        Patch::Merge(p) => Patch::Merge(value(p)?),
        Patch::Strategic(p) => Patch::Strategic(value(p)?),
        _ => return Err(Error::InvalidPatch("unsupported patch type".to_string())),
    })
}
