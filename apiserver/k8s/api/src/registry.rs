use crate::{
    descriptor::ResourceScopeExt, ConfigMap, Descriptor, Event, Lease, ListMerge, Namespace, Node,
    Pod, Service,
};
use ahash::AHashMap;
use kube::core::GroupVersionKind;
use kubemem_core::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// The set of kinds a server stores.
///
/// Descriptors are registered before the server starts and are shared, immutably, by every view.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: Vec<Arc<Descriptor>>,
    by_name: AHashMap<String, usize>,
}

// === impl Registry ===

impl Registry {
    /// Returns a registry holding the built-in kinds.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for desc in builtin() {
            registry.register(desc);
        }
        registry
    }

    /// Adds a kind, replacing any kind registered with the same group/version/kind.
    pub fn register(&mut self, descriptor: Descriptor) -> Arc<Descriptor> {
        let descriptor = Arc::new(descriptor);
        let gvk = gvk_name(&descriptor.gvk());
        let idx = match self.by_name.get(&gvk) {
            Some(&idx) => {
                self.descriptors[idx] = descriptor.clone();
                idx
            }
            None => {
                self.descriptors.push(descriptor.clone());
                self.descriptors.len() - 1
            }
        };

        // Short names are resolved first-come-first-served so that a core kind is not shadowed
        // by a later kind of another group.
        for name in [
            descriptor.kind().to_string(),
            descriptor.kind().to_ascii_lowercase(),
            descriptor.plural().to_string(),
        ] {
            self.by_name.entry(name).or_insert(idx);
        }
        self.by_name.insert(gvk, idx);
        descriptor
    }

    /// Finds a kind by its name, lowercase name, plural resource name, or `group/version/Kind`.
    pub fn lookup(&self, name: &str) -> Result<&Arc<Descriptor>> {
        self.by_name
            .get(name)
            .map(|&idx| &self.descriptors[idx])
            .ok_or_else(|| Error::UnknownKind(name.to_string()))
    }

    pub fn lookup_gvk(&self, gvk: &GroupVersionKind) -> Result<&Arc<Descriptor>> {
        self.lookup(&gvk_name(gvk))
    }

    /// Finds the descriptor of a `k8s_openapi` kind.
    pub fn get<K>(&self) -> Result<&Arc<Descriptor>>
    where
        K: k8s_openapi::Resource + Default + Serialize + DeserializeOwned + 'static,
        K::Scope: ResourceScopeExt,
    {
        self.lookup_gvk(&GroupVersionKind::gvk(K::GROUP, K::VERSION, K::KIND))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> + '_ {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn gvk_name(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

fn builtin() -> Vec<Descriptor> {
    vec![
        Descriptor::of::<Namespace>()
            .with_status()
            .with_conditions("status.conditions")
            .with_list("spec.finalizers", ListMerge::Set)
            .with_field("status.phase"),
        Descriptor::of::<Node>()
            .with_status()
            .with_conditions("status.conditions")
            .with_list("status.addresses", ListMerge::Key("type"))
            .with_list("spec.podCIDRs", ListMerge::Set)
            .with_field("spec.unschedulable"),
        Descriptor::of::<Pod>()
            .with_status()
            .with_conditions("status.conditions")
            .with_list("spec.containers", ListMerge::Key("name"))
            .with_list("spec.initContainers", ListMerge::Key("name"))
            .with_list("spec.containers.ports", ListMerge::Key("containerPort"))
            .with_list("spec.containers.env", ListMerge::Key("name"))
            .with_list("spec.containers.volumeMounts", ListMerge::Key("mountPath"))
            .with_list("spec.volumes", ListMerge::Key("name"))
            .with_list("spec.imagePullSecrets", ListMerge::Key("name"))
            .with_list("status.containerStatuses", ListMerge::Key("name"))
            .with_list("status.podIPs", ListMerge::Key("ip"))
            .with_field("spec.nodeName")
            .with_field("spec.restartPolicy")
            .with_field("spec.schedulerName")
            .with_field("spec.serviceAccountName")
            .with_field("spec.hostNetwork")
            .with_field("status.phase")
            .with_field("status.podIP")
            .with_field("status.nominatedNodeName"),
        Descriptor::of::<Event>()
            .with_field("involvedObject.kind")
            .with_field("involvedObject.namespace")
            .with_field("involvedObject.name")
            .with_field("involvedObject.uid")
            .with_field("involvedObject.apiVersion")
            .with_field("involvedObject.resourceVersion")
            .with_field("involvedObject.fieldPath")
            .with_field("reason")
            .with_field("reportingComponent")
            .with_field("type")
            .with_field_alias("source", "source.component"),
        Descriptor::of::<ConfigMap>(),
        Descriptor::of::<Service>()
            .with_status()
            .with_conditions("status.conditions")
            .with_list("spec.ports", ListMerge::Key("port"))
            .with_field("spec.type")
            .with_field("spec.clusterIP"),
        Descriptor::of::<Lease>().with_field("spec.holderIdentity"),
    ]
}
