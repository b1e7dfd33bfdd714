//! Resource kinds served by the in-memory API server.
//!
//! Every kind the server stores is described by a [`Descriptor`]: its group/version/kind, list
//! kind, scope, whether it has a `status` subresource, which list fields merge by key under a
//! strategic merge patch, where its condition lists live, and which fields it can be selected by.
//! Descriptors are collected in a [`Registry`] when the server starts and are immutable after that.
//!
//! Objects are held as [`DynamicObject`]s so that one store, patch and watch pipeline serves every
//! kind. Kind-specific behavior is reached through the descriptor (and its [`KindOps`]), never by
//! inspecting the object's type at runtime.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod descriptor;
mod object;
mod registry;

pub use self::{
    descriptor::{Descriptor, FieldPath, KindOps, ListMerge, ResourceScopeExt},
    object::{decode, from_dynamic, to_dynamic, Candidate},
    registry::Registry,
};
pub use k8s_openapi::{
    api::{
        coordination::v1::Lease,
        core::v1::{ConfigMap, Event, Namespace, Node, NodeSpec, Pod, PodSpec, PodStatus, Service},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time},
    Metadata, Resource,
};
pub use kube::core::{
    params::{ListParams, Patch, WatchParams},
    DynamicObject, GroupVersionKind, ObjectList, TypeMeta, WatchEvent,
};
