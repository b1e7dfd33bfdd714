//! Applies patch documents to stored objects.
//!
//! A patch is computed entirely from the object's current state; this crate never touches the
//! store. The caller writes the result back with the current object's resource version as its
//! precondition, so a patch that races with another mutation fails with a conflict instead of
//! overwriting it.
//!
//! Two strategies are supported:
//!
//! - a JSON merge patch (RFC 7386), where objects merge recursively, `null` removes a key and
//!   every other value (including lists) replaces the existing one;
//! - a strategic merge patch, which additionally merges the list fields a kind declares in its
//!   [`Descriptor`], either by a key field or as a set, and honors `$patch` directives.
//!
//! After merging, fields that identify the object are restored, subresource isolation is
//! enforced, and condition transition times are maintained.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conditions;
mod merge;
mod strategic;


use chrono::{DateTime, Utc};
use kube::core::params::Patch;
use kubemem_core::{Error, ResourceVersion, Result};
use kubemem_k8s_api::{decode, Descriptor, DynamicObject};
use serde_json::Value;

/// A part of an object that may be patched on its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Subresource {
    Status,
}

// === impl Subresource ===

impl Subresource {
    /// Resolves a subresource name against a kind.
    ///
    /// Fails with `NotFound` if the kind has no such subresource.
    pub fn resolve(descriptor: &Descriptor, name: &str) -> Result<Self> {
        match name {
            "status" if descriptor.has_status() => Ok(Self::Status),
            name => Err(Error::NotFound {
                kind: format!("{} subresource", descriptor.kind()),
                key: name.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
        }
    }
}

/// Computes the result of applying `patch` to `current`.
///
/// `now` is the time recorded on conditions whose status changes.
pub fn apply(
    descriptor: &Descriptor,
    current: &DynamicObject,
    patch: &Patch<Value>,
    subresource: Option<Subresource>,
    now: DateTime<Utc>,
) -> Result<DynamicObject> {
    let (document, strategic) = match patch {
        Patch::Merge(doc) => (doc, false),
        Patch::Strategic(doc) => (doc, true),
        Patch::Apply(_) => {
            return Err(Error::InvalidPatch(
                "server-side apply is not supported".to_string(),
            ))
        }
        Patch::Json(_) => {
            return Err(Error::InvalidPatch(
                "JSON patches are not supported".to_string(),
            ))
        }
        _ => {
            return Err(Error::InvalidPatch(
                "unsupported patch type".to_string(),
            ))
        }
    };
    if !document.is_object() {
        return Err(Error::InvalidPatch(
            "patch document must be a JSON object".to_string(),
        ));
    }

    check_precondition(descriptor, current, document)?;

    let original = serde_json::to_value(current).map_err(|e| Error::Invalid(e.to_string()))?;
    let mut patched = if strategic {
        strategic::merge(descriptor, &original, document)?
    } else {
        let mut target = original.clone();
        merge::merge(&mut target, document);
        target
    };

    match subresource {
        Some(Subresource::Status) => {
            let status = patched.get("status").cloned();
            patched = original.clone();
            set_status(&mut patched, status);
        }
        None if descriptor.has_status() => {
            set_status(&mut patched, original.get("status").cloned());
        }
        None => {}
    }

    restore_identity(&original, &mut patched);

    for path in descriptor.condition_paths() {
        conditions::reconcile(&original, &mut patched, path, now);
    }

    tracing::trace!(
        kind = descriptor.kind(),
        subresource = subresource.map(|s| s.as_str()),
        strategic,
        "Applied patch"
    );
    decode(patched)
}

/// A patch that names a resource version may only apply to that version.
fn check_precondition(
    descriptor: &Descriptor,
    current: &DynamicObject,
    document: &Value,
) -> Result<()> {
    let expected = match document
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .map(ResourceVersion::parse_opt)
        .transpose()
        .map_err(|e| Error::InvalidPatch(e.to_string()))?
        .flatten()
    {
        Some(rv) => rv,
        None => return Ok(()),
    };

    let current_rv = current
        .metadata
        .resource_version
        .as_deref()
        .map(ResourceVersion::parse_opt)
        .transpose()?
        .flatten()
        .unwrap_or_default();
    if expected != current_rv {
        let key = descriptor.key(current)?;
        return Err(Error::Conflict {
            kind: descriptor.kind().to_string(),
            key: key.to_string(),
            expected,
            current: current_rv,
        });
    }
    Ok(())
}

fn set_status(obj: &mut Value, status: Option<Value>) {
    if let Some(obj) = obj.as_object_mut() {
        match status {
            Some(status) => {
                obj.insert("status".to_string(), status);
            }
            None => {
                obj.remove("status");
            }
        }
    }
}

/// Fields a patch can never change.
const IDENTITY: &[&str] = &[
    "/apiVersion",
    "/kind",
    "/metadata/name",
    "/metadata/namespace",
    "/metadata/uid",
    "/metadata/creationTimestamp",
    "/metadata/resourceVersion",
    "/metadata/generation",
];

fn restore_identity(original: &Value, patched: &mut Value) {
    for pointer in IDENTITY {
        let (parent, field) = match pointer.rsplit_once('/') {
            Some(split) => split,
            None => continue,
        };
        let value = original.pointer(pointer).cloned();
        let parent = if parent.is_empty() {
            Some(&mut *patched)
        } else {
            ensure_object(patched, parent)
        };
        if let Some(Value::Object(parent)) = parent {
            match value {
                Some(value) => {
                    parent.insert(field.to_string(), value);
                }
                None => {
                    parent.remove(field);
                }
            }
        }
    }
}

fn ensure_object<'v>(value: &'v mut Value, pointer: &str) -> Option<&'v mut Value> {
    let mut value = value;
    for segment in pointer.split('/').skip(1) {
        let obj = value.as_object_mut()?;
        let child = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !child.is_object() {
            *child = Value::Object(Default::default());
        }
        value = child;
    }
    Some(value)
}
