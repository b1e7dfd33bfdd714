use crate::{fields, labels, Error};
use std::{borrow::Cow, collections::BTreeSet};

/// Anything the match engine can evaluate criteria against.
pub trait Selectable {
    fn name(&self) -> &str;

    fn namespace(&self) -> Option<&str>;

    fn labels(&self) -> &labels::Map;

    /// Resolves a field-selector path. `metadata.name` and `metadata.namespace` are handled by the
    /// match engine; implementations resolve kind-specific paths and return `None` for paths the
    /// kind does not support.
    fn field(&self, path: &str) -> Option<Cow<'_, str>>;
}

/// Selection criteria for lists and watches.
///
/// An absent criterion selects everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Criteria {
    pub names: Option<BTreeSet<String>>,
    pub namespace: Option<String>,
    pub labels: Option<labels::Selector>,
    pub fields: Option<fields::Selector>,
}

// === impl Criteria ===

impl Criteria {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_names(mut self, names: impl IntoIterator<Item = impl ToString>) -> Self {
        self.names = Some(names.into_iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn in_namespace(mut self, namespace: impl ToString) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_labels(mut self, selector: labels::Selector) -> Self {
        self.labels = Some(selector);
        self
    }

    pub fn with_fields(mut self, selector: fields::Selector) -> Self {
        self.fields = Some(selector);
        self
    }

    /// Builds criteria from the query-string forms of label and field selectors.
    pub fn from_query(
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Self, Error> {
        Ok(Self {
            names: None,
            namespace: namespace.map(ToString::to_string),
            labels: label_selector
                .map(str::parse::<labels::Selector>)
                .transpose()?,
            fields: field_selector
                .map(str::parse::<fields::Selector>)
                .transpose()?,
        })
    }

    /// Fails if the field selector refers to a path that `supported` rejects.
    pub fn check_fields(&self, supported: impl Fn(&str) -> bool) -> Result<(), Error> {
        for path in self.fields.iter().flat_map(fields::Selector::paths) {
            if !is_metadata_field(path) && !supported(path) {
                return Err(Error::InvalidSelector(format!(
                    "field label not supported: {path}"
                )));
            }
        }
        Ok(())
    }

    pub fn matches<S: Selectable + ?Sized>(&self, obj: &S) -> bool {
        if let Some(names) = self.names.as_ref() {
            if !names.contains(obj.name()) {
                return false;
            }
        }

        if let Some(ns) = self.namespace.as_deref() {
            if obj.namespace() != Some(ns) {
                return false;
            }
        }

        if let Some(selector) = self.labels.as_ref() {
            if !selector.matches(obj.labels()) {
                return false;
            }
        }

        if let Some(selector) = self.fields.as_ref() {
            let matches = selector.matches(|path| match path {
                "metadata.name" => Some(Cow::Borrowed(obj.name())),
                "metadata.namespace" => Some(Cow::Borrowed(obj.namespace().unwrap_or(""))),
                path => obj.field(path),
            });
            if !matches {
                return false;
            }
        }

        true
    }
}

fn is_metadata_field(path: &str) -> bool {
    matches!(path, "metadata.name" | "metadata.namespace")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    struct Obj {
        name: &'static str,
        namespace: Option<&'static str>,
        labels: labels::Map,
        node: &'static str,
    }

    impl Selectable for Obj {
        fn name(&self) -> &str {
            self.name
        }

        fn namespace(&self) -> Option<&str> {
            self.namespace
        }

        fn labels(&self) -> &labels::Map {
            &self.labels
        }

        fn field(&self, path: &str) -> Option<Cow<'_, str>> {
            (path == "spec.nodeName").then_some(Cow::Borrowed(self.node))
        }
    }

    fn pod(name: &'static str, ns: &'static str, app: &str, node: &'static str) -> Obj {
        Obj {
            name,
            namespace: Some(ns),
            labels: btreemap! { "app".to_string() => app.to_string() },
            node,
        }
    }

    #[test]
    fn absent_criteria_select_everything() {
        assert!(Criteria::all().matches(&pod("a", "ns-0", "web", "")));
    }

    #[test]
    fn every_criterion_must_hold() {
        let criteria = Criteria::all()
            .with_names(["a", "b"])
            .in_namespace("ns-0")
            .with_labels("app=web".parse().unwrap())
            .with_fields("spec.nodeName=node-0".parse().unwrap());

        assert!(criteria.matches(&pod("a", "ns-0", "web", "node-0")));
        assert!(!criteria.matches(&pod("c", "ns-0", "web", "node-0")), "name");
        assert!(!criteria.matches(&pod("a", "ns-1", "web", "node-0")), "namespace");
        assert!(!criteria.matches(&pod("a", "ns-0", "db", "node-0")), "labels");
        assert!(!criteria.matches(&pod("a", "ns-0", "web", "node-1")), "fields");
    }

    #[test]
    fn namespace_criterion_excludes_cluster_scoped_objects() {
        let node = Obj {
            name: "node-0",
            namespace: None,
            labels: Default::default(),
            node: "",
        };
        assert!(!Criteria::all().in_namespace("ns-0").matches(&node));
    }

    #[test]
    fn metadata_fields_always_resolve() {
        let criteria = Criteria::from_query(
            None,
            None,
            Some("metadata.name=a,metadata.namespace=ns-0"),
        )
        .unwrap();
        criteria
            .check_fields(|_| false)
            .expect("metadata fields are always supported");
        assert!(criteria.matches(&pod("a", "ns-0", "web", "")));
        assert!(!criteria.matches(&pod("a", "ns-1", "web", "")));
    }

    #[test]
    fn unsupported_fields_are_rejected() {
        let criteria = Criteria::from_query(None, None, Some("spec.unknown=x")).unwrap();
        assert!(matches!(
            criteria.check_fields(|p| p == "spec.nodeName"),
            Err(Error::InvalidSelector(_))
        ));
    }
}
