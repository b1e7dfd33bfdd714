use std::fmt;

/// Identifies an object within a kind: namespace and name for namespaced kinds, name alone for
/// cluster-scoped kinds.
///
/// Keys order by namespace and then by name, which is the order lists are returned in.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

// === impl ObjectKey ===

impl ObjectKey {
    pub fn namespaced(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: impl ToString) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn new(namespace: Option<&str>, name: impl ToString) -> Self {
        Self {
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            Some(ref ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
