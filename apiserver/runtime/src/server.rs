use crate::Api;
use ahash::AHashMap;
use kubemem_core::{Error, Result, Sequence};
use kubemem_k8s_api::{Descriptor, Registry as Kinds, ResourceScopeExt};
use kubemem_k8s_store::{Scope, Store, StoreMetrics, View, ViewConfig, WatchConfig};
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Configures a [`Server`].
#[derive(Debug, Default)]
pub struct Builder {
    kinds: Option<Kinds>,
    extra: Vec<Descriptor>,
    watch: WatchConfig,
    views: ViewConfig,
    derived: Vec<(String, Option<Vec<String>>)>,
}

/// An in-memory API server.
///
/// Every view of a server shares its store, and so its resource-version sequence and its
/// watchers.
pub struct Server {
    store: Store,
    base: View,
    config: ViewConfig,
    derived: RwLock<AHashMap<String, View>>,
    metrics: Registry,
}

// === impl Builder ===

impl Builder {
    /// Replaces the built-in kinds.
    pub fn with_kinds(mut self, kinds: Kinds) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Registers an additional kind.
    pub fn with_kind(mut self, descriptor: Descriptor) -> Self {
        self.extra.push(descriptor);
        self
    }

    pub fn with_watch_config(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_view_config(mut self, views: ViewConfig) -> Self {
        self.views = views;
        self
    }

    /// Creates a derived view when the server starts.
    pub fn with_view(mut self, name: impl ToString) -> Self {
        self.derived.push((name.to_string(), None));
        self
    }

    /// Creates a derived view whose namespaced objects are confined to `namespaces`.
    pub fn with_namespaced_view(
        mut self,
        name: impl ToString,
        namespaces: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        let namespaces = namespaces.into_iter().map(|ns| ns.to_string()).collect();
        self.derived.push((name.to_string(), Some(namespaces)));
        self
    }

    pub fn start(self) -> Server {
        let Self {
            kinds,
            extra,
            watch,
            views,
            derived,
        } = self;

        let mut kinds = kinds.unwrap_or_else(Kinds::builtin);
        for descriptor in extra {
            kinds.register(descriptor);
        }

        let mut metrics = Registry::default();
        let prom = metrics.sub_registry_with_prefix("kubemem");
        let store_metrics = StoreMetrics::register(prom);

        let store = Store::new(kinds, Arc::new(Sequence::new()), watch, store_metrics);
        kubemem_k8s_store::register_collector(prom, store.clone());

        let server = Server {
            base: View::base(store.clone()),
            store,
            config: views,
            derived: Default::default(),
            metrics,
        };
        for (name, namespaces) in derived {
            server.add_view(&name, namespaces);
        }

        tracing::info!(
            kinds = server.store.registry().len(),
            views = ?server.view_names(),
            queue_capacity = watch.queue_capacity,
            timeout = ?watch.timeout,
            "Server started"
        );
        server
    }
}

// === impl Server ===

impl Server {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The view that sees every object.
    pub fn base(&self) -> &View {
        &self.base
    }

    pub fn view_config(&self) -> &ViewConfig {
        &self.config
    }

    /// Returns the derived view named `name`, if it exists.
    pub fn view(&self, name: &str) -> Option<View> {
        self.derived.read().get(name).cloned()
    }

    /// Returns the derived view named `name`, creating it if necessary.
    ///
    /// If `namespaces` is set, a newly created view only admits namespaced objects in those
    /// namespaces. An existing view is returned as-is.
    pub fn add_view(&self, name: &str, namespaces: Option<Vec<String>>) -> View {
        let mut derived = self.derived.write();
        if let Some(view) = derived.get(name) {
            return view.clone();
        }

        let mut scope = Scope::partition(&self.config.label, name);
        if let Some(namespaces) = namespaces {
            scope = scope.with_namespaces(namespaces);
        }
        let view = View::derived(self.store.clone(), &self.config, name, scope);
        tracing::debug!(view = %name, path = %view.path(), "Added view");
        derived.insert(name.to_string(), view.clone());
        view
    }

    pub fn view_names(&self) -> Vec<String> {
        let mut names = self.derived.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Resolves a request path to the view it addresses.
    ///
    /// Paths under the view prefix address the named derived view; every other path addresses
    /// the base view.
    pub fn route(&self, path: &str) -> Result<View> {
        match self.config.parse(path) {
            None => Ok(self.base.clone()),
            Some(name) => self.view(name).ok_or_else(|| Error::NotFound {
                kind: "view".to_string(),
                key: name.to_string(),
            }),
        }
    }

    /// Returns a client for all objects of kind `K` visible at `path`.
    pub fn client<K>(&self, path: &str) -> Result<Api<K>>
    where
        K: k8s_openapi::Resource + Clone + Default + Serialize + DeserializeOwned + Send + 'static,
        K::Scope: ResourceScopeExt,
    {
        Api::all(&self.route(path)?)
    }

    /// Stops the server: further mutations and watches fail and every watch is closed.
    pub fn stop(&self) {
        self.store.shutdown();
        tracing::info!("Server stopped");
    }

    /// Renders the server's metrics in the Prometheus text format.
    pub fn encode_metrics(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.metrics)?;
        Ok(buf)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("store", &self.store)
            .field("views", &self.view_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_paths_to_views() {
        let server = Server::builder().with_view("team-a").start();

        assert_eq!(server.route("/api/v1/pods").unwrap().name(), None);
        assert_eq!(server.route("/").unwrap().name(), None);
        let view = server.route("/views/team-a/api/v1/pods").unwrap();
        assert_eq!(view.name(), Some("team-a"));
        assert_eq!(view.path(), "/views/team-a");
        assert!(server.route("/views/team-b").unwrap_err().is_not_found());

        server.add_view("team-b", None);
        assert_eq!(
            server.route("/views/team-b").unwrap().name(),
            Some("team-b")
        );
        assert_eq!(server.view_names(), vec!["team-a", "team-b"]);
    }

    #[test]
    fn custom_prefix_and_label() {
        let server = Server::builder()
            .with_view_config(ViewConfig {
                prefix: "/sessions/".to_string(),
                label: "example.com/session".to_string(),
            })
            .with_namespaced_view("s1", ["default"])
            .start();

        let view = server.route("/sessions/s1").unwrap();
        assert_eq!(view.path(), "/sessions/s1");
        match view.scope() {
            Scope::Partition(p) => {
                assert_eq!(p.label, "example.com/session");
                assert_eq!(p.value, "s1");
                assert_eq!(
                    p.namespaces.as_ref().map(|ns| ns.len()),
                    Some(1)
                );
            }
            Scope::All => panic!("derived views must be partitioned"),
        }
        assert_eq!(server.route("/views/s1").unwrap().name(), None);
    }

    #[test]
    fn adding_a_view_twice_keeps_the_first() {
        let server = Server::builder().start();
        server.add_view("a", Some(vec!["ns-0".to_string()]));
        let again = server.add_view("a", None);
        assert!(matches!(again.scope(), Scope::Partition(p) if p.namespaces.is_some()));
    }
}
