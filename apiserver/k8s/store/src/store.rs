use crate::{
    metrics::{KindMetrics, StoreMetrics, Verb},
    watch::{Change, Filter, History, Watchers},
    EventType, Scope, Watch, WatchConfig, WatchEvent,
};
use ahash::AHashMap;
use chrono::Utc;
use kubemem_core::{Closed, Criteria, Error, ObjectKey, ResourceVersion, Result, Sequence};
use kubemem_k8s_api::{Descriptor, DynamicObject, Patch, Registry, Time};
use kubemem_k8s_patch::Subresource;
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Holds every object of every registered kind.
///
/// Each kind has its own table, guarded by its own lock, but all kinds draw resource versions from
/// one [`Sequence`], so versions are totally ordered across the store.
#[derive(Clone)]
pub struct Store(Arc<Inner>);

struct Inner {
    registry: Registry,
    sequence: Arc<Sequence>,
    kinds: AHashMap<String, Arc<KindStore>>,
}

/// The objects of a single kind.
pub struct KindStore {
    descriptor: Arc<Descriptor>,
    sequence: Arc<Sequence>,
    config: WatchConfig,
    metrics: KindMetrics,
    state: RwLock<State>,
}

/// The result of a list: the selected objects and the version of the store they were read at.
///
/// A watch started at `resource_version` observes every change committed after the list.
#[derive(Clone, Debug, PartialEq)]
pub struct List {
    pub items: Vec<Arc<DynamicObject>>,
    pub resource_version: ResourceVersion,
}

#[derive(Debug)]
struct State {
    records: BTreeMap<ObjectKey, Record>,
    watchers: Watchers,
    history: History,
    shutdown: bool,
}

#[derive(Clone, Debug)]
struct Record {
    object: Arc<DynamicObject>,
    version: ResourceVersion,
}

// === impl Store ===

impl Store {
    pub fn new(
        registry: Registry,
        sequence: Arc<Sequence>,
        config: WatchConfig,
        metrics: StoreMetrics,
    ) -> Self {
        let kinds = registry
            .iter()
            .map(|descriptor| {
                let kind = KindStore {
                    descriptor: descriptor.clone(),
                    sequence: sequence.clone(),
                    config,
                    metrics: metrics.kind(descriptor.kind()),
                    state: RwLock::new(State::new(config.history)),
                };
                (table_key(descriptor), Arc::new(kind))
            })
            .collect();
        Self(Arc::new(Inner {
            registry,
            sequence,
            kinds,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub fn sequence(&self) -> &Arc<Sequence> {
        &self.0.sequence
    }

    /// Returns the table of the kind named `kind` (see [`Registry::lookup`]).
    pub fn kind(&self, kind: &str) -> Result<&Arc<KindStore>> {
        let descriptor = self.0.registry.lookup(kind)?;
        self.0
            .kinds
            .get(&table_key(descriptor))
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Rejects further mutations and watches, and closes every watch.
    pub fn shutdown(&self) {
        for kind in self.0.kinds.values() {
            kind.shutdown();
        }
    }

    /// Returns each kind's object and watcher counts.
    pub(crate) fn sizes(&self) -> Vec<(&'static str, usize, usize)> {
        let mut sizes = self
            .0
            .kinds
            .values()
            .map(|kind| {
                let state = kind.state.read();
                (kind.kind(), state.records.len(), state.watchers.len())
            })
            .collect::<Vec<_>>();
        sizes.sort_unstable_by_key(|(kind, _, _)| *kind);
        sizes
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("kinds", &self.0.kinds.len())
            .field("resource_version", &self.0.sequence.current())
            .finish()
    }
}

fn table_key(descriptor: &Descriptor) -> String {
    format!("{}/{}", descriptor.api_version(), descriptor.kind())
}

// === impl KindStore ===

impl KindStore {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn kind(&self) -> &'static str {
        self.descriptor.kind()
    }

    pub fn create(&self, scope: &Scope, mut obj: DynamicObject) -> Result<Arc<DynamicObject>> {
        self.prepare(&mut obj)?;
        if obj.metadata.name.as_deref().unwrap_or_default().is_empty() {
            if let Some(prefix) = obj.metadata.generate_name.as_deref() {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                obj.metadata.name = Some(format!("{prefix}{}", &suffix[..5]));
            }
        }
        let key = self.descriptor.key(&obj)?;
        scope.admit(self.kind(), &mut obj)?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_running()?;
        if state.records.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: self.kind().to_string(),
                key: key.to_string(),
            });
        }

        let version = self.sequence.advance();
        let meta = &mut obj.metadata;
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.generation = Some(1);
        meta.resource_version = Some(version.to_string());
        let obj = Arc::new(obj);

        state.records.insert(
            key.clone(),
            Record {
                object: obj.clone(),
                version,
            },
        );
        state.commit(
            &self.descriptor,
            Change::Created(obj.clone()),
            version,
            &self.metrics,
        );
        self.metrics.mutation(Verb::Create);
        tracing::debug!(kind = self.kind(), %key, %version, "Created");
        Ok(obj)
    }

    pub fn get(&self, scope: &Scope, key: &ObjectKey) -> Result<Arc<DynamicObject>> {
        self.record(scope, key).map(|r| r.object)
    }

    pub fn list(&self, scope: &Scope, criteria: Criteria) -> Result<List> {
        self.check_fields(&criteria)?;
        let filter = Filter::new(criteria, scope.clone());

        let state = self.state.read();
        let items = state
            .records
            .values()
            .filter(|r| filter.matches(&self.descriptor, &r.object))
            .map(|r| r.object.clone())
            .collect();
        Ok(List {
            items,
            resource_version: self.sequence.current(),
        })
    }

    /// Watches the objects `criteria` selects.
    ///
    /// A watch with `since` set first replays every change committed after that version, so a
    /// list followed by a watch from the list's version observes each later change exactly once.
    /// Fails with `Gone` if those changes are no longer retained. A watch without `since` first
    /// reports every selected object as added.
    pub fn watch(
        self: &Arc<Self>,
        scope: &Scope,
        criteria: Criteria,
        since: Option<ResourceVersion>,
        timeout: Option<Duration>,
    ) -> Result<Watch> {
        self.check_fields(&criteria)?;
        let filter = Filter::new(criteria, scope.clone());
        let deadline = Instant::now() + self.config.timeout(timeout);

        // The watcher is registered while holding the write lock so that no change is committed
        // between the initial snapshot and the first broadcast it receives.
        let mut state = self.state.write();
        state.check_running()?;
        let initial = match since {
            Some(since) => state
                .history
                .replay(&self.descriptor, &filter, since)
                .ok_or_else(|| Error::Gone {
                    kind: self.kind().to_string(),
                    requested: since,
                    oldest: state.history.oldest(),
                })?,
            None => {
                let mut added = state
                    .records
                    .values()
                    .filter(|r| filter.matches(&self.descriptor, &r.object))
                    .map(|r| WatchEvent {
                        type_: EventType::Added,
                        object: r.object.clone(),
                        resource_version: r.version,
                    })
                    .collect::<Vec<_>>();
                added.sort_by_key(|ev| ev.resource_version);
                added
            }
        };
        let registration =
            state
                .watchers
                .register(filter, self.config.queue_capacity, deadline);
        drop(state);

        tracing::info!(
            kind = self.kind(),
            watcher = registration.id,
            since = ?since.map(ResourceVersion::get),
            initial = initial.len(),
            "Watch started"
        );
        Ok(Watch::new(
            self.clone(),
            registration,
            initial.into(),
            deadline,
        ))
    }

    /// Replaces an object, or its status if `subresource` is set.
    ///
    /// The write is conditional on `expected`, or on the object's `metadata.resourceVersion` if
    /// that is set; otherwise it is unconditional.
    pub fn update(
        &self,
        scope: &Scope,
        obj: DynamicObject,
        expected: Option<ResourceVersion>,
        subresource: Option<Subresource>,
    ) -> Result<Arc<DynamicObject>> {
        self.replace(scope, obj, expected, subresource, Verb::Update)
    }

    /// Patches an object, or its status if `subresource` is set.
    ///
    /// The patch is computed from the current object and written back on the condition that the
    /// object has not changed meanwhile; a concurrent change fails the patch with a conflict.
    pub fn patch(
        &self,
        scope: &Scope,
        key: &ObjectKey,
        subresource: Option<Subresource>,
        patch: &Patch<Value>,
    ) -> Result<Arc<DynamicObject>> {
        let (patched, read) = self.compute_patch(scope, key, subresource, patch)?;
        self.commit_patch(scope, patched, read, subresource)
    }

    /// Reads an object and applies a patch to it, returning the result and the version it was
    /// computed from.
    pub(crate) fn compute_patch(
        &self,
        scope: &Scope,
        key: &ObjectKey,
        subresource: Option<Subresource>,
        patch: &Patch<Value>,
    ) -> Result<(DynamicObject, ResourceVersion)> {
        let current = self.record(scope, key)?;
        let patched = kubemem_k8s_patch::apply(
            &self.descriptor,
            &current.object,
            patch,
            subresource,
            Utc::now(),
        )?;
        Ok((patched, current.version))
    }

    /// Writes a patched object back if the object is still at the version it was read at.
    pub(crate) fn commit_patch(
        &self,
        scope: &Scope,
        patched: DynamicObject,
        read: ResourceVersion,
        subresource: Option<Subresource>,
    ) -> Result<Arc<DynamicObject>> {
        self.replace(scope, patched, Some(read), subresource, Verb::Patch)
    }

    /// Deletes an object, returning its final state.
    pub fn delete(
        &self,
        scope: &Scope,
        key: &ObjectKey,
        precondition: Option<ResourceVersion>,
    ) -> Result<Arc<DynamicObject>> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_running()?;
        let current = state
            .visible(scope, key)
            .map(|r| r.version)
            .ok_or_else(|| self.not_found(key))?;
        if let Some(expected) = precondition {
            self.check_version(key, expected, current)?;
        }
        self.remove(state, key).ok_or_else(|| self.not_found(key))
    }

    /// Deletes every object `criteria` selects, each as its own mutation.
    pub fn delete_collection(
        &self,
        scope: &Scope,
        criteria: Criteria,
    ) -> Result<Vec<Arc<DynamicObject>>> {
        self.check_fields(&criteria)?;
        let filter = Filter::new(criteria, scope.clone());

        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_running()?;
        let keys = state
            .records
            .iter()
            .filter(|(_, r)| filter.matches(&self.descriptor, &r.object))
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        Ok(keys
            .iter()
            .filter_map(|key| self.remove(state, key))
            .collect())
    }

    /// Rejects further mutations and watches, and closes every watch.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        state.shutdown = true;
        state
            .watchers
            .close_all(Closed::ShuttingDown, &self.metrics);
    }

    pub(crate) fn close_watch(&self, id: u64, reason: Option<Closed>) {
        self.state.write().watchers.close(id, reason, &self.metrics);
    }

    fn record(&self, scope: &Scope, key: &ObjectKey) -> Result<Record> {
        self.state
            .read()
            .visible(scope, key)
            .cloned()
            .ok_or_else(|| self.not_found(key))
    }

    fn replace(
        &self,
        scope: &Scope,
        mut obj: DynamicObject,
        expected: Option<ResourceVersion>,
        subresource: Option<Subresource>,
        verb: Verb,
    ) -> Result<Arc<DynamicObject>> {
        self.prepare(&mut obj)?;
        let key = self.descriptor.key(&obj)?;
        let expected = match expected {
            Some(expected) => Some(expected),
            None => ResourceVersion::parse_opt(
                obj.metadata.resource_version.as_deref().unwrap_or_default(),
            )?,
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        state.check_running()?;
        let current = state
            .visible(scope, &key)
            .cloned()
            .ok_or_else(|| self.not_found(&key))?;
        if let Some(expected) = expected {
            self.check_version(&key, expected, current.version)?;
        }

        let mut next = match subresource {
            Some(Subresource::Status) => {
                let mut next = (*current.object).clone();
                self.descriptor
                    .set_status(&mut next, self.descriptor.status(&obj).cloned());
                next
            }
            None => {
                if self.descriptor.has_status() {
                    let status = self.descriptor.status(&current.object).cloned();
                    self.descriptor.set_status(&mut obj, status);
                }
                obj
            }
        };
        scope.admit(self.kind(), &mut next)?;

        let changed = spec_changed(&current.object.data, &next.data);
        let version = self.sequence.advance();
        let prior = &current.object.metadata;
        let generation = prior.generation.unwrap_or(1);
        let meta = &mut next.metadata;
        meta.uid = prior.uid.clone();
        meta.creation_timestamp = prior.creation_timestamp.clone();
        meta.generation = Some(if changed { generation + 1 } else { generation });
        meta.resource_version = Some(version.to_string());
        let next = Arc::new(next);

        state.records.insert(
            key.clone(),
            Record {
                object: next.clone(),
                version,
            },
        );
        state.commit(
            &self.descriptor,
            Change::Updated {
                old: current.object,
                new: next.clone(),
            },
            version,
            &self.metrics,
        );
        self.metrics.mutation(verb);
        tracing::debug!(
            kind = self.kind(),
            %key,
            %version,
            subresource = subresource.map(|s| s.as_str()),
            verb = verb.as_str(),
            "Updated"
        );
        Ok(next)
    }

    /// Removes a live record, publishing its tombstone.
    fn remove(&self, state: &mut State, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        let record = state.records.remove(key)?;
        let version = self.sequence.advance();
        let mut tombstone = (*record.object).clone();
        tombstone.metadata.resource_version = Some(version.to_string());
        let tombstone = Arc::new(tombstone);

        state.commit(
            &self.descriptor,
            Change::Deleted(tombstone.clone()),
            version,
            &self.metrics,
        );
        self.metrics.mutation(Verb::Delete);
        tracing::debug!(kind = self.kind(), %key, %version, "Deleted");
        Some(tombstone)
    }

    /// Fills in the object's type and checks that it is well-formed for this kind.
    fn prepare(&self, obj: &mut DynamicObject) -> Result<()> {
        if obj.types.is_none() {
            obj.types = Some(self.descriptor.type_meta());
        }
        self.descriptor.validate(obj)
    }

    fn check_fields(&self, criteria: &Criteria) -> Result<()> {
        criteria.check_fields(|field| self.descriptor.supports_field(field))
    }

    fn check_version(
        &self,
        key: &ObjectKey,
        expected: ResourceVersion,
        current: ResourceVersion,
    ) -> Result<()> {
        if expected == current {
            return Ok(());
        }
        Err(Error::Conflict {
            kind: self.kind().to_string(),
            key: key.to_string(),
            expected,
            current,
        })
    }

    fn not_found(&self, key: &ObjectKey) -> Error {
        Error::NotFound {
            kind: self.kind().to_string(),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Debug for KindStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindStore")
            .field("descriptor", &self.descriptor)
            .field("config", &self.config)
            .finish()
    }
}

// === impl State ===

impl State {
    fn new(history: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            watchers: Watchers::default(),
            history: History::new(history),
            shutdown: false,
        }
    }

    /// Delivers a committed change to the watchers and retains it for resuming watches.
    fn commit(
        &mut self,
        descriptor: &Descriptor,
        change: Change,
        version: ResourceVersion,
        metrics: &KindMetrics,
    ) {
        self.watchers.publish(descriptor, &change, version, metrics);
        self.history.record(version, change);
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// Returns the record at `key` if it is visible in `scope`.
    fn visible(&self, scope: &Scope, key: &ObjectKey) -> Option<&Record> {
        self.records
            .get(key)
            .filter(|record| scope.contains(&record.object))
    }
}

/// Whether anything other than the status changed.
fn spec_changed(old: &Value, new: &Value) -> bool {
    let (old, new) = (old.as_object(), new.as_object());
    let count = |obj: Option<&serde_json::Map<String, Value>>| {
        obj.map_or(0, |obj| obj.keys().filter(|k| *k != "status").count())
    };
    count(old) != count(new)
        || old
            .into_iter()
            .flatten()
            .any(|(k, v)| k != "status" && new.and_then(|new| new.get(k)) != Some(v))
}
