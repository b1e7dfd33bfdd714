use crate::{metrics::KindMetrics, store::KindStore, Scope};
use ahash::AHashMap;
use futures::Stream;
use kubemem_core::{Closed, Criteria, ResourceVersion};
use kubemem_k8s_api::{Candidate, Descriptor, DynamicObject};
use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant, Sleep},
};

/// Limits applied to every watch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// The number of undelivered events a watcher may hold before it is disconnected.
    pub queue_capacity: usize,

    /// The longest a watch may live. Callers may request a shorter timeout.
    pub timeout: Duration,

    /// The number of changes retained per kind, from which a watch may resume at an earlier
    /// version.
    pub history: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A change to an object, as seen by one watcher.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    pub type_: EventType,
    pub object: Arc<DynamicObject>,
    pub resource_version: ResourceVersion,
}

/// A stream of events for the objects selected by a watch.
///
/// Yields events in resource-version order. When the server closes the watch, the events that
/// were already queued are yielded first, followed by the [`Closed`] reason, after which the
/// stream ends. A watch stopped by its consumer (or dropped) simply ends.
pub struct Watch {
    id: u64,
    store: Arc<KindStore>,
    initial: VecDeque<WatchEvent>,
    rx: mpsc::Receiver<WatchEvent>,
    closed: Arc<OnceLock<Closed>>,
    deadline: Instant,
    // Created on first poll so that a watch may be set up outside of a runtime.
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

/// Selects the objects a watcher (or a list) observes.
#[derive(Clone, Debug, Default)]
pub(crate) struct Filter {
    pub(crate) criteria: Criteria,
    pub(crate) scope: Scope,
}

/// The watchers registered on one kind.
#[derive(Debug, Default)]
pub(crate) struct Watchers {
    next_id: u64,
    by_id: AHashMap<u64, Watcher>,
}

#[derive(Debug)]
struct Watcher {
    filter: Filter,
    tx: mpsc::Sender<WatchEvent>,
    closed: Arc<OnceLock<Closed>>,
    deadline: Instant,
}

/// A committed mutation, described by the object's state before and after.
#[derive(Clone, Debug)]
pub(crate) enum Change {
    Created(Arc<DynamicObject>),
    Updated {
        old: Arc<DynamicObject>,
        new: Arc<DynamicObject>,
    },
    Deleted(Arc<DynamicObject>),
}

/// The most recent changes to one kind.
///
/// A watch that resumes from an earlier version replays the changes committed after it. Once a
/// change is evicted, watches can no longer resume from before it.
#[derive(Debug)]
pub(crate) struct History {
    capacity: usize,
    changes: VecDeque<(ResourceVersion, Change)>,
    // The newest evicted version.
    compacted: ResourceVersion,
}

pub(crate) struct Registration {
    pub(crate) id: u64,
    pub(crate) rx: mpsc::Receiver<WatchEvent>,
    pub(crate) closed: Arc<OnceLock<Closed>>,
}

// === impl WatchConfig ===

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            timeout: Duration::from_secs(30 * 60),
            history: 1024,
        }
    }
}

impl WatchConfig {
    /// Bounds a requested timeout by the configured maximum.
    pub fn timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .map(|t| t.min(self.timeout))
            .unwrap_or(self.timeout)
    }
}

// === impl EventType ===

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

// === impl Filter ===

impl Filter {
    pub(crate) fn new(criteria: Criteria, scope: Scope) -> Self {
        Self { criteria, scope }
    }

    pub(crate) fn matches(&self, descriptor: &Descriptor, obj: &DynamicObject) -> bool {
        self.scope.contains(obj) && self.criteria.matches(&Candidate::new(descriptor, obj))
    }

    /// Returns the event this filter observes for a change, if any.
    ///
    /// An object that leaves the selection is reported as deleted, as of `version`. `departed`
    /// caches that stamped object so that it is built once per change.
    fn observe(
        &self,
        descriptor: &Descriptor,
        change: &Change,
        version: ResourceVersion,
        departed: &mut Option<Arc<DynamicObject>>,
    ) -> Option<WatchEvent> {
        let (type_, object) = match change {
            Change::Created(new) if self.matches(descriptor, new) => (EventType::Added, new.clone()),
            Change::Created(_) => return None,
            Change::Updated { old, new } => {
                match (self.matches(descriptor, old), self.matches(descriptor, new)) {
                    (true, true) => (EventType::Modified, new.clone()),
                    (false, true) => (EventType::Added, new.clone()),
                    (true, false) => {
                        let old = departed.get_or_insert_with(|| stamp(old, version));
                        (EventType::Deleted, old.clone())
                    }
                    (false, false) => return None,
                }
            }
            Change::Deleted(tombstone) if self.matches(descriptor, tombstone) => {
                (EventType::Deleted, tombstone.clone())
            }
            Change::Deleted(_) => return None,
        };
        Some(WatchEvent {
            type_,
            object,
            resource_version: version,
        })
    }
}

// === impl History ===

impl History {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            changes: VecDeque::with_capacity(capacity.min(1024)),
            compacted: ResourceVersion::ZERO,
        }
    }

    pub(crate) fn record(&mut self, version: ResourceVersion, change: Change) {
        if self.capacity == 0 {
            self.compacted = version;
            return;
        }
        while self.changes.len() >= self.capacity {
            if let Some((evicted, _)) = self.changes.pop_front() {
                self.compacted = evicted;
            }
        }
        self.changes.push_back((version, change));
    }

    /// The oldest version a watch may resume from.
    pub(crate) fn oldest(&self) -> ResourceVersion {
        self.compacted
    }

    /// Returns the events `filter` observes after `since`, oldest first.
    ///
    /// Returns `None` if changes after `since` have already been evicted.
    pub(crate) fn replay(
        &self,
        descriptor: &Descriptor,
        filter: &Filter,
        since: ResourceVersion,
    ) -> Option<Vec<WatchEvent>> {
        if since < self.compacted {
            return None;
        }
        let events = self
            .changes
            .iter()
            .filter(|(version, _)| *version > since)
            .filter_map(|(version, change)| {
                filter.observe(descriptor, change, *version, &mut None)
            })
            .collect();
        Some(events)
    }
}

// === impl Watchers ===

impl Watchers {
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn register(
        &mut self,
        filter: Filter,
        capacity: usize,
        deadline: Instant,
    ) -> Registration {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Arc::new(OnceLock::new());
        self.by_id.insert(
            id,
            Watcher {
                filter,
                tx,
                closed: closed.clone(),
                deadline,
            },
        );
        Registration { id, rx, closed }
    }

    /// Unregisters a watcher, recording why the server closed it.
    ///
    /// Returns true if the watcher was registered and `reason` became its terminal condition.
    pub(crate) fn close(&mut self, id: u64, reason: Option<Closed>, metrics: &KindMetrics) -> bool {
        match self.by_id.remove(&id) {
            Some(watcher) => match reason {
                Some(reason) => watcher.close(id, reason, metrics),
                None => {
                    tracing::info!(watcher = id, "Watch stopped");
                    false
                }
            },
            None => false,
        }
    }

    pub(crate) fn close_all(&mut self, reason: Closed, metrics: &KindMetrics) {
        for (id, watcher) in self.by_id.drain() {
            watcher.close(id, reason, metrics);
        }
    }

    /// Delivers a change to every watcher whose filter selected the object before or after it.
    ///
    /// Never blocks: a watcher whose queue is full is disconnected, and a watcher past its
    /// deadline is closed instead of receiving the event.
    pub(crate) fn publish(
        &mut self,
        descriptor: &Descriptor,
        change: &Change,
        version: ResourceVersion,
        metrics: &KindMetrics,
    ) {
        if self.by_id.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut departed = None;
        let mut delivered = 0;
        let mut closing = Vec::new();

        for (id, watcher) in self.by_id.iter() {
            if watcher.deadline <= now {
                closing.push((*id, Some(Closed::Expired)));
                continue;
            }

            let event = match watcher.filter.observe(descriptor, change, version, &mut departed) {
                Some(event) => event,
                None => continue,
            };
            match watcher.tx.try_send(event) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        kind = descriptor.kind(),
                        watcher = *id,
                        "Watcher fell behind; disconnecting"
                    );
                    closing.push((*id, Some(Closed::Overflowed)));
                }
                // The consumer is gone but has not unregistered yet.
                Err(mpsc::error::TrySendError::Closed(_)) => closing.push((*id, None)),
            }
        }

        metrics.delivered(delivered);
        for (id, reason) in closing {
            self.close(id, reason, metrics);
        }
    }
}

fn stamp(obj: &DynamicObject, version: ResourceVersion) -> Arc<DynamicObject> {
    let mut obj = obj.clone();
    obj.metadata.resource_version = Some(version.to_string());
    Arc::new(obj)
}

// === impl Watcher ===

impl Watcher {
    /// Dropping the watcher drops its sender, so its stream ends once the queue is drained.
    fn close(self, id: u64, reason: Closed, metrics: &KindMetrics) -> bool {
        if self.closed.set(reason).is_err() {
            return false;
        }
        metrics.closed(reason);
        tracing::info!(watcher = id, reason = reason.as_str(), "Watch closed");
        true
    }
}

// === impl Watch ===

impl Watch {
    pub(crate) fn new(
        store: Arc<KindStore>,
        registration: Registration,
        initial: VecDeque<WatchEvent>,
        deadline: Instant,
    ) -> Self {
        Self {
            id: registration.id,
            store,
            initial,
            rx: registration.rx,
            closed: registration.closed,
            deadline,
            sleep: None,
            done: false,
        }
    }

    /// Stops the watch. Events that were already queued are still yielded before the stream ends.
    pub fn stop(&mut self) {
        self.store.close_watch(self.id, None);
    }

    /// Returns the reason the server closed this watch, if it has.
    pub fn closed(&self) -> Option<Closed> {
        self.closed.get().copied()
    }
}

impl Stream for Watch {
    type Item = Result<WatchEvent, Closed>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(event) = this.initial.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        if this.closed.get().is_none() {
            let deadline = this.deadline;
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.store.close_watch(this.id, Some(Closed::Expired));
            }
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(this.closed.get().copied().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if !self.done {
            self.store.close_watch(self.id, None);
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("kind", &self.store.descriptor().kind())
            .field("initial", &self.initial.len())
            .field("closed", &self.closed.get())
            .finish()
    }
}
