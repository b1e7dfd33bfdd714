use crate::Store;
use kubemem_core::Closed;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};

/// Counters shared by every kind in a store.
#[derive(Clone, Debug, Default)]
pub struct StoreMetrics {
    mutations: Family<MutationLabels, Counter>,
    events: Family<KindLabels, Counter>,
    closed: Family<ClosedLabels, Counter>,
}

/// A kind's handle on the store metrics.
#[derive(Clone, Debug)]
pub(crate) struct KindMetrics {
    kind: &'static str,
    metrics: StoreMetrics,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) enum Verb {
    Create,
    Update,
    Patch,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct MutationLabels {
    kind: &'static str,
    verb: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClosedLabels {
    kind: &'static str,
    reason: &'static str,
}

#[derive(Debug)]
struct Instrumented(Store);

/// Registers a collector that reports the size of each kind's table and watcher set.
pub fn register_collector(reg: &mut Registry, store: Store) {
    reg.register_collector(Box::new(Instrumented(store)));
}

// === impl StoreMetrics ===

impl StoreMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let mutations = Family::default();
        reg.register(
            "mutations",
            "Count of committed mutations by kind and verb",
            mutations.clone(),
        );

        let events = Family::default();
        reg.register(
            "watch_events",
            "Count of events delivered to watchers",
            events.clone(),
        );

        let closed = Family::default();
        reg.register(
            "watch_closed",
            "Count of watches closed by the server, by reason",
            closed.clone(),
        );

        Self {
            mutations,
            events,
            closed,
        }
    }

    pub(crate) fn kind(&self, kind: &'static str) -> KindMetrics {
        KindMetrics {
            kind,
            metrics: self.clone(),
        }
    }
}

// === impl KindMetrics ===

impl KindMetrics {
    pub(crate) fn mutation(&self, verb: Verb) {
        self.metrics
            .mutations
            .get_or_create(&MutationLabels {
                kind: self.kind,
                verb: verb.as_str(),
            })
            .inc();
    }

    pub(crate) fn delivered(&self, events: u64) {
        if events > 0 {
            self.metrics
                .events
                .get_or_create(&KindLabels { kind: self.kind })
                .inc_by(events);
        }
    }

    pub(crate) fn closed(&self, reason: Closed) {
        self.metrics
            .closed
            .get_or_create(&ClosedLabels {
                kind: self.kind,
                reason: reason.as_str(),
            })
            .inc();
    }
}

// === impl Verb ===

impl Verb {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let sizes = self.0.sizes();

        let mut objects_encoder = encoder.encode_descriptor(
            "objects",
            "The number of live objects of each kind",
            None,
            MetricType::Gauge,
        )?;
        for (kind, objects, _) in &sizes {
            let labels = vec![("kind", *kind)];
            let objects = ConstGauge::new(*objects as i64);
            objects.encode(objects_encoder.encode_family(&labels)?)?;
        }

        let mut watchers_encoder = encoder.encode_descriptor(
            "watchers",
            "The number of active watchers of each kind",
            None,
            MetricType::Gauge,
        )?;
        for (kind, _, watchers) in &sizes {
            let labels = vec![("kind", *kind)];
            let watchers = ConstGauge::new(*watchers as i64);
            watchers.encode(watchers_encoder.encode_family(&labels)?)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn counters_are_labeled_by_kind() {
        let mut reg = Registry::default();
        let metrics = StoreMetrics::register(&mut reg);
        let pods = metrics.kind("Pod");
        pods.mutation(Verb::Create);
        pods.mutation(Verb::Create);
        pods.delivered(3);
        pods.closed(Closed::Overflowed);

        let mut text = String::new();
        encode(&mut text, &reg).unwrap();
        assert!(
            text.contains(r#"mutations_total{kind="Pod",verb="create"} 2"#),
            "{text}"
        );
        assert!(text.contains(r#"watch_events_total{kind="Pod"} 3"#), "{text}");
        assert!(
            text.contains(r#"watch_closed_total{kind="Pod",reason="overflowed"} 1"#),
            "{text}"
        );
    }
}
