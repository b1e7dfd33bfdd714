use super::*;
use kubemem_core::{Criteria, Error, ResourceVersion};

fn zone(value: &str) -> Criteria {
    Criteria::all().with_labels(format!("zone={value}").parse().unwrap())
}

fn watchers(view: &View, kind: &str) -> usize {
    view.store()
        .sizes()
        .into_iter()
        .find(|(k, _, _)| *k == kind)
        .map(|(_, _, watchers)| watchers)
        .unwrap()
}

#[tokio::test]
async fn list_then_watch_observes_only_later_changes() {
    let _trace = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("kubemem=trace")
        .try_init();

    let view = base();
    view.create("Node", node("node-a", &[])).unwrap();

    let list = view.list("Node", Criteria::all()).unwrap();
    assert_eq!(
        list.items.iter().map(|o| name(o)).collect::<Vec<_>>(),
        vec!["node-a"]
    );
    assert_eq!(list.resource_version, ResourceVersion::new(1));

    let mut watch = view
        .watch("Node", Criteria::all(), Some(list.resource_version), None)
        .unwrap();
    assert_idle(&mut watch);

    view.update("Node", node("node-a", &[("zone", "a")]), None, None)
        .unwrap();

    let event = next_event(&mut watch).await;
    assert_eq!(summary(&event), (EventType::Modified, "node-a".to_string(), 2));
    assert_eq!(
        event.object.metadata.labels.as_ref().unwrap().get("zone"),
        Some(&"a".to_string())
    );
    assert_idle(&mut watch);
}

#[tokio::test]
async fn watch_without_version_reports_live_objects() {
    let view = base();
    view.create("Node", node("node-a", &[])).unwrap();
    view.create("Pod", pod("ns-0", "web-0", "")).unwrap();
    view.create("Node", node("node-b", &[])).unwrap();
    view.update("Node", node("node-a", &[("zone", "a")]), None, None)
        .unwrap();
    view.create("Node", node("node-c", &[])).unwrap();
    view.delete("Node", &cluster("node-c"), None).unwrap();

    let mut all = view.watch("Node", Criteria::all(), None, None).unwrap();
    assert_eq!(
        summary(&next_event(&mut all).await),
        (EventType::Added, "node-b".to_string(), 3)
    );
    assert_eq!(
        summary(&next_event(&mut all).await),
        (EventType::Added, "node-a".to_string(), 4)
    );
    assert_idle(&mut all);
}

#[tokio::test]
async fn watch_resumes_from_history() {
    let view = base();
    view.create("Node", node("node-a", &[])).unwrap();
    view.create("Node", node("node-b", &[])).unwrap();

    let list = view.list("Node", Criteria::all()).unwrap();
    assert_eq!(list.resource_version, ResourceVersion::new(2));

    // Changes committed between the list and the watch are replayed as they happened.
    view.delete("Node", &cluster("node-a"), None).unwrap();
    view.update("Node", node("node-b", &[("zone", "a")]), None, None)
        .unwrap();

    let mut watch = view
        .watch("Node", Criteria::all(), Some(list.resource_version), None)
        .unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Deleted, "node-a".to_string(), 3)
    );
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Modified, "node-b".to_string(), 4)
    );
    assert_idle(&mut watch);

    view.create("Node", node("node-c", &[])).unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "node-c".to_string(), 5)
    );

    let mut zoned = view
        .watch("Node", zone("a"), Some(ResourceVersion::new(3)), None)
        .unwrap();
    assert_eq!(
        summary(&next_event(&mut zoned).await),
        (EventType::Added, "node-b".to_string(), 4)
    );
    assert_idle(&mut zoned);

    let mut current = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::new(5)), None)
        .unwrap();
    assert_idle(&mut current);
}

#[tokio::test]
async fn watch_from_evicted_version_is_gone() {
    let view = View::base(store_with(WatchConfig {
        history: 2,
        ..Default::default()
    }));
    for i in 0..3 {
        view.create("Node", node(&format!("node-{i}"), &[])).unwrap();
    }
    view.create("Pod", pod("ns-0", "web-0", "")).unwrap();

    let error = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::new(0)), None)
        .unwrap_err();
    assert!(error.is_gone(), "{error}");
    assert_eq!(error.code(), 410);
    assert!(matches!(
        error,
        Error::Gone { oldest, .. } if oldest == ResourceVersion::new(1)
    ));

    // Other kinds keep their own history.
    view.watch("Pod", Criteria::all(), Some(ResourceVersion::ZERO), None)
        .unwrap();

    let mut watch = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::new(1)), None)
        .unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "node-1".to_string(), 2)
    );
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "node-2".to_string(), 3)
    );
    assert_idle(&mut watch);
}

#[tokio::test]
async fn selection_changes_are_reported_as_added_and_deleted() {
    let view = base();
    let mut watch = view
        .watch("Node", zone("a"), Some(ResourceVersion::ZERO), None)
        .unwrap();

    view.create("Node", node("node-a", &[("zone", "b")])).unwrap();
    assert_idle(&mut watch);

    view.update("Node", node("node-a", &[("zone", "a")]), None, None)
        .unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "node-a".to_string(), 2)
    );

    view.update(
        "Node",
        node("node-a", &[("zone", "a"), ("pool", "blue")]),
        None,
        None,
    )
    .unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Modified, "node-a".to_string(), 3)
    );

    view.update("Node", node("node-a", &[("zone", "c")]), None, None)
        .unwrap();
    let departed = next_event(&mut watch).await;
    assert_eq!(
        summary(&departed),
        (EventType::Deleted, "node-a".to_string(), 4)
    );
    // The departing object is reported as the watcher last saw it.
    assert_eq!(
        departed.object.metadata.labels.as_ref().unwrap().get("zone"),
        Some(&"a".to_string())
    );
    assert_eq!(departed.object.metadata.resource_version.as_deref(), Some("4"));

    view.delete("Node", &cluster("node-a"), None).unwrap();
    assert_idle(&mut watch);
}

#[tokio::test]
async fn deletions_carry_the_deleting_version() {
    let view = base();
    view.create("Node", node("node-a", &[])).unwrap();
    let mut watch = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::new(1)), None)
        .unwrap();

    view.delete("Node", &cluster("node-a"), None).unwrap();
    let event = next_event(&mut watch).await;
    assert_eq!(summary(&event), (EventType::Deleted, "node-a".to_string(), 2));
    assert_eq!(event.object.metadata.resource_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn field_selectors_filter_watches() {
    let view = base();
    let criteria = Criteria::from_query(Some("ns-0"), None, Some("spec.nodeName=node-a")).unwrap();
    let mut watch = view
        .watch("Pod", criteria, Some(ResourceVersion::ZERO), None)
        .unwrap();

    view.create("Pod", pod("ns-0", "web-0", "node-b")).unwrap();
    view.create("Pod", pod("ns-1", "web-1", "node-a")).unwrap();
    view.create("Pod", pod("ns-0", "web-2", "")).unwrap();
    assert_idle(&mut watch);

    view.update("Pod", pod("ns-0", "web-2", "node-a"), None, None)
        .unwrap();
    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "web-2".to_string(), 4)
    );

    assert!(matches!(
        view.watch(
            "Pod",
            Criteria::from_query(None, None, Some("spec.unknown=x")).unwrap(),
            None,
            None
        ),
        Err(Error::InvalidSelector(_))
    ));
}

#[tokio::test]
async fn slow_watchers_are_disconnected() {
    let view = View::base(store_with(WatchConfig {
        queue_capacity: 2,
        ..Default::default()
    }));
    let mut slow = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::ZERO), None)
        .unwrap();
    let mut other = view
        .watch("ConfigMap", Criteria::all(), Some(ResourceVersion::ZERO), None)
        .unwrap();

    for i in 0..4 {
        view.create("Node", node(&format!("node-{i}"), &[])).unwrap();
    }
    assert_eq!(slow.closed(), Some(Closed::Overflowed));
    assert_eq!(watchers(&view, "Node"), 0);

    // Queued events are delivered before the watch reports why it ended.
    assert_eq!(next_event(&mut slow).await.resource_version.get(), 1);
    assert_eq!(next_event(&mut slow).await.resource_version.get(), 2);
    assert!(matches!(next(&mut slow).await, Some(Err(Closed::Overflowed))));
    assert!(next(&mut slow).await.is_none());

    // Other watchers are unaffected.
    view.create("ConfigMap", config_map("ns-0", "cfg")).unwrap();
    assert_eq!(
        summary(&next_event(&mut other).await),
        (EventType::Added, "cfg".to_string(), 5)
    );
}

#[tokio::test(start_paused = true)]
async fn watches_expire() {
    let view = base();
    let mut idle = view
        .watch(
            "Node",
            Criteria::all(),
            Some(ResourceVersion::ZERO),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    let mut busy = view
        .watch(
            "Node",
            Criteria::all(),
            Some(ResourceVersion::ZERO),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    assert_idle(&mut idle);

    tokio::time::advance(Duration::from_secs(11)).await;

    // A watcher past its deadline is closed rather than sent new events.
    view.create("Node", node("node-a", &[])).unwrap();
    assert_eq!(busy.closed(), Some(Closed::Expired));
    assert!(matches!(next(&mut busy).await, Some(Err(Closed::Expired))));

    assert!(matches!(next(&mut idle).await, Some(Err(Closed::Expired))));
    assert!(next(&mut idle).await.is_none());
    assert_eq!(watchers(&view, "Node"), 0);
}

#[tokio::test(start_paused = true)]
async fn requested_timeouts_are_bounded() {
    let view = View::base(store_with(WatchConfig {
        timeout: Duration::from_secs(5),
        ..Default::default()
    }));
    let mut watch = view
        .watch(
            "Node",
            Criteria::all(),
            None,
            Some(Duration::from_secs(3600)),
        )
        .unwrap();
    assert_idle(&mut watch);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(matches!(next(&mut watch).await, Some(Err(Closed::Expired))));
}

#[tokio::test]
async fn stopped_watches_drain_and_end() {
    let view = base();
    let mut watch = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::ZERO), None)
        .unwrap();
    view.create("Node", node("node-a", &[])).unwrap();

    watch.stop();
    view.create("Node", node("node-b", &[])).unwrap();

    assert_eq!(
        summary(&next_event(&mut watch).await),
        (EventType::Added, "node-a".to_string(), 1)
    );
    assert!(next(&mut watch).await.is_none());
    assert_eq!(watch.closed(), None);
}

#[tokio::test]
async fn dropped_watches_are_unregistered() {
    let view = base();
    let watch = view.watch("Node", Criteria::all(), None, None).unwrap();
    let _pods = view.watch("Pod", Criteria::all(), None, None).unwrap();
    assert_eq!(watchers(&view, "Node"), 1);
    assert_eq!(watchers(&view, "Pod"), 1);

    drop(watch);
    assert_eq!(watchers(&view, "Node"), 0);
    assert_eq!(watchers(&view, "Pod"), 1);
}

#[tokio::test]
async fn changes_to_other_kinds_are_not_delivered() {
    let view = base();
    let mut nodes = view
        .watch("Node", Criteria::all(), Some(ResourceVersion::ZERO), None)
        .unwrap();
    view.create("Pod", pod("ns-0", "web-0", "node-a")).unwrap();
    view.create("Node", node("node-a", &[])).unwrap();

    assert_eq!(
        summary(&next_event(&mut nodes).await),
        (EventType::Added, "node-a".to_string(), 2)
    );
    assert_idle(&mut nodes);
}
