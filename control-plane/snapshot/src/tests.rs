use crate::*;
use futures::prelude::*;
use maplit::btreemap;
use mesh_control_core::{
    resource::{FaultRule, HealthStatus},
    ConsumerGroup, FaultService, GoDuration, InMemoryFaultStore, Locality, MultiZoneState,
    NetworkFault, Readiness, ServiceInstance, ServiceInstances, View, ZoneState,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio_test::{assert_pending, assert_ready, task};
use tracing::Level;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .try_init()
        .ok();
}

fn zone(name: &str, locality: Locality, services: Vec<ServiceInstances>) -> ZoneState {
    ZoneState {
        services: services.into_iter().collect(),
        locality,
        zone: name.to_string(),
    }
}

fn service(name: &str, instances: impl IntoIterator<Item = ServiceInstance>) -> ServiceInstances {
    ServiceInstances::new(name, instances)
}

fn single_zone(services: Vec<ServiceInstances>) -> MultiZoneState {
    MultiZoneState::new(vec![zone("dc1", Locality::Local, services)])
}

fn mk_builder(config: BuilderConfig) -> SnapshotBuilder {
    SnapshotBuilder::new(config, ResourceCaches::default())
}

fn delay(id: &str, source: &str, target: &str, ms: u64) -> NetworkFault {
    NetworkFault::new(
        id,
        source,
        target,
        GoDuration::from_millis(ms),
        GoDuration::from_millis(60_000),
    )
}

// === Builder ===

#[test]
fn builds_endpoints_for_every_zone() {
    let state = MultiZoneState::new(vec![
        zone(
            "dc2",
            Locality::Remote,
            vec![service("a", [ServiceInstance::new("a-2", "10.1.0.1", 80)])],
        ),
        zone(
            "dc1",
            Locality::Local,
            vec![service(
                "a",
                [
                    ServiceInstance::new("a-1", "10.0.0.1", 80)
                        .with_tags(["canary", "weight:10"])
                        .with_canary(true)
                        .with_weight(10),
                    ServiceInstance::new("a-3", "10.0.0.3", 80).with_healthy(false),
                ],
            )],
        ),
    ]);
    let global = mk_builder(BuilderConfig::default()).global(&state, None);

    let cla = &global.endpoints["a"];
    assert_eq!(cla.cluster_name, "a");
    assert_eq!(
        cla.endpoints
            .iter()
            .map(|l| (l.zone.as_str(), l.priority, l.lb_endpoints.len()))
            .collect::<Vec<_>>(),
        vec![("dc1", 0, 2), ("dc2", 1, 1)],
    );

    let canary = &cla.endpoints[0].lb_endpoints[0];
    assert_eq!(canary.address, "10.0.0.1");
    assert_eq!(canary.load_balancing_weight, Some(10));
    assert_eq!(canary.health_status, HealthStatus::Healthy as i32);
    assert_eq!(
        canary.metadata,
        btreemap! {
            "canary".to_string() => "1".to_string(),
            "lb_regular".to_string() => "true".to_string(),
        }
    );
    assert_eq!(canary.tags, vec!["canary", "weight:10"]);

    let unhealthy = &cla.endpoints[0].lb_endpoints[1];
    assert_eq!(unhealthy.health_status, HealthStatus::Unhealthy as i32);
    assert_eq!(
        unhealthy.metadata,
        btreemap! { "lb_regular".to_string() => "true".to_string() }
    );

    assert_eq!(global.clusters["a"].connect_timeout_ms, 1000);
}

#[test]
fn http2_requires_the_tag_on_every_instance() {
    let builder = mk_builder(BuilderConfig::default());
    let state = single_zone(vec![
        service(
            "a",
            [
                ServiceInstance::new("a-1", "10.0.0.1", 80).with_tags(["envoy"]),
                ServiceInstance::new("a-2", "10.0.0.2", 80).with_tags(["envoy"]),
            ],
        ),
        service(
            "b",
            [
                ServiceInstance::new("b-1", "10.0.0.3", 80).with_tags(["envoy"]),
                ServiceInstance::new("b-2", "10.0.0.4", 80),
            ],
        ),
        ServiceInstances::empty("c"),
    ]);
    let global = builder.global(&state, None);
    assert!(global.clusters["a"].http2);
    assert!(!global.clusters["b"].http2);
    assert!(!global.clusters["c"].http2, "an empty service is not http2");

    // A service that loses all of its instances keeps its setting.
    let emptied = single_zone(vec![ServiceInstances::empty("a")]);
    let next = builder.global(&emptied, Some(&global));
    assert!(next.clusters["a"].http2);
    assert!(next.endpoints["a"].endpoints.is_empty());

    let disabled = mk_builder(BuilderConfig {
        http2_tag: None,
        ..BuilderConfig::default()
    })
    .global(&state, None);
    assert!(!disabled.clusters["a"].http2);
}

#[test]
fn departed_clusters_are_kept_when_configured() {
    let before = single_zone(vec![
        service("a", [ServiceInstance::new("a-1", "10.0.0.1", 80)]),
        service("b", [ServiceInstance::new("b-1", "10.0.0.2", 80)]),
    ]);
    let after = single_zone(vec![service(
        "a",
        [ServiceInstance::new("a-1", "10.0.0.1", 80)],
    )]);

    let builder = mk_builder(BuilderConfig::default());
    let previous = builder.global(&before, None);
    let global = builder.global(&after, Some(&previous));
    assert_eq!(global.clusters.keys().collect::<Vec<_>>(), vec!["a"]);

    let builder = mk_builder(BuilderConfig {
        never_remove_clusters: true,
        ..BuilderConfig::default()
    });
    let previous = builder.global(&before, None);
    let global = builder.global(&after, Some(&previous));
    assert_eq!(global.clusters.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert!(global.endpoints["b"].endpoints.is_empty());
}

#[test]
fn groups_select_their_dependencies() {
    let builder = mk_builder(BuilderConfig {
        wildcard_excluded_prefixes: vec!["internal-".to_string()],
        ..BuilderConfig::default()
    });
    let state = MultiZoneState::new(vec![
        zone(
            "dc1",
            Locality::Local,
            vec![
                service("a", [ServiceInstance::new("a-1", "10.0.0.1", 80)]),
                service("b", [ServiceInstance::new("b-1", "10.0.0.2", 80)]),
                service("internal-x", [ServiceInstance::new("x-1", "10.0.0.3", 80)]),
            ],
        ),
        zone(
            "dc2",
            Locality::Remote,
            vec![service("b", [ServiceInstance::new("b-2", "10.1.0.2", 80)])],
        ),
    ]);
    let global = builder.global(&state, None);

    let wildcard = builder.group(&ConsumerGroup::all_services("web"), &global, &[], 1);
    assert_eq!(wildcard.cluster_names().collect::<Vec<_>>(), vec!["a", "b"]);

    let explicit = builder.group(
        &ConsumerGroup::services("web", ["b", "internal-x", "missing"]),
        &global,
        &[],
        1,
    );
    assert_eq!(
        explicit.cluster_names().collect::<Vec<_>>(),
        vec!["b", "internal-x"]
    );
    assert_eq!(explicit.endpoints_for("b").unwrap().endpoints.len(), 2);
    let routes = &explicit.routes.resources()[0];
    assert_eq!(routes.name, EGRESS_ROUTES);
    assert_eq!(
        routes
            .virtual_hosts
            .iter()
            .map(|vh| vh.name.as_str())
            .collect::<Vec<_>>(),
        vec!["b", "internal-x"]
    );

    let local = builder.group(
        &ConsumerGroup::services("web", ["b"]).with_view(View::Local),
        &global,
        &[],
        1,
    );
    let endpoints = &local.endpoints_for("b").unwrap().endpoints;
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].zone, "dc1");
}

#[test]
fn faults_attach_to_the_target_virtual_host() {
    let builder = mk_builder(BuilderConfig::default());
    let state = single_zone(vec![
        service("b", [ServiceInstance::new("b-1", "10.0.0.2", 80)]),
        service("c", [ServiceInstance::new("c-1", "10.0.0.3", 80)]),
    ]);
    let global = builder.global(&state, None);
    let faults = [
        delay("f2", "a", "b", 250),
        delay("f1", "*", "b", 100),
        delay("f3", "a", "unknown", 100),
    ];

    let group = ConsumerGroup::services("a", ["b", "c"]);
    let snapshot = builder.group(&group, &global, &faults, 1);
    let hosts = &snapshot.routes.resources()[0].virtual_hosts;
    assert_eq!(
        hosts[0].faults,
        vec![
            FaultRule {
                fault_id: "f1".to_string(),
                upstream_cluster: "b".to_string(),
                downstream_nodes: vec!["*".to_string()],
                fixed_delay_ms: 100,
                percentage: 100,
            },
            FaultRule {
                fault_id: "f2".to_string(),
                upstream_cluster: "b".to_string(),
                downstream_nodes: vec!["a".to_string()],
                fixed_delay_ms: 250,
                percentage: 100,
            },
        ]
    );
    assert!(hosts[1].faults.is_empty());
}

#[test]
fn equal_groups_share_serialized_resources() {
    let builder = mk_builder(BuilderConfig::default());
    let state = single_zone(vec![service(
        "b",
        [ServiceInstance::new("b-1", "10.0.0.2", 80)],
    )]);
    let global = builder.global(&state, None);

    let a = builder.group(&ConsumerGroup::services("a", ["b"]), &global, &[], 1);
    let c = builder.group(&ConsumerGroup::services("c", ["b"]), &global, &[], 1);
    assert!(a.clusters.ptr_eq(&c.clusters));
    assert!(a.endpoints.ptr_eq(&c.endpoints));
    assert!(a.routes.ptr_eq(&c.routes));
    assert_eq!(builder.caches().clusters.serializations(), 1);
    assert!(a.clusters.wire().is_some());

    let again = builder.group(&ConsumerGroup::services("a", ["b"]), &global, &[], 2);
    assert_eq!(again.versions, a.versions, "rebuilding unchanged content keeps versions");
}

// === Store ===

fn mk_snapshot(
    builder: &SnapshotBuilder,
    group: &ConsumerGroup,
    generation: u64,
    ip: &str,
) -> Snapshot {
    let state = single_zone(vec![service("b", [ServiceInstance::new("b-1", ip, 80)])]);
    builder.group(group, &builder.global(&state, None), &[], generation)
}

#[test]
fn publishes_in_generation_order() {
    let builder = mk_builder(BuilderConfig::default());
    let store = SnapshotStore::default();
    let group = ConsumerGroup::services("a", ["b"]);
    let mut rx = store.subscribe(group.clone());

    assert_eq!(
        store.publish(mk_snapshot(&builder, &group, 2, "10.0.0.1")),
        Publish::Applied
    );
    assert!(rx.has_changed().unwrap());
    rx.borrow_and_update();

    assert_eq!(
        store.publish(mk_snapshot(&builder, &group, 1, "10.0.0.9")),
        Publish::Stale
    );
    assert!(!rx.has_changed().unwrap());
    assert_eq!(store.snapshot(&group).unwrap().generation, 2);

    assert_eq!(
        store.publish(mk_snapshot(&builder, &group, 3, "10.0.0.1")),
        Publish::Unchanged
    );
    assert!(!rx.has_changed().unwrap());
    assert_eq!(store.snapshot(&group).unwrap().generation, 3);

    assert_eq!(
        store.publish(mk_snapshot(&builder, &group, 4, "10.0.0.2")),
        Publish::Applied
    );
    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone().unwrap();
    assert_eq!(
        snapshot.endpoints_for("b").unwrap().endpoints[0].lb_endpoints[0].address,
        "10.0.0.2"
    );
}

#[test]
fn groups_without_subscribers_are_pruned() {
    let builder = mk_builder(BuilderConfig::default());
    let store = SnapshotStore::default();
    let a = ConsumerGroup::services("a", ["b"]);
    let c = ConsumerGroup::services("c", ["b"]);
    let _a = store.subscribe(a.clone());
    let c_rx = store.subscribe(c.clone());
    assert_eq!(store.groups().len(), 2);

    drop(c_rx);
    assert_eq!(store.prune().into_iter().collect::<Vec<_>>(), vec![a]);
    assert_eq!(
        store.publish(mk_snapshot(&builder, &c, 1, "10.0.0.1")),
        Publish::Unsubscribed
    );
    assert!(store.snapshot(&c).is_none());
}

#[tokio::test]
async fn watches_published_snapshots() {
    let builder = mk_builder(BuilderConfig::default());
    let store = SnapshotStore::default();
    let group = ConsumerGroup::services("a", ["b"]);

    assert!(store.get_snapshot(&group).await.unwrap().is_none());
    let mut stream = store
        .watch_snapshot(group.clone())
        .await
        .unwrap()
        .expect("stream must be returned");

    let mut next = task::spawn(stream.next());
    assert_pending!(next.poll());

    store.publish(mk_snapshot(&builder, &group, 1, "10.0.0.1"));
    assert!(next.is_woken());
    let snapshot = assert_ready!(next.poll()).expect("stream must not end");
    assert_eq!(snapshot.generation, 1);
    drop(next);

    let current = store.get_snapshot(&group).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&current, &snapshot));
}

#[tokio::test]
async fn new_groups_are_announced() {
    let store = SnapshotStore::default();
    let mut added = task::spawn(store.group_added());
    assert_pending!(added.poll());

    let _rx = store.subscribe(ConsumerGroup::all_services("a"));
    assert!(added.is_woken());
    assert_ready!(added.poll());

    let mut added = task::spawn(store.group_added());
    let _again = store.subscribe(ConsumerGroup::all_services("a"));
    assert_pending!(added.poll(), "existing groups are not announced");
}

// === Updater ===

struct Fixture {
    updater: Updater,
    states: watch::Sender<Option<Arc<MultiZoneState>>>,
    store: SnapshotStore,
    faults: FaultService,
    readiness: Arc<Readiness>,
    metrics: SnapshotMetrics,
}

fn mk_updater() -> Fixture {
    let (states, rx) = watch::channel(None);
    let store = SnapshotStore::default();
    let faults = FaultService::new(InMemoryFaultStore::shared());
    let readiness = Readiness::shared();
    let metrics = SnapshotMetrics::default();
    let updater = Updater::new(
        Arc::new(mk_builder(BuilderConfig::default())),
        store.clone(),
        faults.clone(),
        readiness.clone(),
        metrics.clone(),
        UpdaterConfig {
            state_sample: Duration::from_millis(10),
        },
        rx,
    );
    Fixture {
        updater,
        states,
        store,
        faults,
        readiness,
        metrics,
    }
}

fn two_services(x_ip: &str, y_ip: &str) -> Arc<MultiZoneState> {
    Arc::new(single_zone(vec![
        service("x", [ServiceInstance::new("x-1", x_ip, 80)]),
        service("y", [ServiceInstance::new("y-1", y_ip, 80)]),
    ]))
}

#[tokio::test]
async fn updater_publishes_and_marks_ready() {
    init_tracing();
    let mut fx = mk_updater();
    let group = ConsumerGroup::services("a", ["x"]);
    let _rx = fx.store.subscribe(group.clone());

    fx.updater.update().await;
    assert!(!fx.readiness.is_initial_state_loaded());
    assert!(fx.store.snapshot(&group).is_none());

    fx.states.send_replace(Some(Arc::new(single_zone(vec![]))));
    fx.updater.update().await;
    assert!(
        !fx.readiness.is_initial_state_loaded(),
        "a state without services is never published"
    );

    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.2")));
    fx.updater.update().await;
    assert!(fx.readiness.is_initial_state_loaded());
    let snapshot = fx.store.snapshot(&group).expect("snapshot must be published");
    assert_eq!(snapshot.cluster_names().collect::<Vec<_>>(), vec!["x"]);
    assert_eq!(fx.metrics.publications("applied"), 1);
}

#[tokio::test]
async fn empty_states_keep_published_snapshots() {
    init_tracing();
    let mut fx = mk_updater();
    let group = ConsumerGroup::services("a", ["x", "y"]);
    let _rx = fx.store.subscribe(group.clone());
    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.2")));
    fx.updater.update().await;
    let before = fx.store.snapshot(&group).expect("snapshot must be published");

    fx.states
        .send_replace(Some(Arc::new(single_zone(vec![]))));
    fx.updater.update().await;
    let after = fx.store.snapshot(&group).expect("snapshot must be kept");
    assert_eq!(after.generation, before.generation);
    assert_eq!(
        after.cluster_names().collect::<Vec<_>>(),
        before.cluster_names().collect::<Vec<_>>(),
    );
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn unaffected_groups_are_not_rebuilt() {
    init_tracing();
    let mut fx = mk_updater();
    let on_x = ConsumerGroup::services("a", ["x"]);
    let on_y = ConsumerGroup::services("b", ["y"]);
    let wildcard = ConsumerGroup::all_services("c");
    let _x = fx.store.subscribe(on_x.clone());
    let _y = fx.store.subscribe(on_y.clone());
    let _all = fx.store.subscribe(wildcard.clone());

    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.2")));
    fx.updater.update().await;
    assert_eq!(fx.metrics.publications("applied"), 3);

    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.9")));
    fx.updater.update().await;
    assert_eq!(fx.store.snapshot(&on_x).unwrap().generation, 1);
    assert_eq!(fx.store.snapshot(&on_y).unwrap().generation, 2);
    assert_eq!(fx.store.snapshot(&wildcard).unwrap().generation, 2);
    assert_eq!(fx.metrics.publications("applied"), 5);
}

#[tokio::test]
async fn fault_changes_rebuild_snapshots() {
    init_tracing();
    let mut fx = mk_updater();
    let group = ConsumerGroup::services("a", ["x", "y"]);
    let _rx = fx.store.subscribe(group.clone());
    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.2")));
    fx.updater.update().await;
    let before = fx.store.snapshot(&group).unwrap();

    fx.faults
        .submit(delay("slow-y", "a", "y", 300))
        .await
        .unwrap();
    fx.updater.update().await;
    let after = fx.store.snapshot(&group).unwrap();
    assert_eq!(after.generation, 2);
    assert_eq!(after.versions.clusters, before.versions.clusters);
    assert_ne!(after.versions.routes, before.versions.routes);
    let hosts = &after.routes.resources()[0].virtual_hosts;
    assert_eq!(hosts[1].faults[0].fault_id, "slow-y");
    assert_eq!(hosts[1].faults[0].fixed_delay_ms, 300);

    fx.faults.delete("slow-y").await.unwrap();
    fx.updater.update().await;
    let cleared = fx.store.snapshot(&group).unwrap();
    assert!(cleared.routes.resources()[0]
        .virtual_hosts
        .iter()
        .all(|vh| vh.faults.is_empty()));
}

#[tokio::test]
async fn run_serves_groups_added_later() {
    init_tracing();
    let fx = mk_updater();
    fx.states
        .send_replace(Some(two_services("10.0.0.1", "10.0.0.2")));
    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(fx.updater.run(shutdown));

    let group = ConsumerGroup::services("a", ["y"]);
    let mut rx = fx.store.subscribe(group);
    tokio::time::timeout(Duration::from_secs(5), rx.changed())
        .await
        .expect("snapshot must be published")
        .unwrap();
    let snapshot = rx.borrow_and_update().clone().unwrap();
    assert_eq!(snapshot.cluster_names().collect::<Vec<_>>(), vec!["y"]);
    assert!(fx.readiness.is_initial_state_loaded());

    signal.drain().await;
    task.await.unwrap();
}
