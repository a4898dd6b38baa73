//! Integration tests for sweep and balance passes against the in-memory store.
//!
//! Covers the placement scenarios and the fleet-wide properties a pass must
//! leave behind: no Cluster owned twice, Worker sets mirroring Cluster
//! owners, every healthy orphan placed, and no writes on a converged fleet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_controller::{
    AssignmentBalancer, Clock, Cluster, LivenessSweeper, ManualClock, MemoryStore,
    VersionedStore, Worker,
};
use fleet_id::{ClusterId, WorkerName};
use fleet_reconcile::RetryPolicy;
use proptest::prelude::*;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn name(s: &str) -> WorkerName {
    WorkerName::new(s).unwrap()
}

fn balancer(store: &Arc<MemoryStore>) -> AssignmentBalancer {
    AssignmentBalancer::new(store.clone(), RetryPolicy::immediate(5))
}

async fn add_worker(store: &MemoryStore, worker: &str, seen: DateTime<Utc>) {
    store.create_worker(Worker::new(name(worker), seen)).await.unwrap();
}

/// Inserts a Cluster, optionally healthy and owned, and records it in the
/// owner's set if that owner exists.
async fn add_cluster(
    store: &MemoryStore,
    cluster: &str,
    healthy: bool,
    owner: Option<&str>,
) -> ClusterId {
    let mut record = store.insert_cluster(Cluster::new(cluster, "eu")).await.unwrap();
    record = store.set_cluster_healthy(&record.id, healthy, t0()).await.unwrap();

    if let Some(owner) = owner {
        record.status.assigned_worker = Some(name(owner));
        store.update_cluster_status(record.clone()).await.unwrap();

        if let Ok(mut worker) = store.get_worker(&name(owner)).await {
            worker.status.clusters.insert(record.id);
            store.update_worker_status(worker).await.unwrap();
        }
    }
    record.id
}

/// Healthy Clusters per live Worker, as stored.
async fn loads(store: &MemoryStore) -> BTreeMap<WorkerName, usize> {
    let mut loads: BTreeMap<WorkerName, usize> = store
        .list_workers()
        .await
        .unwrap()
        .into_iter()
        .map(|w| (w.name, 0))
        .collect();
    for cluster in store.list_clusters().await.unwrap() {
        if !cluster.is_healthy() {
            continue;
        }
        let Some(owner) = cluster.status.assigned_worker else {
            continue;
        };
        if let Some(load) = loads.get_mut(&owner) {
            *load += 1;
        }
    }
    loads
}

fn spread(loads: &BTreeMap<WorkerName, usize>) -> usize {
    let max = loads.values().max().copied().unwrap_or(0);
    let min = loads.values().min().copied().unwrap_or(0);
    max - min
}

/// Every Worker's set is exactly the Clusters naming it, so no Cluster can
/// appear under two Workers.
async fn assert_bookkeeping_consistent(store: &MemoryStore) {
    let clusters = store.list_clusters().await.unwrap();
    let mut seen = BTreeSet::new();
    for worker in store.list_workers().await.unwrap() {
        let owned: BTreeSet<ClusterId> = clusters
            .iter()
            .filter(|c| c.is_assigned_to(&worker.name))
            .map(|c| c.id)
            .collect();
        assert_eq!(worker.status.clusters, owned, "worker {}", worker.name);
        for id in &worker.status.clusters {
            assert!(seen.insert(*id), "cluster {id} held by two workers");
        }
    }
}

#[tokio::test]
async fn test_orphans_fill_least_loaded_first() {
    let store = Arc::new(MemoryStore::new());
    for w in ["a", "b", "c"] {
        add_worker(&store, w, t0()).await;
    }
    add_cluster(&store, "b1", true, Some("b")).await;
    add_cluster(&store, "c1", true, Some("c")).await;
    add_cluster(&store, "c2", true, Some("c")).await;
    for orphan in ["x", "y", "z"] {
        add_cluster(&store, orphan, true, None).await;
    }

    let report = balancer(&store).balance().await.unwrap();

    assert_eq!(report.assigned.len(), 3);
    assert_eq!(report.assigned[0].1, name("a"));
    assert!(report.assigned[1].1 == name("a") || report.assigned[1].1 == name("b"));
    assert!(report.failed.is_empty());

    let loads = loads(&store).await;
    assert_eq!(report.loads, loads);
    assert!(spread(&loads) <= 1, "{loads:?}");
    assert_bookkeeping_consistent(&store).await;
}

#[tokio::test]
async fn test_stale_worker_clusters_move_to_survivors() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    add_worker(&store, "w1", t0()).await;
    let owned = [
        add_cluster(&store, "c1", true, Some("w1")).await,
        add_cluster(&store, "c2", true, Some("w1")).await,
    ];

    clock.advance(TimeDelta::minutes(6));
    add_worker(&store, "w2", clock.now()).await;
    add_worker(&store, "w3", clock.now()).await;

    let ttl = std::time::Duration::from_secs(300);
    let sweeper = LivenessSweeper::new(store.clone(), clock.clone(), ttl);
    let sweep = sweeper.sweep().await.unwrap();
    assert_eq!(sweep.evicted, vec![name("w1")]);

    // Evicting a worker leaves its clusters untouched.
    for id in &owned {
        let cluster = store.get_cluster(id).await.unwrap();
        assert!(cluster.is_assigned_to(&name("w1")));
    }

    let report = balancer(&store).balance().await.unwrap();
    assert_eq!(report.assigned.len(), 2);

    let loads = loads(&store).await;
    assert_eq!(loads.get(&name("w2")), Some(&1));
    assert_eq!(loads.get(&name("w3")), Some(&1));
    assert_bookkeeping_consistent(&store).await;
}

#[tokio::test]
async fn test_ghost_and_foreign_ids_are_pruned() {
    let store = Arc::new(MemoryStore::new());
    add_worker(&store, "a", t0()).await;
    add_worker(&store, "b", t0()).await;
    let owned_by_b = add_cluster(&store, "shared", true, Some("b")).await;
    let removed = add_cluster(&store, "gone", true, Some("a")).await;
    store.remove_cluster(&removed).await.unwrap();

    let mut a = store.get_worker(&name("a")).await.unwrap();
    a.status.clusters.insert(owned_by_b);
    store.update_worker_status(a).await.unwrap();

    let report = balancer(&store).balance().await.unwrap();

    assert_eq!(report.pruned, 2);
    let a = store.get_worker(&name("a")).await.unwrap();
    assert!(a.status.clusters.is_empty());
    let b = store.get_worker(&name("b")).await.unwrap();
    assert_eq!(b.status.clusters, [owned_by_b].into_iter().collect());
}

#[tokio::test]
async fn test_converged_fleet_is_not_written() {
    let store = Arc::new(MemoryStore::new());
    add_worker(&store, "a", t0()).await;
    add_worker(&store, "b", t0()).await;
    add_cluster(&store, "x", true, None).await;
    add_cluster(&store, "y", true, None).await;
    add_cluster(&store, "down", false, None).await;

    let first = balancer(&store).balance().await.unwrap();
    assert_eq!(first.assigned.len(), 2);

    let writes = store.write_count();
    let second = balancer(&store).balance().await.unwrap();

    assert_eq!(store.write_count(), writes);
    assert!(second.assigned.is_empty());
    assert_eq!(second.pruned + second.restored + second.skipped, 0);
}

#[tokio::test]
async fn test_unhealthy_clusters_keep_their_owner() {
    let store = Arc::new(MemoryStore::new());
    add_worker(&store, "a", t0()).await;
    let id = add_cluster(&store, "flaky", false, Some("dead")).await;

    let report = balancer(&store).balance().await.unwrap();

    assert!(report.assigned.is_empty());
    let cluster = store.get_cluster(&id).await.unwrap();
    assert!(cluster.is_assigned_to(&name("dead")));
}

#[tokio::test]
async fn test_brief_outage_mid_pass_is_absorbed() {
    let store = Arc::new(MemoryStore::new());
    add_worker(&store, "a", t0()).await;
    add_cluster(&store, "x", true, None).await;
    add_cluster(&store, "y", true, None).await;

    let balancer = balancer(&store);
    let snapshot = balancer.snapshot().await.unwrap();
    store.inject_unavailable(1);
    let report = balancer.balance_snapshot(snapshot).await;

    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.assigned.len(), 2);
    assert_bookkeeping_consistent(&store).await;
}

#[tokio::test]
async fn test_outage_outlasting_retries_is_reported_and_recovered() {
    let store = Arc::new(MemoryStore::new());
    add_worker(&store, "a", t0()).await;
    add_cluster(&store, "x", true, None).await;
    add_cluster(&store, "y", true, None).await;

    // Five attempts, each failing: the claim write, then four re-reads.
    let balancer = balancer(&store);
    let snapshot = balancer.snapshot().await.unwrap();
    store.inject_unavailable(5);
    let report = balancer.balance_snapshot(snapshot).await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.assigned.len(), 1);

    let report = balancer.balance().await.unwrap();
    assert_eq!(report.assigned.len(), 1);
    assert_bookkeeping_consistent(&store).await;
}

// =============================================================================
// Properties
// =============================================================================

const LIVE: usize = 4;
const OWNERS: usize = 6;

#[derive(Debug, Clone)]
struct ClusterSeed {
    healthy: bool,
    /// Index into `w0..w5`; indices from `live` upwards are dead workers.
    owner: Option<usize>,
}

fn cluster_seed() -> impl Strategy<Value = ClusterSeed> {
    (any::<bool>(), proptest::option::of(0..OWNERS))
        .prop_map(|(healthy, owner)| ClusterSeed { healthy, owner })
}

async fn seed_fleet(live: usize, seeds: &[ClusterSeed]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..live {
        add_worker(&store, &format!("w{i}"), t0()).await;
    }
    for (i, seed) in seeds.iter().enumerate() {
        let owner = seed.owner.map(|o| format!("w{o}"));
        add_cluster(&store, &format!("c{i}"), seed.healthy, owner.as_deref()).await;
    }
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_single_owner_and_orphan_convergence(
        live in 0..=LIVE,
        seeds in proptest::collection::vec(cluster_seed(), 0..16),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let store = seed_fleet(live, &seeds).await;
            let before = store.list_clusters().await.unwrap();
            let original_spread = spread(&loads(&store).await);

            let report = balancer(&store).balance().await.unwrap();
            prop_assert!(report.failed.is_empty());

            assert_bookkeeping_consistent(&store).await;

            let live_names: BTreeSet<WorkerName> =
                (0..live).map(|i| name(&format!("w{i}"))).collect();
            for old in &before {
                let now = store.get_cluster(&old.id).await.unwrap();
                let validly_owned = old
                    .status
                    .assigned_worker
                    .as_ref()
                    .is_some_and(|w| live_names.contains(w));

                if validly_owned {
                    prop_assert_eq!(&now.status.assigned_worker, &old.status.assigned_worker);
                } else if old.is_healthy() && live > 0 {
                    let owner = now.status.assigned_worker.clone();
                    prop_assert!(owner.is_some_and(|w| live_names.contains(&w)));
                } else {
                    prop_assert_eq!(&now.status.assigned_worker, &old.status.assigned_worker);
                }
            }

            if live > 0 {
                prop_assert!(spread(&loads(&store).await) <= original_spread + 1);
                prop_assert_eq!(report.unassignable, 0);
            }
            Ok(())
        })?;
    }
}
