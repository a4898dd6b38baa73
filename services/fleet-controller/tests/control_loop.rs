//! End-to-end tests for the controller loop.
//!
//! Runs full controllers (registration, election, sweep and balance) against
//! a shared in-memory store with sub-second timings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use fleet_controller::{
    Cluster, Config, ControlLoop, LeaseStore, MemoryStore, RoleHandle, SystemClock,
    VersionedStore, Worker,
};
use fleet_id::{ClusterId, WorkerName};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

fn test_config(worker: &str) -> Config {
    Config {
        worker_name: WorkerName::new(worker).unwrap(),
        log_level: "debug".to_string(),
        lease_name: "fleet-controller".to_string(),
        lease_duration: Duration::from_millis(600),
        renew_deadline: Duration::from_millis(400),
        retry_period: Duration::from_millis(50),
        release_on_cancel: true,
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_ttl: Duration::from_secs(2),
        monitor_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_secs(2),
        retry_steps: 5,
    }
}

struct Running {
    role: RoleHandle,
    shutdown: watch::Sender<bool>,
    done: oneshot::Receiver<()>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn start(store: &Arc<MemoryStore>, worker: &str) -> Running {
    let controller = ControlLoop::new(
        test_config(worker),
        store.clone(),
        store.clone(),
        Arc::new(SystemClock),
    );
    let role = controller.role();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (done_tx, done) = oneshot::channel();
    let task = tokio::spawn(controller.run(shutdown_rx, done_tx));
    Running {
        role,
        shutdown,
        done,
        task,
    }
}

async fn stop(running: Running) {
    running.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running.done)
        .await
        .expect("controller should acknowledge shutdown")
        .unwrap();
    running.task.await.unwrap().unwrap();
}

async fn healthy_cluster(store: &MemoryStore, name: &str, owner: Option<&str>) -> ClusterId {
    let cluster = store.insert_cluster(Cluster::new(name, "eu")).await.unwrap();
    let mut cluster = store
        .set_cluster_healthy(&cluster.id, true, Utc::now())
        .await
        .unwrap();
    if let Some(owner) = owner {
        cluster.status.assigned_worker = Some(WorkerName::new(owner).unwrap());
        cluster = store.update_cluster_status(cluster).await.unwrap();
    }
    cluster.id
}

/// Polls until every given Cluster is owned by a registered Worker whose
/// record lists it.
async fn wait_until_assigned(store: &MemoryStore, ids: &[ClusterId], within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        let workers = store.list_workers().await.unwrap();
        let mut all = true;
        for id in ids {
            let cluster = store.get_cluster(id).await.unwrap();
            all &= workers
                .iter()
                .any(|w| cluster.is_assigned_to(&w.name) && w.status.clusters.contains(id));
        }
        if all {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_single_controller_converges_and_shuts_down() {
    let store = Arc::new(MemoryStore::new());

    let long_ago = Utc::now() - TimeDelta::minutes(10);
    store
        .create_worker(Worker::new(WorkerName::new("ghost").unwrap(), long_ago))
        .await
        .unwrap();
    let abandoned = healthy_cluster(&store, "abandoned", Some("ghost")).await;
    let fresh = healthy_cluster(&store, "fresh", None).await;

    let running = start(&store, "w1");
    assert!(wait_until_assigned(&store, &[abandoned, fresh], Duration::from_secs(5)).await);
    assert!(running.role.is_leader());

    let w1 = WorkerName::new("w1").unwrap();
    let worker = store.get_worker(&w1).await.unwrap();
    assert_eq!(worker.status.clusters, [abandoned, fresh].into_iter().collect());
    assert!(store.get_worker(&WorkerName::new("ghost").unwrap()).await.is_err());

    stop(running).await;

    assert!(store.get_worker(&w1).await.unwrap_err().is_not_found());
    let lease = store.get_lease("fleet-controller").await.unwrap();
    assert!(lease.holder.is_none());
}

#[tokio::test]
async fn test_two_controllers_share_the_fleet() {
    let store = Arc::new(MemoryStore::new());
    let mut ids = Vec::new();
    for name in ["a", "b", "c", "d"] {
        ids.push(healthy_cluster(&store, name, None).await);
    }

    let first = start(&store, "w1");
    let second = start(&store, "w2");

    // Wait for both registrations; either may end up owning the clusters.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while store.list_workers().await.unwrap().len() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(wait_until_assigned(&store, &ids, Duration::from_secs(5)).await);
    assert!(first.role.is_leader() ^ second.role.is_leader());

    let workers = store.list_workers().await.unwrap();
    let total: usize = workers.iter().map(|w| w.status.clusters.len()).sum();
    assert_eq!(total, ids.len());
    for worker in &workers {
        for id in &worker.status.clusters {
            let cluster = store.get_cluster(id).await.unwrap();
            assert!(cluster.is_assigned_to(&worker.name));
        }
    }

    stop(first).await;
    stop(second).await;
    assert!(store.list_workers().await.unwrap().is_empty());
}
