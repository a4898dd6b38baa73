//! Worker, Cluster and Lease records as the controller reads and writes them.
//!
//! Only the fields the controller touches are modelled. Every record carries
//! the [`ResourceVersion`] it was read at; stores accept a write only when
//! that version is still current.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{ClusterId, ResourceVersion, WorkerName, WorkerUid};
use serde::{Deserialize, Serialize};

// =============================================================================
// Conditions
// =============================================================================

/// Condition types understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// The record's subject is reachable and usable.
    Healthy,
}

impl ConditionType {
    /// All condition types, in display order.
    pub const ALL: &'static [ConditionType] = &[ConditionType::Healthy];
}

/// A single observed condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Condition set holding at most one entry per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// Inserts or replaces the condition of the same type.
    ///
    /// The transition time is only taken from `condition` when the status
    /// flips. Returns true if anything observable changed.
    pub fn set(&mut self, condition: Condition) -> bool {
        match self
            .0
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                let mut changed = false;
                if existing.status != condition.status {
                    existing.status = condition.status;
                    existing.last_transition_time = condition.last_transition_time;
                    changed = true;
                }
                if existing.reason != condition.reason {
                    existing.reason = condition.reason;
                    changed = true;
                }
                if existing.message != condition.message {
                    existing.message = condition.message;
                    changed = true;
                }
                changed
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    /// True only if the condition is present and its status is true.
    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.get(condition_type).is_some_and(|c| c.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Status written by the worker itself and by the balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clusters: BTreeSet<ClusterId>,
    #[serde(default)]
    pub conditions: Conditions,
}

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub name: WorkerName,
    pub uid: WorkerUid,
    pub version: ResourceVersion,
    pub created_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl Worker {
    /// A fresh registration for `name`, heartbeating as of `now`.
    pub fn new(name: WorkerName, now: DateTime<Utc>) -> Self {
        Self {
            name,
            uid: WorkerUid::new(),
            version: ResourceVersion::INITIAL,
            created_at: now,
            status: WorkerStatus {
                last_heartbeat: Some(now),
                ..WorkerStatus::default()
            },
        }
    }

    /// Last time the worker proved it was alive.
    ///
    /// Falls back to the creation time for a worker that registered but
    /// never heartbeated.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.status.last_heartbeat.unwrap_or(self.created_at)
    }

    /// True if the worker has not been seen since `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen() < cutoff
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Externally authored description of a managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub location: String,
}

/// Cluster status. The balancer only writes `assigned_worker`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub assigned_worker: Option<WorkerName>,
    #[serde(default)]
    pub conditions: Conditions,
}

/// A managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub version: ResourceVersion,
    pub spec: ClusterSpec,
    pub status: ClusterStatus,
}

impl Cluster {
    /// An unassigned cluster with no conditions.
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: ClusterId::new(),
            version: ResourceVersion::INITIAL,
            spec: ClusterSpec {
                name: name.into(),
                location: location.into(),
            },
            status: ClusterStatus::default(),
        }
    }

    /// True if the `Healthy` condition is present and true.
    pub fn is_healthy(&self) -> bool {
        self.status.conditions.is_true(ConditionType::Healthy)
    }

    /// True if the cluster names `worker` as its owner.
    pub fn is_assigned_to(&self, worker: &WorkerName) -> bool {
        self.status.assigned_worker.as_ref() == Some(worker)
    }
}

// =============================================================================
// Lease
// =============================================================================

/// The record competing controllers race on for the master role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub name: String,
    pub holder: Option<WorkerName>,
    #[serde(with = "duration_secs")]
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub leader_transitions: u32,
    pub version: ResourceVersion,
}

impl LeaseRecord {
    /// True if `identity` is the recorded holder.
    pub fn is_held_by(&self, identity: &WorkerName) -> bool {
        self.holder.as_ref() == Some(identity)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn healthy(status: bool, message: &str, at: DateTime<Utc>) -> Condition {
        Condition::new(ConditionType::Healthy, status, "HealthCheck", message, at)
    }

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut conditions = Conditions::default();
        assert!(conditions.set(healthy(false, "down", t(0))));
        assert!(!conditions.is_true(ConditionType::Healthy));

        assert!(conditions.set(healthy(true, "up", t(10))));
        assert_eq!(conditions.len(), 1);
        assert!(conditions.is_true(ConditionType::Healthy));
        assert_eq!(
            conditions.get(ConditionType::Healthy).unwrap().last_transition_time,
            t(10)
        );
    }

    #[test]
    fn test_set_condition_keeps_transition_time_without_flip() {
        let mut conditions = Conditions::default();
        conditions.set(healthy(true, "up", t(0)));

        assert!(!conditions.set(healthy(true, "up", t(30))));
        assert!(conditions.set(healthy(true, "still up", t(60))));
        assert_eq!(
            conditions.get(ConditionType::Healthy).unwrap().last_transition_time,
            t(0)
        );
    }

    #[test]
    fn test_cluster_without_conditions_is_unhealthy() {
        let cluster = Cluster::new("prod", "eu-west-1");
        assert!(!cluster.is_healthy());
    }

    #[test]
    fn test_worker_staleness_falls_back_to_creation_time() {
        let mut worker = Worker::new(WorkerName::new("w1").unwrap(), t(0));
        worker.status.last_heartbeat = None;

        assert!(worker.is_stale(t(1)));
        assert!(!worker.is_stale(t(0)));

        worker.status.last_heartbeat = Some(t(0) + TimeDelta::seconds(120));
        assert!(!worker.is_stale(t(60)));
    }

    #[test]
    fn test_worker_status_serialization() {
        let mut worker = Worker::new(WorkerName::new("w1").unwrap(), t(0));
        let cluster = ClusterId::new();
        worker.status.clusters.insert(cluster);

        let json = serde_json::to_value(&worker).unwrap();
        assert_eq!(json["name"], "w1");
        assert_eq!(json["version"], 1);
        assert_eq!(json["status"]["clusters"][0], cluster.to_string());
        assert!(json["status"]["lastHeartbeat"].is_string());
    }

    #[test]
    fn test_lease_duration_serialized_as_seconds() {
        let lease = LeaseRecord {
            name: "fleet-controller".to_string(),
            holder: None,
            lease_duration: Duration::from_secs(60),
            acquire_time: None,
            renew_time: None,
            leader_transitions: 0,
            version: ResourceVersion::INITIAL,
        };
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["leaseDuration"], 60);
    }
}
