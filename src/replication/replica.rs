//! Local Replica Slots
//!
//! A fixed set of in-memory replicas that every local write is applied to.
//! Failed slots stop receiving writes, so they drift from the others until
//! an operator looks at the consistency report. Nothing here repairs them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Health of a replica slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaHealth {
    Active,
    Failed,
}

struct ReplicaSlot {
    health: ReplicaHealth,
    data: HashMap<String, Map<String, Value>>,
    last_update: Option<i64>,
}

/// Replica slot summary
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSummary {
    pub id: String,
    pub health: ReplicaHealth,
    pub last_update: Option<i64>,
    pub records: usize,
}

/// One replica's copy of a resource
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSnapshot {
    pub replica_id: String,
    pub health: ReplicaHealth,
    pub data: Value,
    pub last_update: Option<i64>,
}

/// Result of comparing every replica's copy of a resource
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub resource_id: String,
    pub consistent: bool,
    /// Replicas whose copy differs from the first replica holding one
    pub divergent: Vec<String>,
    pub replicas: Vec<ReplicaSnapshot>,
}

impl ConsistencyReport {
    /// Turn a divergent report into a `DataDivergence` error
    pub fn into_result(self) -> Result<Self> {
        if self.consistent {
            Ok(self)
        } else {
            Err(Error::DataDivergence {
                resource_id: self.resource_id,
                replicas: self.divergent,
            })
        }
    }
}

/// The local replica slots, `replica-0` through `replica-{n-1}`
pub struct ReplicaSet {
    slots: BTreeMap<String, ReplicaSlot>,
}

impl ReplicaSet {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|i| {
                (
                    format!("replica-{}", i),
                    ReplicaSlot {
                        health: ReplicaHealth::Active,
                        data: HashMap::new(),
                        last_update: None,
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// Shallow-merge `payload` into every active slot's copy of the
    /// resource. Returns the number of slots written.
    pub fn apply(&mut self, resource_id: &str, payload: &Map<String, Value>, timestamp: i64) -> usize {
        let mut applied = 0;
        for (id, slot) in self.slots.iter_mut() {
            if slot.health != ReplicaHealth::Active {
                continue;
            }
            let record = slot.data.entry(resource_id.to_string()).or_default();
            for (key, value) in payload {
                record.insert(key.clone(), value.clone());
            }
            slot.last_update = Some(timestamp);
            tracing::trace!("Applied update for {} to {}", resource_id, id);
            applied += 1;
        }
        applied
    }

    pub fn set_health(&mut self, replica_id: &str, health: ReplicaHealth) -> Result<()> {
        let slot = self
            .slots
            .get_mut(replica_id)
            .ok_or_else(|| Error::ReplicaNotFound(replica_id.to_string()))?;
        slot.health = health;
        Ok(())
    }

    /// Every resource held by at least one slot
    pub fn resources(&self) -> BTreeSet<String> {
        self.slots
            .values()
            .flat_map(|slot| slot.data.keys().cloned())
            .collect()
    }

    /// Compare every slot holding `resource_id`, failed ones included
    pub fn check(&self, resource_id: &str) -> ConsistencyReport {
        let replicas: Vec<ReplicaSnapshot> = self
            .slots
            .iter()
            .filter_map(|(id, slot)| {
                slot.data.get(resource_id).map(|data| ReplicaSnapshot {
                    replica_id: id.clone(),
                    health: slot.health,
                    data: Value::Object(data.clone()),
                    last_update: slot.last_update,
                })
            })
            .collect();

        let divergent: Vec<String> = match replicas.first() {
            Some(reference) => replicas
                .iter()
                .filter(|r| r.data != reference.data)
                .map(|r| r.replica_id.clone())
                .collect(),
            None => Vec::new(),
        };

        ConsistencyReport {
            resource_id: resource_id.to_string(),
            consistent: divergent.is_empty(),
            divergent,
            replicas,
        }
    }

    pub fn summaries(&self) -> Vec<ReplicaSummary> {
        self.slots
            .iter()
            .map(|(id, slot)| ReplicaSummary {
                id: id.clone(),
                health: slot.health,
                last_update: slot.last_update,
                records: slot.data.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_apply_merges_shallowly() {
        let mut set = ReplicaSet::new(3);
        set.apply("p1", &object(json!({"name": "Ada", "ward": 3})), 10);
        set.apply("p1", &object(json!({"ward": 4, "notes": {"x": 1}})), 20);

        let report = set.check("p1");
        assert!(report.consistent);
        assert_eq!(report.replicas.len(), 3);
        assert_eq!(
            report.replicas[0].data,
            json!({"name": "Ada", "ward": 4, "notes": {"x": 1}})
        );
        assert_eq!(report.replicas[0].last_update, Some(20));
    }

    #[test]
    fn test_failed_slot_diverges() {
        let mut set = ReplicaSet::new(3);
        set.apply("p1", &object(json!({"a": 1})), 1);
        set.set_health("replica-1", ReplicaHealth::Failed).unwrap();
        assert_eq!(set.apply("p1", &object(json!({"b": 2})), 2), 2);

        let report = set.check("p1");
        assert!(!report.consistent);
        assert_eq!(report.divergent, vec!["replica-1".to_string()]);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, Error::DataDivergence { .. }));
    }

    #[test]
    fn test_unknown_resource_is_consistent() {
        let set = ReplicaSet::new(2);
        let report = set.check("missing");
        assert!(report.consistent);
        assert!(report.replicas.is_empty());
        assert!(set.resources().is_empty());
    }

    #[test]
    fn test_unknown_replica() {
        let mut set = ReplicaSet::new(1);
        assert!(matches!(
            set.set_health("replica-9", ReplicaHealth::Failed),
            Err(Error::ReplicaNotFound(_))
        ));
        assert_eq!(set.summaries()[0].id, "replica-0");
    }
}
