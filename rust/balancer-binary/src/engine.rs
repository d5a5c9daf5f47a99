//! The assignment engine owns the authoritative mapping from scrape targets
//! to collectors and applies the least-connection placement policy.
//!
//! All mutation goes through the reconciliation loop; readers only ever see
//! state through the snapshots derived in [`crate::cache`].
use std::collections::{BTreeMap, BTreeSet};

use fnv::FnvHashMap;
use snafu::{ensure, Snafu};

use crate::cache::Snapshot;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("no collector instances available"))]
    NoCollectors,
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A single discovered scrape target.
///
/// Identity is `job_name` plus `address`; the label set is metadata carried
/// along for the serving layer and plays no part in identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetRecord {
    pub job_name: String,
    pub address: String,
    pub labels: BTreeMap<String, String>,
}

impl TargetRecord {
    pub fn key(&self) -> String {
        format!("{}{}", self.job_name, self.address)
    }
}

/// A known collector and the number of targets currently bound to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collector {
    pub id: String,
    pub assigned: usize,
}

/// Authoritative assignment state.
///
/// `collectors` is a `BTreeMap` so iteration is lexicographic by id, which
/// gives the least-connection pick its deterministic tie-break for free.
#[derive(Debug, Default)]
pub struct Engine {
    target_set: FnvHashMap<String, TargetRecord>,
    assignment: FnvHashMap<String, String>,
    collectors: BTreeMap<String, Collector>,
}

impl Engine {
    /// Reconciles the collector set against the latest membership listing.
    ///
    /// New ids join with an empty load; ids that disappeared are retired and
    /// their targets released back into the unbound pool, to be picked up by
    /// the next [`Engine::apply_targets`]. An empty membership leaves the
    /// state untouched and reports [`Error::NoCollectors`] so the caller can
    /// keep serving the previous assignment.
    pub fn replace_collectors(&mut self, ids: &BTreeSet<String>) -> Result<()> {
        ensure!(!ids.is_empty(), NoCollectorsSnafu);

        let retired: BTreeSet<String> = self
            .collectors
            .keys()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect();

        for id in &retired {
            self.collectors.remove(id);
        }
        if !retired.is_empty() {
            let before = self.assignment.len();
            self.assignment.retain(|_, owner| !retired.contains(owner));
            tracing::info!(
                retired = retired.len(),
                released_targets = before - self.assignment.len(),
                "collectors retired"
            );
        }

        for id in ids {
            self.collectors
                .entry(id.clone())
                .or_insert_with(|| Collector {
                    id: id.clone(),
                    assigned: 0,
                });
        }

        self.verify_counts();
        Ok(())
    }

    /// Replaces the desired target set and brings the assignment in line.
    ///
    /// Keys present in both the old and the new set keep their binding;
    /// removed keys are unbound, and every key without a binding (newly added
    /// or left over from an earlier collector outage) is placed via
    /// least-connection in sorted key order, so repeated runs over the same
    /// input give the same placement.
    pub fn apply_targets(&mut self, new_targets: FnvHashMap<String, TargetRecord>) -> Result<()> {
        let removed: Vec<String> = self
            .target_set
            .keys()
            .filter(|key| !new_targets.contains_key(*key))
            .cloned()
            .collect();
        for key in &removed {
            if let Some(owner) = self.assignment.remove(key) {
                if let Some(collector) = self.collectors.get_mut(&owner) {
                    collector.assigned -= 1;
                }
            }
        }
        self.target_set = new_targets;

        ensure!(!self.collectors.is_empty(), NoCollectorsSnafu);

        let mut unbound: Vec<String> = self
            .target_set
            .keys()
            .filter(|key| !self.assignment.contains_key(*key))
            .cloned()
            .collect();
        unbound.sort();
        for key in unbound {
            let owner = self.least_loaded().to_owned();
            if let Some(collector) = self.collectors.get_mut(&owner) {
                collector.assigned += 1;
            }
            self.assignment.insert(key, owner);
        }

        self.verify_counts();
        Ok(())
    }

    /// Derives the read-only serving views from a consistent read of state.
    pub fn snapshot(&self) -> Snapshot {
        let mut keys: Vec<&String> = self.assignment.keys().collect();
        keys.sort();
        Snapshot::derive(keys.into_iter().map(|key| {
            let record = self
                .target_set
                .get(key)
                .unwrap_or_else(|| panic!("assigned key {key:?} missing from target set"));
            (record, self.assignment[key].as_str())
        }))
    }

    pub fn collector(&self, id: &str) -> Option<&Collector> {
        self.collectors.get(id)
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    pub fn assignment_len(&self) -> usize {
        self.assignment.len()
    }

    pub fn assigned_to(&self, job_name: &str, address: &str) -> Option<&str> {
        self.assignment
            .get(&format!("{job_name}{address}"))
            .map(String::as_str)
    }

    /// Least-connection pick: minimum assigned count, ties broken by the
    /// lexicographically smallest id. Callers must ensure `collectors` is
    /// non-empty.
    fn least_loaded(&self) -> &str {
        let mut best: Option<&Collector> = None;
        for collector in self.collectors.values() {
            match best {
                Some(current) if collector.assigned >= current.assigned => {}
                _ => best = Some(collector),
            }
        }
        best.map(|collector| collector.id.as_str())
            .expect("least_loaded called with no collectors")
    }

    /// Re-derives per-collector loads from the assignment and cross-checks
    /// the counters. A mismatch means the internal bookkeeping is corrupt and
    /// the process must not keep serving from it.
    fn verify_counts(&self) {
        let mut loads: BTreeMap<&str, usize> = BTreeMap::new();
        for owner in self.assignment.values() {
            assert!(
                self.collectors.contains_key(owner),
                "assignment references unknown collector {owner:?}"
            );
            *loads.entry(owner.as_str()).or_default() += 1;
        }
        for collector in self.collectors.values() {
            let actual = loads.get(collector.id.as_str()).copied().unwrap_or(0);
            assert!(
                collector.assigned == actual,
                "collector {} load counter {} does not match assignment count {}",
                collector.id,
                collector.assigned,
                actual
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collectors(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn targets(job: &str, addresses: &[&str]) -> FnvHashMap<String, TargetRecord> {
        addresses
            .iter()
            .map(|address| {
                let record = TargetRecord {
                    job_name: job.to_string(),
                    address: address.to_string(),
                    labels: BTreeMap::new(),
                };
                (record.key(), record)
            })
            .collect()
    }

    #[test]
    fn initial_assignment_spreads_load() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-1", "col-2", "col-3"]))
            .unwrap();
        engine
            .apply_targets(targets("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6"]))
            .unwrap();

        for id in ["col-1", "col-2", "col-3"] {
            assert_eq!(engine.collector(id).unwrap().assigned, 2);
        }
        assert_eq!(engine.assignment_len(), 6);
    }

    #[test]
    fn tie_break_is_lexicographic() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-3", "col-1", "col-2"]))
            .unwrap();
        engine.apply_targets(targets("J", &["t:1"])).unwrap();

        assert_eq!(engine.assigned_to("J", "t:1"), Some("col-1"));
    }

    #[test]
    fn surviving_targets_keep_their_binding() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-1", "col-2", "col-3"]))
            .unwrap();
        engine
            .apply_targets(targets("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6"]))
            .unwrap();

        let before: Vec<Option<String>> = ["a:2", "a:3", "a:4", "a:5"]
            .iter()
            .map(|address| engine.assigned_to("J", address).map(str::to_owned))
            .collect();

        engine
            .apply_targets(targets("J", &["a:2", "a:3", "a:4", "a:5"]))
            .unwrap();

        assert_eq!(engine.assignment_len(), 4);
        for (address, owner) in ["a:2", "a:3", "a:4", "a:5"].iter().zip(before) {
            assert_eq!(engine.assigned_to("J", address), owner.as_deref());
        }
        let total: usize = ["col-1", "col-2", "col-3"]
            .iter()
            .map(|id| engine.collector(id).unwrap().assigned)
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn retirement_releases_and_rebalances() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-1", "col-2", "col-3"]))
            .unwrap();
        let full = targets("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6"]);
        engine.apply_targets(full.clone()).unwrap();

        engine
            .replace_collectors(&collectors(&["col-1", "col-2"]))
            .unwrap();
        engine.apply_targets(full).unwrap();

        assert!(engine.collector("col-3").is_none());
        assert_eq!(engine.collector_count(), 2);
        assert_eq!(engine.assignment_len(), 6);
        let col_1 = engine.collector("col-1").unwrap().assigned;
        let col_2 = engine.collector("col-2").unwrap().assigned;
        assert_eq!(col_1 + col_2, 6);
        assert!(col_1.abs_diff(col_2) <= 1);
    }

    #[test]
    fn empty_membership_is_rejected_without_mutation() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-1", "col-2"]))
            .unwrap();
        engine.apply_targets(targets("J", &["a:1", "a:2"])).unwrap();

        let err = engine.replace_collectors(&BTreeSet::new()).unwrap_err();
        assert!(matches!(err, Error::NoCollectors));
        assert_eq!(engine.collector_count(), 2);
        assert_eq!(engine.assignment_len(), 2);
    }

    #[test]
    fn unbound_targets_are_placed_on_retry() {
        let mut engine = Engine::default();
        let err = engine
            .apply_targets(targets("J", &["a:1", "a:2", "a:3"]))
            .unwrap_err();
        assert!(matches!(err, Error::NoCollectors));
        assert_eq!(engine.assignment_len(), 0);

        engine
            .replace_collectors(&collectors(&["col-1", "col-2", "col-3"]))
            .unwrap();
        engine
            .apply_targets(targets("J", &["a:1", "a:2", "a:3"]))
            .unwrap();

        assert_eq!(engine.assignment_len(), 3);
        for id in ["col-1", "col-2", "col-3"] {
            assert_eq!(engine.collector(id).unwrap().assigned, 1);
        }
    }

    #[test]
    fn load_spread_stays_within_one_without_retirement() {
        let mut engine = Engine::default();
        engine
            .replace_collectors(&collectors(&["col-1", "col-2", "col-3"]))
            .unwrap();
        engine
            .apply_targets(targets("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6", "a:7"]))
            .unwrap();

        let loads: Vec<usize> = ["col-1", "col-2", "col-3"]
            .iter()
            .map(|id| engine.collector(id).unwrap().assigned)
            .collect();
        let max = loads.iter().max().unwrap();
        let min = loads.iter().min().unwrap();
        assert!(max - min <= 1);
    }
}
