//! Read-optimized projections of the assignment, published atomically.
//!
//! The derivation runs once per reconciliation in the writer; HTTP readers
//! take the current [`Snapshot`] with a single atomic load and never touch
//! engine state.
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::discovery::TargetGroup;
use crate::engine::TargetRecord;

/// `{"_link": "/jobs/<job>/targets"}` entry of the job index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkLabel {
    #[serde(rename = "_link")]
    pub link: String,
}

/// Per-collector slice of a job: the collector's own link plus the target
/// groups currently bound to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollectorView {
    #[serde(rename = "_link")]
    pub link: String,
    pub targets: Vec<TargetGroup>,
}

/// Immutable serving views, all derived together from one consistent read.
///
/// Every map is a `BTreeMap` so the JSON encoding of a snapshot is stable;
/// group and address ordering follow the sorted identity-key iteration of
/// the derivation, which makes repeated derivations over unchanged state
/// byte-identical.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub job_index: BTreeMap<String, LinkLabel>,
    pub job_view: BTreeMap<String, BTreeMap<String, CollectorView>>,
    collector_groups: BTreeMap<(String, String), Vec<TargetGroup>>,
}

impl Snapshot {
    /// Builds the three views from `(record, collector id)` pairs.
    ///
    /// Callers must feed the pairs in sorted identity-key order; "first seen"
    /// group and address ordering is defined relative to that iteration.
    pub fn derive<'a>(records: impl Iterator<Item = (&'a TargetRecord, &'a str)>) -> Self {
        // (job, collector) -> groups, one group per distinct label set.
        let mut grouped: BTreeMap<(String, String), Vec<(String, TargetGroup)>> = BTreeMap::new();
        for (record, collector_id) in records {
            let fingerprint = label_fingerprint(&record.labels);
            let groups = grouped
                .entry((record.job_name.clone(), collector_id.to_string()))
                .or_default();
            match groups.iter_mut().find(|(seen, _)| *seen == fingerprint) {
                Some((_, group)) => group.targets.push(record.address.clone()),
                None => groups.push((
                    fingerprint,
                    TargetGroup {
                        targets: vec![record.address.clone()],
                        labels: record.labels.clone(),
                    },
                )),
            }
        }

        let mut snapshot = Snapshot::default();
        for ((job_name, collector_id), groups) in grouped {
            let groups: Vec<TargetGroup> = groups.into_iter().map(|(_, group)| group).collect();
            snapshot
                .job_view
                .entry(job_name.clone())
                .or_default()
                .insert(
                    collector_id.clone(),
                    CollectorView {
                        link: format!("/jobs/{job_name}/targets?collector_id={collector_id}"),
                        targets: groups.clone(),
                    },
                );
            snapshot
                .collector_groups
                .insert((job_name.clone(), collector_id), groups);
            snapshot.job_index.insert(
                job_name.clone(),
                LinkLabel {
                    link: format!("/jobs/{job_name}/targets"),
                },
            );
        }
        snapshot
    }

    /// The flat group list one collector fetches for one job.
    pub fn collector_groups(&self, job_name: &str, collector_id: &str) -> Option<&Vec<TargetGroup>> {
        self.collector_groups
            .get(&(job_name.to_string(), collector_id.to_string()))
    }
}

/// The single shared datum between the reconciliation writer and the HTTP
/// readers. Readers load without locking; the writer swaps in a complete
/// snapshot after each successful tick and the previous one is dropped when
/// the last reader releases it.
#[derive(Debug)]
pub struct SnapshotCache {
    current: ArcSwap<Snapshot>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
        }
    }
}

impl SnapshotCache {
    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

/// Canonical string form of a label set, used to split a (job, collector)
/// bucket into per-label-set target groups.
fn label_fingerprint(labels: &BTreeMap<String, String>) -> String {
    let mut out = String::from("{");
    for (index, (name, value)) in labels.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    out.push('}');
    out
}
