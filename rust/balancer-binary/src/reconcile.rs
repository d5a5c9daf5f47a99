//! The reconciliation loop: the single writer that drives the engine and
//! publishes snapshots.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use futures::Future;
use tokio::sync::mpsc;

use crate::cache::SnapshotCache;
use crate::config;
use crate::discovery::{AdapterHandle, DiscoveryAdapter, TargetMap};
use crate::engine::{Engine, TargetRecord};
use crate::membership::MembershipSource;

/// Knobs of the loop that come from the command line.
pub struct Settings {
    /// Periodic reconciliation interval.
    pub interval: Duration,
    /// Discovery re-evaluation interval for rebuilt adapters.
    pub refresh: Duration,
    /// Configuration file to re-read on change notifications.
    pub config_path: PathBuf,
}

pub struct Reconciler {
    engine: Engine,
    cache: Arc<SnapshotCache>,
    membership: Box<dyn MembershipSource>,
}

impl Reconciler {
    pub fn new(
        engine: Engine,
        cache: Arc<SnapshotCache>,
        membership: Box<dyn MembershipSource>,
    ) -> Self {
        Self {
            engine,
            cache,
            membership,
        }
    }

    /// One reconciliation pass: membership, then targets, then publish.
    ///
    /// Component failures downgrade the tick rather than abort the process:
    /// a membership error keeps the previous collector set, an engine error
    /// publishes nothing so readers keep the last good snapshot. Returns
    /// whether a snapshot was published.
    pub async fn tick(&mut self, latest_targets: Option<TargetMap>) -> bool {
        match self.membership.list_collectors().await {
            Ok(collectors) => {
                if let Err(error) = self.engine.replace_collectors(&collectors) {
                    tracing::warn!(error = %error, "membership rejected; retrying next tick");
                    return false;
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "listing collectors failed; reusing previous membership");
            }
        }

        match latest_targets {
            Some(map) => {
                if let Err(error) = self.engine.apply_targets(flatten_targets(&map)) {
                    tracing::warn!(error = %error, "applying targets failed; retrying next tick");
                    return false;
                }
            }
            None => {
                tracing::debug!("no discovery state yet; reconciling membership only");
            }
        }

        self.cache.publish(self.engine.snapshot());
        true
    }

    /// Runs the loop until `shutdown` resolves.
    ///
    /// Wakes on the periodic interval, on a fresh discovery push, and on a
    /// configuration change; every wake-up ends in one [`Reconciler::tick`]
    /// over the adapter's latest state.
    pub async fn run(
        mut self,
        mut adapter: AdapterHandle,
        settings: Settings,
        mut reload_rx: mpsc::Receiver<()>,
        shutdown: impl Future<Output = ()> + Unpin,
    ) {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = shutdown;
        let mut producer_alive = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = adapter.rx.changed(), if producer_alive => {
                    producer_alive = changed.is_ok();
                }
                Some(()) = reload_rx.recv() => {
                    if self.reload(&mut adapter, &settings) {
                        producer_alive = true;
                    }
                }
                _ = &mut shutdown => break,
            }
            let latest = adapter.rx.borrow().clone();
            self.tick(latest).await;
        }
        adapter.shutdown();
        tracing::info!("reconciliation loop stopped");
    }

    /// Re-reads the configuration and swaps in a fresh discovery adapter.
    ///
    /// Any failure keeps the previous configuration and adapter running.
    /// Engine state is untouched either way, so surviving targets keep
    /// their collector across the reload.
    fn reload(&mut self, adapter: &mut AdapterHandle, settings: &Settings) -> bool {
        let config = match config::load(&settings.config_path) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(error = %error, "configuration reload failed; keeping previous configuration");
                return false;
            }
        };
        match DiscoveryAdapter::from_config(&config) {
            Ok(rebuilt) => {
                adapter.shutdown();
                *adapter = rebuilt.spawn(settings.refresh);
                tracing::info!("configuration reloaded; discovery adapter rebuilt");
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "new configuration rejected; keeping previous discovery setup");
                false
            }
        }
    }
}

/// Flattens a discovery push into the engine's keyed record set.
pub fn flatten_targets(map: &TargetMap) -> FnvHashMap<String, TargetRecord> {
    let mut records = FnvHashMap::default();
    for (job_name, groups) in map {
        for group in groups {
            for address in &group.targets {
                let record = TargetRecord {
                    job_name: job_name.clone(),
                    address: address.clone(),
                    labels: group.labels.clone(),
                };
                records.insert(record.key(), record);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TargetGroup;
    use crate::membership;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StaticMembership(BTreeSet<String>);

    #[async_trait]
    impl MembershipSource for StaticMembership {
        async fn list_collectors(&self) -> Result<BTreeSet<String>, membership::Error> {
            Ok(self.0.clone())
        }
    }

    /// Fails every call after the first successful one.
    struct FlakyMembership {
        collectors: BTreeSet<String>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl MembershipSource for FlakyMembership {
        async fn list_collectors(&self) -> Result<BTreeSet<String>, membership::Error> {
            if self.failed.swap(true, Ordering::SeqCst) {
                // Emulate an apiserver hiccup.
                Err(membership::Error::ListPods {
                    source: kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "the server is currently unable to handle the request".to_string(),
                        reason: "ServiceUnavailable".to_string(),
                        code: 503,
                    }),
                })
            } else {
                Ok(self.collectors.clone())
            }
        }
    }

    fn collectors(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn target_map(job: &str, addresses: &[&str]) -> TargetMap {
        let group = TargetGroup {
            targets: addresses.iter().map(|address| address.to_string()).collect(),
            labels: Default::default(),
        };
        [(job.to_string(), vec![group])].into_iter().collect()
    }

    fn reconciler(membership: Box<dyn MembershipSource>) -> (Reconciler, Arc<SnapshotCache>) {
        let cache = Arc::new(SnapshotCache::default());
        (
            Reconciler::new(Engine::default(), cache.clone(), membership),
            cache,
        )
    }

    #[test]
    fn flatten_produces_one_record_per_address() {
        let map = target_map("J", &["a:1", "a:2"]);
        let records = flatten_targets(&map);

        assert_eq!(records.len(), 2);
        assert_eq!(records["Ja:1"].job_name, "J");
        assert_eq!(records["Ja:2"].address, "a:2");
    }

    #[tokio::test]
    async fn tick_publishes_a_snapshot() {
        let (mut reconciler, cache) = reconciler(Box::new(StaticMembership(collectors(&[
            "col-1", "col-2", "col-3",
        ]))));

        assert!(reconciler.tick(Some(target_map("J", &["a:1", "a:2"]))).await);

        let snapshot = cache.load();
        assert_eq!(snapshot.job_index.len(), 1);
        assert!(snapshot.job_index.contains_key("J"));
    }

    #[tokio::test]
    async fn tick_is_idempotent() {
        let (mut reconciler, cache) = reconciler(Box::new(StaticMembership(collectors(&[
            "col-1", "col-2", "col-3",
        ]))));
        let map = target_map("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6"]);

        assert!(reconciler.tick(Some(map.clone())).await);
        let first = serde_json::to_string(&cache.load().job_view).unwrap();

        assert!(reconciler.tick(Some(map)).await);
        let second = serde_json::to_string(&cache.load().job_view).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn membership_errors_keep_the_previous_collectors() {
        let (mut reconciler, cache) = reconciler(Box::new(FlakyMembership {
            collectors: collectors(&["col-1", "col-2"]),
            failed: AtomicBool::new(false),
        }));

        assert!(reconciler.tick(Some(target_map("J", &["a:1"]))).await);

        // The second listing fails; the previous membership keeps serving.
        assert!(reconciler.tick(Some(target_map("J", &["a:1", "a:2"]))).await);
        let snapshot = cache.load();
        let groups: usize = ["col-1", "col-2"]
            .iter()
            .filter_map(|id| snapshot.collector_groups("J", id))
            .flat_map(|groups| groups.iter())
            .map(|group| group.targets.len())
            .sum();
        assert_eq!(groups, 2);
    }

    #[tokio::test]
    async fn empty_membership_publishes_nothing() {
        let (mut reconciler, cache) = reconciler(Box::new(StaticMembership(BTreeSet::new())));

        assert!(!reconciler.tick(Some(target_map("J", &["a:1"]))).await);
        assert!(cache.load().job_index.is_empty());
    }

    #[tokio::test]
    async fn bindings_survive_target_churn_across_ticks() {
        let (mut reconciler, cache) = reconciler(Box::new(StaticMembership(collectors(&[
            "col-1", "col-2", "col-3",
        ]))));

        assert!(
            reconciler
                .tick(Some(target_map("J", &["a:1", "a:2", "a:3", "a:4", "a:5", "a:6"])))
                .await
        );
        let owner_of = |snapshot: &crate::cache::Snapshot, address: &str| -> Option<String> {
            ["col-1", "col-2", "col-3"].iter().find_map(|id| {
                snapshot.collector_groups("J", id).and_then(|groups| {
                    groups
                        .iter()
                        .any(|group| group.targets.iter().any(|t| t == address))
                        .then(|| id.to_string())
                })
            })
        };
        let before = owner_of(&cache.load(), "a:3");

        assert!(
            reconciler
                .tick(Some(target_map("J", &["a:2", "a:3", "a:4", "a:5"])))
                .await
        );
        assert_eq!(owner_of(&cache.load(), "a:3"), before);
    }
}
