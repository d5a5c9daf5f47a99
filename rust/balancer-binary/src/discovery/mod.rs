//! The discovery adapter: turns the declarative scrape configuration into a
//! live stream of per-job target groups.
//!
//! Construction resolves every entry against the kind registry in [`sd`];
//! [`DiscoveryAdapter::spawn`] then runs a background task that re-evaluates
//! all providers and pushes the complete `job -> groups` map into a
//! `tokio::sync::watch` channel. The channel keeps only the latest value, so
//! a slow reconciler always observes coalesced current state.
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

pub mod provider;
pub mod sd;

use provider::Provider;

/// A set of addresses sharing one label set under a job. This is both the
/// shape file/http sources feed in and the shape the HTTP surface serves.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Complete current state: every job with at least one non-empty group.
pub type TargetMap = BTreeMap<String, Vec<TargetGroup>>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("invalid {kind} entry for job {job_name}"))]
    InvalidSdConfig {
        source: serde_yaml::Error,
        job_name: String,
        kind: String,
    },
    #[snafu(display("invalid {kind} entry for job {job_name}: {reason}"))]
    InvalidSdValues {
        job_name: String,
        kind: String,
        reason: String,
    },
    #[snafu(display("failed to build the discovery HTTP client"))]
    HttpClient { source: reqwest::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// All providers parsed out of one configuration, ready to run.
pub struct DiscoveryAdapter {
    providers: Vec<Provider>,
    http: reqwest::Client,
}

/// Handle to a running adapter: the latest-value subscription plus the task.
pub struct AdapterHandle {
    pub rx: watch::Receiver<Option<TargetMap>>,
    task: JoinHandle<()>,
}

impl AdapterHandle {
    /// Tears the background task down. Used on configuration reload and at
    /// shutdown; the receiver side stays valid and keeps its last value.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl DiscoveryAdapter {
    /// Resolves every scrape entry against the kind registry.
    ///
    /// Unrecognised `*_sd_configs` keys are skipped with a warning; a
    /// recognised key that fails its typed parse rejects the whole
    /// configuration, so a broken entry cannot silently drop a job.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers = Vec::new();
        for entry in &config.config.scrape_configs {
            for (key, value) in &entry.sd_configs {
                let parsed = if key == "static_configs" {
                    sd::parse_static(value).context(InvalidSdConfigSnafu {
                        job_name: entry.job_name.as_str(),
                        kind: key.as_str(),
                    })?
                } else if key.ends_with("_sd_configs") {
                    match sd::lookup(key) {
                        Some(parser) => parser(value).context(InvalidSdConfigSnafu {
                            job_name: entry.job_name.as_str(),
                            kind: key.as_str(),
                        })?,
                        None => {
                            tracing::warn!(
                                job = %entry.job_name,
                                kind = %key,
                                "ignoring unrecognised service discovery kind"
                            );
                            continue;
                        }
                    }
                } else {
                    // Not a discovery key (scrape intervals and the like);
                    // this service only routes targets.
                    continue;
                };
                for sd_config in parsed {
                    sd_config.validate().map_err(|reason| {
                        InvalidSdValuesSnafu {
                            job_name: entry.job_name.clone(),
                            kind: key.clone(),
                            reason,
                        }
                        .build()
                    })?;
                    providers.push(Provider::new(entry.job_name.clone(), sd_config));
                }
            }
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context(HttpClientSnafu)?;
        Ok(Self { providers, http })
    }

    /// Starts the background evaluation task and returns its handle.
    pub fn spawn(self, refresh: Duration) -> AdapterHandle {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(self.run(tx, refresh));
        AdapterHandle { rx, task }
    }

    async fn run(mut self, tx: watch::Sender<Option<TargetMap>>, refresh: Duration) {
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let map = self.collect().await;
            if tx.send(Some(map)).is_err() {
                // All subscribers are gone; nothing left to discover for.
                return;
            }
        }
    }

    /// Evaluates all providers into one full target map.
    ///
    /// A failing provider keeps its last good groups; empty groups and jobs
    /// without any targets are dropped from the map entirely.
    async fn collect(&mut self) -> TargetMap {
        let mut map = TargetMap::new();
        for provider in &mut self.providers {
            match provider.evaluate(&self.http).await {
                Ok(groups) => provider.last = groups,
                Err(error) => {
                    tracing::warn!(
                        job = %provider.job_name,
                        kind = provider.config.kind(),
                        error = %error,
                        "discovery evaluation failed; keeping previous targets"
                    );
                }
            }
            let groups: Vec<TargetGroup> = provider
                .last
                .iter()
                .filter(|group| !group.targets.is_empty())
                .cloned()
                .collect();
            if !groups.is_empty() {
                map.entry(provider.job_name.clone()).or_default().extend(groups);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn config(input: &str) -> Config {
        crate::config::parse(input).unwrap()
    }

    #[tokio::test]
    async fn static_and_file_entries_build_providers() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: prometheus
                  static_configs:
                    - targets: ['prom.domain:9001', 'prom.domain:9002']
                  file_sd_configs:
                    - files: ['./conf/file_sd.json']
        "});
        let adapter = DiscoveryAdapter::from_config(&config).unwrap();
        assert_eq!(adapter.providers.len(), 2);
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: prometheus
                  docker_sd_configs:
                    - host: unix:///var/run/docker.sock
                  static_configs:
                    - targets: ['prom.domain:9001']
        "});
        let adapter = DiscoveryAdapter::from_config(&config).unwrap();
        assert_eq!(adapter.providers.len(), 1);
    }

    #[tokio::test]
    async fn malformed_recognised_kind_fails_construction() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: prometheus
                  file_sd_configs:
                    - files: 5
        "});
        assert!(matches!(
            DiscoveryAdapter::from_config(&config),
            Err(Error::InvalidSdConfig { .. })
        ));
    }

    #[tokio::test]
    async fn dns_address_lookup_without_port_fails_construction() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: dns
                  dns_sd_configs:
                    - names: ['collectors.svc']
                      type: A
        "});
        assert!(matches!(
            DiscoveryAdapter::from_config(&config),
            Err(Error::InvalidSdValues { .. })
        ));
    }

    #[tokio::test]
    async fn collect_returns_full_state_and_drops_empty_jobs() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: prometheus
                  static_configs:
                    - targets: ['prom.domain:9001', 'prom.domain:9002']
                      labels: {my: label}
                - job_name: silent
                  static_configs:
                    - targets: []
        "});
        let mut adapter = DiscoveryAdapter::from_config(&config).unwrap();
        let map = adapter.collect().await;

        assert_eq!(map.len(), 1);
        assert_eq!(
            map["prometheus"][0].targets,
            vec!["prom.domain:9001", "prom.domain:9002"]
        );
        assert!(!map.contains_key("silent"));
    }

    #[tokio::test]
    async fn spawned_adapter_pushes_latest_state() {
        let config = config(indoc! {"
            mode: LeastConnection
            config:
              scrape_configs:
                - job_name: prometheus
                  static_configs:
                    - targets: ['prom.domain:9001']
        "});
        let adapter = DiscoveryAdapter::from_config(&config).unwrap();
        let mut handle = adapter.spawn(Duration::from_millis(10));

        handle.rx.changed().await.unwrap();
        let map = handle.rx.borrow().clone().unwrap();
        assert_eq!(map["prometheus"][0].targets, vec!["prom.domain:9001"]);
        handle.shutdown();
    }
}
