//! Collector membership: who is currently around to take targets.
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use snafu::{ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to list collector pods"))]
    ListPods { source: kube::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Reports the identities of the currently known collectors. No ordering is
/// implied; callers get a set. Errors are transient, the reconciler keeps
/// its previous membership.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn list_collectors(&self) -> Result<BTreeSet<String>>;
}

/// Lists collector pods in one namespace by label selector; pod names are
/// the collector identities.
pub struct KubeMembership {
    pods: Api<Pod>,
    selector: String,
}

impl KubeMembership {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            selector: selector_string(label_selector),
        }
    }
}

#[async_trait]
impl MembershipSource for KubeMembership {
    async fn list_collectors(&self) -> Result<BTreeSet<String>> {
        let mut params = ListParams::default();
        if !self.selector.is_empty() {
            params = params.labels(&self.selector);
        }
        let pods = self.pods.list(&params).await.context(ListPodsSnafu)?;
        Ok(pods.into_iter().map(|pod| pod.name_any()).collect())
    }
}

/// `k1=v1,k2=v2` form the Kubernetes API expects for label selection.
fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
