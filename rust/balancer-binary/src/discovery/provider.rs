//! Runtime evaluation of a parsed [`SdConfig`] into target groups.
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use snafu::{ResultExt, Snafu};

use super::sd::{DnsRecordType, KubernetesRole, SdConfig};
use super::TargetGroup;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read target file {path}"))]
    ReadTargetFile {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("failed to parse target file {path}"))]
    ParseJsonTargetFile {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("failed to parse target file {path}"))]
    ParseYamlTargetFile {
        source: serde_yaml::Error,
        path: String,
    },
    #[snafu(display("failed to fetch targets from {url}"))]
    FetchTargets { source: reqwest::Error, url: String },
    #[snafu(display("failed to resolve {name}"))]
    Resolve {
        source: std::io::Error,
        name: String,
    },
    #[snafu(display("failed to build Kubernetes client"))]
    KubeClient { source: kube::Error },
    #[snafu(display("failed to list pods"))]
    ListPods { source: kube::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// One discovery source of one job, together with its last good result.
///
/// Evaluation failures are scoped to the provider: the caller keeps `last`
/// and retries on the next pass.
pub struct Provider {
    pub job_name: String,
    pub config: SdConfig,
    pub last: Vec<TargetGroup>,
    warned: bool,
    kube: Option<kube::Client>,
}

impl Provider {
    pub fn new(job_name: String, config: SdConfig) -> Self {
        Self {
            job_name,
            config,
            last: Vec::new(),
            warned: false,
            kube: None,
        }
    }

    /// Produces the complete current group list for this source.
    pub async fn evaluate(&mut self, http: &reqwest::Client) -> Result<Vec<TargetGroup>> {
        let config = self.config.clone();
        match &config {
            SdConfig::Static(config) => Ok(vec![TargetGroup {
                targets: config.targets.clone(),
                labels: config.labels.clone(),
            }]),
            SdConfig::File(config) => {
                let mut groups = Vec::new();
                for path in &config.files {
                    groups.extend(read_target_file(path).await?);
                }
                Ok(groups)
            }
            SdConfig::Http(config) => {
                let groups = http
                    .get(&config.url)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .context(FetchTargetsSnafu { url: config.url.as_str() })?
                    .json::<Vec<TargetGroup>>()
                    .await
                    .context(FetchTargetsSnafu { url: config.url.as_str() })?;
                Ok(groups)
            }
            SdConfig::Dns(config) => {
                let (record_type, port) = match (config.record_type, config.port) {
                    (DnsRecordType::A, Some(port)) | (DnsRecordType::Aaaa, Some(port)) => {
                        (config.record_type, port)
                    }
                    _ => {
                        self.warn_once("SRV lookups are not evaluated; no targets produced");
                        return Ok(Vec::new());
                    }
                };
                let mut groups = Vec::new();
                for name in &config.names {
                    groups.push(resolve_name(name, record_type, port).await?);
                }
                Ok(groups)
            }
            SdConfig::Kubernetes(config) => {
                if !matches!(config.role, KubernetesRole::Pod) {
                    self.warn_once("only the pod role is evaluated; no targets produced");
                    return Ok(Vec::new());
                }
                if self.kube.is_none() {
                    self.kube = Some(kube::Client::try_default().await.context(KubeClientSnafu)?);
                }
                let client = self.kube.clone().expect("client initialised above");
                let namespaces = &config.namespaces.names;
                let mut groups = Vec::new();
                if namespaces.is_empty() {
                    groups.extend(list_pod_targets(Api::all(client)).await?);
                } else {
                    for namespace in namespaces {
                        groups
                            .extend(list_pod_targets(Api::namespaced(client.clone(), namespace)).await?);
                    }
                }
                Ok(groups)
            }
            // The cloud control planes the original reached through its
            // discovery library; configs are validated but not evaluated here.
            _ => {
                self.warn_once("discovery kind is not evaluated by this service; no targets produced");
                Ok(Vec::new())
            }
        }
    }

    fn warn_once(&mut self, message: &str) {
        if !self.warned {
            self.warned = true;
            tracing::warn!(job = %self.job_name, kind = self.config.kind(), "{message}");
        }
    }
}

/// Reads one file-SD file: a JSON or YAML list of `{targets, labels}`.
async fn read_target_file(path: &str) -> Result<Vec<TargetGroup>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .context(ReadTargetFileSnafu { path })?;
    if path.ends_with(".json") {
        serde_json::from_str(&raw).context(ParseJsonTargetFileSnafu { path })
    } else {
        serde_yaml::from_str(&raw).context(ParseYamlTargetFileSnafu { path })
    }
}

/// Resolves one DNS name into a single group of `ip:port` targets.
async fn resolve_name(name: &str, record_type: DnsRecordType, port: u16) -> Result<TargetGroup> {
    let addresses = tokio::net::lookup_host((name, port))
        .await
        .context(ResolveSnafu { name })?;
    let want_v4 = matches!(record_type, DnsRecordType::A);
    let targets = addresses
        .filter(|address| address.is_ipv4() == want_v4)
        .map(|address| address.to_string())
        .collect();
    Ok(TargetGroup {
        targets,
        labels: [("__meta_dns_name".to_string(), name.to_string())]
            .into_iter()
            .collect(),
    })
}

/// Lists running pods and exposes each declared container port as a target.
async fn list_pod_targets(pods: Api<Pod>) -> Result<Vec<TargetGroup>> {
    let listed = pods
        .list(&ListParams::default())
        .await
        .context(ListPodsSnafu)?;
    let mut groups = Vec::new();
    for pod in listed {
        let Some(ip) = pod.status.as_ref().and_then(|status| status.pod_ip.clone()) else {
            continue;
        };
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();
        let ports: Vec<u16> = pod
            .spec
            .iter()
            .flat_map(|spec| &spec.containers)
            .flat_map(|container| container.ports.iter().flatten())
            .map(|port| port.container_port as u16)
            .collect();
        if ports.is_empty() {
            continue;
        }
        groups.push(TargetGroup {
            targets: ports.iter().map(|port| format!("{ip}:{port}")).collect(),
            labels: [
                ("__meta_kubernetes_pod_name".to_string(), name),
                ("__meta_kubernetes_namespace".to_string(), namespace),
            ]
            .into_iter()
            .collect(),
        });
    }
    Ok(groups)
}
