//! Typed service-discovery configurations and the kind registry.
//!
//! Each recognised `<kind>_sd_configs` key maps to a parser that strictly
//! deserialises the raw YAML list into its per-kind config. Adding a kind is
//! a [`REGISTRY`] entry plus a config struct; nothing else changes.
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use strum::Display;

/// One entry of `static_configs`, targets spelled out in the scrape config
/// itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSdConfig {
    pub files: Vec<String>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSdConfig {
    pub url: String,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display)]
pub enum DnsRecordType {
    #[default]
    #[serde(rename = "SRV")]
    #[strum(serialize = "SRV")]
    Srv,
    A,
    #[serde(rename = "AAAA")]
    #[strum(serialize = "AAAA")]
    Aaaa,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSdConfig {
    pub names: Vec<String>,
    #[serde(default, rename = "type")]
    pub record_type: DnsRecordType,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum KubernetesRole {
    Pod,
    Service,
    Endpoints,
    Node,
    Ingress,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesNamespaces {
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesSdConfig {
    pub role: KubernetesRole,
    #[serde(default)]
    pub api_server: Option<String>,
    #[serde(default)]
    pub namespaces: KubernetesNamespaces,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureSdConfig {
    pub subscription_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub authentication_method: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulSdConfig {
    pub server: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DigitaloceanSdConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EurekaSdConfig {
    pub server: String,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GceSdConfig {
    pub project: String,
    pub zone: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HetznerSdConfig {
    pub role: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinodeSdConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tag_separator: Option<String>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarathonSdConfig {
    pub servers: Vec<String>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenstackSdConfig {
    pub role: String,
    pub region: String,
    #[serde(default)]
    pub identity_endpoint: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalewaySdConfig {
    pub role: String,
    pub project_id: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TritonSdConfig {
    pub account: String,
    pub dns_suffix: String,
    pub endpoint: String,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

/// A parsed service-discovery source for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdConfig {
    Static(StaticConfig),
    File(FileSdConfig),
    Http(HttpSdConfig),
    Dns(DnsSdConfig),
    Kubernetes(KubernetesSdConfig),
    Azure(AzureSdConfig),
    Consul(ConsulSdConfig),
    Digitalocean(DigitaloceanSdConfig),
    Eureka(EurekaSdConfig),
    Gce(GceSdConfig),
    Hetzner(HetznerSdConfig),
    Linode(LinodeSdConfig),
    Marathon(MarathonSdConfig),
    Openstack(OpenstackSdConfig),
    Scaleway(ScalewaySdConfig),
    Triton(TritonSdConfig),
}

impl SdConfig {
    /// The `<kind>_sd_configs` key this config was parsed from
    /// (`static_configs` for static entries).
    pub fn kind(&self) -> &'static str {
        match self {
            SdConfig::Static(_) => "static_configs",
            SdConfig::File(_) => "file_sd_configs",
            SdConfig::Http(_) => "http_sd_configs",
            SdConfig::Dns(_) => "dns_sd_configs",
            SdConfig::Kubernetes(_) => "kubernetes_sd_configs",
            SdConfig::Azure(_) => "azure_sd_configs",
            SdConfig::Consul(_) => "consul_sd_configs",
            SdConfig::Digitalocean(_) => "digitalocean_sd_configs",
            SdConfig::Eureka(_) => "eureka_sd_configs",
            SdConfig::Gce(_) => "gce_sd_configs",
            SdConfig::Hetzner(_) => "hetzner_sd_configs",
            SdConfig::Linode(_) => "linode_sd_configs",
            SdConfig::Marathon(_) => "marathon_sd_configs",
            SdConfig::Openstack(_) => "openstack_sd_configs",
            SdConfig::Scaleway(_) => "scaleway_sd_configs",
            SdConfig::Triton(_) => "triton_sd_configs",
        }
    }

    /// Post-parse validation of constraints serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            SdConfig::Dns(config) => match config.record_type {
                DnsRecordType::A | DnsRecordType::Aaaa if config.port.is_none() => {
                    Err(format!(
                        "dns record type {} requires a port",
                        config.record_type
                    ))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

pub type Parser = fn(&serde_yaml::Value) -> Result<Vec<SdConfig>, serde_yaml::Error>;

fn parse_list<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<Vec<T>, serde_yaml::Error> {
    serde_yaml::from_value(value.clone())
}

/// The recognised `*_sd_configs` kinds, in the order the original service
/// compiled them in.
pub static REGISTRY: &[(&str, Parser)] = &[
    ("azure_sd_configs", |v| {
        Ok(parse_list::<AzureSdConfig>(v)?.into_iter().map(SdConfig::Azure).collect())
    }),
    ("consul_sd_configs", |v| {
        Ok(parse_list::<ConsulSdConfig>(v)?.into_iter().map(SdConfig::Consul).collect())
    }),
    ("digitalocean_sd_configs", |v| {
        Ok(parse_list::<DigitaloceanSdConfig>(v)?.into_iter().map(SdConfig::Digitalocean).collect())
    }),
    ("dns_sd_configs", |v| {
        Ok(parse_list::<DnsSdConfig>(v)?.into_iter().map(SdConfig::Dns).collect())
    }),
    ("eureka_sd_configs", |v| {
        Ok(parse_list::<EurekaSdConfig>(v)?.into_iter().map(SdConfig::Eureka).collect())
    }),
    ("file_sd_configs", |v| {
        Ok(parse_list::<FileSdConfig>(v)?.into_iter().map(SdConfig::File).collect())
    }),
    ("gce_sd_configs", |v| {
        Ok(parse_list::<GceSdConfig>(v)?.into_iter().map(SdConfig::Gce).collect())
    }),
    ("hetzner_sd_configs", |v| {
        Ok(parse_list::<HetznerSdConfig>(v)?.into_iter().map(SdConfig::Hetzner).collect())
    }),
    ("http_sd_configs", |v| {
        Ok(parse_list::<HttpSdConfig>(v)?.into_iter().map(SdConfig::Http).collect())
    }),
    ("kubernetes_sd_configs", |v| {
        Ok(parse_list::<KubernetesSdConfig>(v)?.into_iter().map(SdConfig::Kubernetes).collect())
    }),
    ("linode_sd_configs", |v| {
        Ok(parse_list::<LinodeSdConfig>(v)?.into_iter().map(SdConfig::Linode).collect())
    }),
    ("marathon_sd_configs", |v| {
        Ok(parse_list::<MarathonSdConfig>(v)?.into_iter().map(SdConfig::Marathon).collect())
    }),
    ("openstack_sd_configs", |v| {
        Ok(parse_list::<OpenstackSdConfig>(v)?.into_iter().map(SdConfig::Openstack).collect())
    }),
    ("scaleway_sd_configs", |v| {
        Ok(parse_list::<ScalewaySdConfig>(v)?.into_iter().map(SdConfig::Scaleway).collect())
    }),
    ("triton_sd_configs", |v| {
        Ok(parse_list::<TritonSdConfig>(v)?.into_iter().map(SdConfig::Triton).collect())
    }),
];

/// Parses a `static_configs` list. Static entries are not part of the
/// `*_sd_configs` registry but share the same strictness.
pub fn parse_static(value: &serde_yaml::Value) -> Result<Vec<SdConfig>, serde_yaml::Error> {
    Ok(parse_list::<StaticConfig>(value)?
        .into_iter()
        .map(SdConfig::Static)
        .collect())
}

/// Looks up the parser for a `*_sd_configs` key, `None` when unrecognised.
pub fn lookup(kind: &str) -> Option<Parser> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, parser)| *parser)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(input: &str) -> serde_yaml::Value {
        serde_yaml::from_str(input).unwrap()
    }

    #[test]
    fn registry_covers_the_recognised_set() {
        for kind in [
            "azure", "consul", "digitalocean", "dns", "eureka", "file", "gce", "hetzner",
            "http", "kubernetes", "linode", "marathon", "openstack", "scaleway", "triton",
        ] {
            assert!(
                lookup(&format!("{kind}_sd_configs")).is_some(),
                "missing registry entry for {kind}"
            );
        }
        assert!(lookup("docker_sd_configs").is_none());
    }

    #[test]
    fn file_sd_parses() {
        let parser = lookup("file_sd_configs").unwrap();
        let configs = parser(&yaml("[{files: ['./conf/file_sd.json']}]")).unwrap();
        assert_eq!(
            configs,
            vec![SdConfig::File(FileSdConfig {
                files: vec!["./conf/file_sd.json".to_string()],
                refresh_interval: None,
            })]
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        let parser = lookup("dns_sd_configs").unwrap();
        assert!(parser(&yaml("[{names: 5}]")).is_err());
        assert!(parser(&yaml("[{names: ['x.svc'], nonsense: true}]")).is_err());
    }

    #[test]
    fn dns_address_records_require_a_port() {
        let parser = lookup("dns_sd_configs").unwrap();
        let configs = parser(&yaml("[{names: ['x.svc'], type: A}]")).unwrap();
        assert!(configs[0].validate().is_err());

        let configs = parser(&yaml("[{names: ['x.svc'], type: A, port: 9100}]")).unwrap();
        assert!(configs[0].validate().is_ok());

        // SRV carries its own ports.
        let configs = parser(&yaml("[{names: ['x.svc']}]")).unwrap();
        assert!(configs[0].validate().is_ok());
    }
}
