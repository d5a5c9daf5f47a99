//! Loading and watching the balancer configuration file.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use strum::Display;
use tokio::sync::mpsc;

pub const DEFAULT_CONFIG_PATH: &str = "./conf/targetbalancer.yaml";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read configuration file {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("failed to parse configuration"))]
    Parse { source: serde_yaml::Error },
    #[snafu(display("duplicate job_name {job_name}"))]
    DuplicateJobName { job_name: String },
    #[snafu(display("failed to watch configuration file {}", path.display()))]
    Watch {
        source: notify::Error,
        path: PathBuf,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The assignment policy. Only least-connection exists; anything else in the
/// file is rejected at parse time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display)]
pub enum Mode {
    #[default]
    LeastConnection,
}

/// Top level of the configuration file. Unknown keys are a hard error.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    pub config: ScrapeConfigs,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeConfigs {
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeEntry>,
}

/// One scrape job: a unique name plus its discovery sources, kept as raw
/// YAML values here and resolved by the discovery adapter's kind registry.
#[derive(Clone, Debug, Deserialize)]
pub struct ScrapeEntry {
    pub job_name: String,
    #[serde(flatten)]
    pub sd_configs: BTreeMap<String, serde_yaml::Value>,
}

/// Parses and validates a configuration document.
pub fn parse(raw: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(raw).context(ParseSnafu)?;

    let mut seen = BTreeSet::new();
    for entry in &config.config.scrape_configs {
        if !seen.insert(entry.job_name.as_str()) {
            return DuplicateJobNameSnafu {
                job_name: entry.job_name.clone(),
            }
            .fail();
        }
    }
    Ok(config)
}

/// Reads and parses the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse(&raw)
}

/// Watches the configuration file and signals each change.
///
/// The returned watcher must be kept alive for as long as notifications are
/// wanted. Bursts of filesystem events collapse into a single pending
/// notification (the channel holds one slot).
pub fn spawn_watcher(
    path: PathBuf,
) -> Result<(mpsc::Receiver<()>, notify::RecommendedWatcher)> {
    let (tx, rx) = mpsc::channel(1);
    let mut watcher =
        notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
            match result {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(error = %error, "configuration watch error");
                }
            }
        })
        .context(WatchSnafu { path: &path })?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .context(WatchSnafu { path: &path })?;
    Ok((rx, watcher))
}
