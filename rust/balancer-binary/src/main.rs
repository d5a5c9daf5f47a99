mod cache;
mod config;
mod discovery;
mod engine;
mod membership;
mod reconcile;
mod server;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{crate_description, crate_version, Parser};
use futures::FutureExt;
use tracing_subscriber::EnvFilter;

use crate::cache::SnapshotCache;
use crate::discovery::DiscoveryAdapter;
use crate::engine::Engine;
use crate::membership::KubeMembership;
use crate::reconcile::{Reconciler, Settings};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Debug, Parser)]
#[clap(about, version)]
struct Args {
    /// Balancer configuration file.
    #[clap(long, env = "CONFIG_PATH", default_value = config::DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,

    /// Port the HTTP surface listens on.
    #[clap(long, env = "PORT", default_value = "3030")]
    port: u16,

    #[clap(long, env = "BIND_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_addr: IpAddr,

    /// Namespace the collector pods live in.
    #[clap(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Seconds between reconciliation ticks.
    #[clap(long, default_value = "30")]
    interval: u64,

    /// Seconds between discovery re-evaluations.
    #[clap(long, default_value = "30")]
    discovery_refresh: u64,

    /// Read/write timeout in seconds for HTTP requests.
    #[clap(long, default_value = "30")]
    http_timeout: u64,

    /// Seconds granted to in-flight work after a shutdown signal.
    #[clap(long, default_value = "30")]
    shutdown_grace: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!(
        description = crate_description!(),
        version = crate_version!(),
        git = built_info::GIT_VERSION.unwrap_or("unknown"),
        target = built_info::TARGET,
        built = built_info::BUILT_TIME_UTC,
        rustc = built_info::RUSTC_VERSION,
        "starting target-balancer"
    );

    let config = config::load(&args.config_path).context("loading configuration")?;
    tracing::info!(mode = %config.mode, path = %args.config_path.display(), "configuration loaded");

    let adapter = DiscoveryAdapter::from_config(&config).context("building discovery adapter")?;
    let adapter = adapter.spawn(Duration::from_secs(args.discovery_refresh));

    let (reload_rx, _watcher) =
        config::spawn_watcher(args.config_path.clone()).context("watching configuration file")?;

    let client = kube::Client::try_default()
        .await
        .context("building Kubernetes client")?;
    let membership = KubeMembership::new(client, &args.namespace, &config.label_selector);

    let cache = Arc::new(SnapshotCache::default());
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let reconciler = Reconciler::new(Engine::default(), cache.clone(), Box::new(membership));
    let settings = Settings {
        interval: Duration::from_secs(args.interval),
        refresh: Duration::from_secs(args.discovery_refresh),
        config_path: args.config_path.clone(),
    };
    let loop_fut = reconciler.run(adapter, settings, reload_rx, shutdown.clone());

    let bind = SocketAddr::new(args.bind_addr, args.port);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding HTTP listener on {bind}"))?;
    tracing::info!(%bind, "HTTP surface listening");
    let app = server::router(cache, Duration::from_secs(args.http_timeout));
    let http_shutdown = shutdown.clone();
    let server_fut = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(http_shutdown)
            .await
    };

    // Give in-flight requests and the loop a bounded window after the signal,
    // then leave regardless.
    let grace = Duration::from_secs(args.shutdown_grace);
    let deadline = async move {
        shutdown.await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = async { tokio::join!(loop_fut, server_fut).1 } => {
            result.context("serving HTTP")?;
            tracing::info!("shut down cleanly");
        }
        _ = deadline => {
            tracing::warn!("shutdown grace window expired");
        }
    }
    Ok(())
}
