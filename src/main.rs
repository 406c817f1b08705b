use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use owlpost::config::Config;
use owlpost::dispatch::Dispatcher;
use owlpost::http_client::ClientFactory;
use owlpost::metrics::Metrics;
use owlpost::registry::Registry;
use owlpost::server;

/// Environment variable naming the configuration file, kept for drop-in
/// compatibility with existing Matrix push gateway deployments.
const CONFIG_ENV: &str = "SYGNAL_CONF";

const DEFAULT_CONFIG_PATH: &str = "owlpost.yaml";

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned())
        .into()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        config = %path.display(),
        apps = config.apps.len(),
        "starting push gateway"
    );

    let metrics = Arc::new(Metrics::new().context("failed to set up metrics")?);
    let factory = ClientFactory::new(config.proxy.clone());
    let registry = Registry::from_config(&config, &factory, &metrics)
        .context("failed to build pushkins")?;
    let dispatcher = Arc::new(Dispatcher::new(registry, metrics.clone()));

    server::run(&config, dispatcher, metrics).await
}
