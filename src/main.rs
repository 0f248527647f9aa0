use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use neptune_proxy::config::{Config, ENV_DEFAULTS_FILE, ENV_OVERRIDES_FILE, load_env_files};
use neptune_proxy::credentials::{CredentialContext, process_env};
use neptune_proxy::observe::TracingSink;
use neptune_proxy::proxy::TlsConnector;
use neptune_proxy::server::ServerGroup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    load_env_files(ENV_DEFAULTS_FILE, ENV_OVERRIDES_FILE)
        .context("failed to load environment defaults")?;
    let cfg = Config::load().context("invalid proxy configuration")?;

    let context = CredentialContext::resolve(&cfg.service, cfg.region.clone(), &process_env())
        .await
        .context("failed to load AWS configuration")?;
    tracing::info!(
        region = context.region(),
        service = context.service(),
        "Loaded AWS configuration"
    );
    if let Err(e) = context.credentials().await {
        // Credentials are looked up again for every request.
        tracing::warn!("No AWS credentials available yet: {}", e);
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;
    let connector = Arc::new(TlsConnector::with_native_roots()?);
    let group = ServerGroup::bind(&cfg, Arc::new(context), connector, Arc::new(TracingSink)).await?;

    tokio::select! {
        _ = group.run() => {}

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
