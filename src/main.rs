use std::sync::Arc;

use clap::Parser;
use kube::config::KubeConfigOptions;
use kube::Client;
use kube::Config;
use kubermatic_sync::config::LogFormat;
use kubermatic_sync::config::Options;
use kubermatic_sync::controllers;
use kubermatic_sync::store::client::KubeStore;
use kubermatic_sync::target::TargetTable;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const MASTER: &str = "master";

async fn client_for(context: Option<&str>) -> anyhow::Result<Client> {
    let Some(context) = context else {
        return Ok(Client::try_default().await?);
    };

    let options = KubeConfigOptions {
        context: Some(context.to_owned()),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options).await?;
    Ok(Client::try_from(config)?)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing(options.log_format);

    let master = KubeStore::new(MASTER, client_for(options.master_context.as_deref()).await?);
    let mut targets = TargetTable::new(Arc::new(master));
    for seed in &options.seed_contexts {
        let client = client_for(Some(&seed.context)).await?;
        targets = targets.with_seed(Arc::new(KubeStore::new(seed.name.clone(), client)));
        tracing::info!(seed = %seed.name, context = %seed.context, "Registered seed");
    }

    let controller_options = options.controller_options();
    tracing::info!(
        worker_name = %controller_options.worker_name,
        namespace = %controller_options.namespace,
        seeds = options.seed_contexts.len(),
        "Starting kubermatic-sync"
    );

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    });

    controllers::run_all(Arc::new(targets), &controller_options, token).await?;
    tracing::info!("All controllers stopped");
    Ok(())
}
