// Decider service main entry point.
//
// Startup order matters: the JWKS keystore and the ServiceAccount index must
// both be ready before the callout endpoint subscribes, so no connection
// attempt is refused just because a cache was still warming up.
use anyhow::{Context, Result};
use decider::authorize::Authorizer;
use decider::callout::CalloutService;
use decider::config::DeciderConfig;
use decider::index::ServiceAccountIndex;
use decider::observability;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use warden_authn::{JwksKeystore, TokenValidator};
use warden_nats_jwt::KeyPair;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();
    let config = DeciderConfig::from_env().context("load configuration")?;
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let keystore = Arc::new(
        JwksKeystore::bootstrap(&config.jwks_url)
            .await
            .context("initial jwks load")?,
    );
    let refresh_task = Arc::clone(&keystore)
        .run_refresh_loop(config.jwks_refresh_interval, shutdown_tx.subscribe());

    let kube_config = if config.in_cluster {
        kube::Config::incluster().context("in-cluster kubernetes configuration")?
    } else {
        kube::Config::infer()
            .await
            .context("infer kubernetes configuration")?
    };
    let kube_client = kube::Client::try_from(kube_config).context("build kubernetes client")?;
    let version = kube_client
        .apiserver_version()
        .await
        .context("reach kubernetes api server")?;
    tracing::info!(version = %version.git_version, "kubernetes api reachable");

    let index = ServiceAccountIndex::new();
    let index_task = Arc::clone(&index).run(kube_client, shutdown_tx.subscribe());

    // No request is admitted before the initial list lands.
    let mut ready_shutdown = shutdown_rx.clone();
    if !index.await_ready(&mut ready_shutdown).await {
        tracing::info!("shutdown before index sync, exiting");
        return Ok(());
    }

    let signing_key = load_signing_key(&config)?;
    let validator = Arc::new(TokenValidator::new(
        Arc::clone(&keystore),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
    ));
    let authorizer = Arc::new(Authorizer::new(validator, index));

    let mut callout = CalloutService::new(
        authorizer,
        signing_key,
        config.nats_account.clone(),
        config.nats_callout_issuers.clone(),
    );
    if let Some(max_inflight) = config.max_inflight {
        callout = callout.with_max_inflight(max_inflight);
    }

    let mut options = async_nats::ConnectOptions::new()
        .name("warden-decider")
        .connection_timeout(Duration::from_secs(5));
    if let Some(path) = &config.nats_creds_file {
        options = options
            .credentials_file(path)
            .await
            .context("load nats credentials")?;
    }
    let nats_client = options
        .connect(&config.nats_url)
        .await
        .context("connect to nats")?;
    tracing::info!(url = %config.nats_url, "connected to nats");

    Arc::new(callout)
        .serve(nats_client, shutdown_rx, config.drain_timeout)
        .await?;

    refresh_task.abort();
    index_task.abort();
    tracing::info!("decider stopped");
    Ok(())
}

fn load_signing_key(config: &DeciderConfig) -> Result<KeyPair> {
    match &config.nats_signing_key_file {
        Some(path) => {
            let seed = std::fs::read_to_string(path)
                .with_context(|| format!("read signing key seed: {}", path.display()))?;
            let key = KeyPair::from_seed(seed.trim())
                .map_err(|err| anyhow::anyhow!("parse signing key seed: {err}"))?;
            tracing::info!(public_key = %key.public_key(), "loaded account signing key");
            Ok(key)
        }
        None => {
            // Only viable when the server's issuer is configured against this
            // ephemeral key, i.e. for tests.
            let key = KeyPair::new_account();
            tracing::warn!(
                public_key = %key.public_key(),
                "no signing key configured, generated an ephemeral account key"
            );
            Ok(key)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
