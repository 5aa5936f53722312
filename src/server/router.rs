use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{AppState, SharedState, api_router};
use crate::auth::{
    CredentialProvider, GitHubAppCredentials, InstallationTokenCache, NoCredentials,
    StaticCredentials,
};
use crate::config::Config;
use crate::delivery::github::GitHubConnector;
use crate::delivery::{DeliveryEngine, EntryGate};
use crate::sandbox::{JobQueue, SandboxExecutor, SandboxWorker};
use crate::token::TokenService;

/// Build the complete router: API routes plus request tracing and CORS.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pick the write credential source from configuration.
///
/// A GitHub App (id + key) wins over a static token. With neither, apply
/// requests fail with `credential_error` but previews still work.
pub fn credentials_from_config(config: &Config) -> Result<Arc<dyn CredentialProvider>> {
    let github = &config.github;
    if let (Some(app_id), Some(key)) = (&github.app_id, github.private_key()?) {
        let cache = Arc::new(InstallationTokenCache::new(chrono::Duration::seconds(
            github.token_refresh_buffer_secs,
        )));
        let creds = GitHubAppCredentials::new(app_id, &key, &github.api_base, cache)
            .context("Failed to initialise GitHub App credentials")?;
        tracing::info!(app_id = %app_id, "using GitHub App installation credentials");
        return Ok(Arc::new(creds));
    }
    if let Some(token) = &github.token {
        tracing::info!("using static GitHub token");
        return Ok(Arc::new(StaticCredentials::new(token.clone())));
    }
    tracing::warn!("no GitHub credentials configured; apply requests will be refused");
    Ok(Arc::new(NoCredentials))
}

/// Wire the job queue, token service, sandbox worker, and delivery engine.
pub fn build_services(config: &Config) -> Result<(SharedState, SandboxWorker)> {
    let queue = Arc::new(JobQueue::new());
    let tokens = Arc::new(TokenService::new(
        &config.token.secret(),
        &config.token.issuer,
        chrono::Duration::seconds(config.token.ttl_secs),
    ));

    let executor = SandboxExecutor::new(
        config.sandbox.clone_base.clone(),
        config.sandbox.work_root(),
        config.sandbox.command_timeout(),
    );
    let worker = SandboxWorker::new(
        Arc::clone(&queue),
        Arc::new(executor),
        Arc::clone(&tokens),
        config.sandbox.poll_interval(),
    );

    let engine = DeliveryEngine::new(
        EntryGate::new(tokens, Arc::clone(&queue)),
        credentials_from_config(config)?,
        Arc::new(GitHubConnector::new(&config.github.api_base)),
        config.delivery.clone(),
    );

    let state = Arc::new(AppState {
        queue,
        engine: Arc::new(engine),
    });
    Ok((state, worker))
}

/// Start the HTTP server and the sandbox worker; run until ctrl-c.
pub async fn start_server(config: &Config) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let (state, worker) = build_services(config)?;
    let cancel = CancellationToken::new();
    let worker_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    };

    let app = build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(%addr, "patchgate listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    cancel.cancel();
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "sandbox worker task failed");
    }
    tracing::info!("patchgate stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
