use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use evalhub_api::{build_router, AppState};
use evalhub_domain::catalog::ProviderCatalog;
use evalhub_domain::coordinator::RunCoordinator;
use evalhub_domain::dispatcher::JobDispatcher;
use evalhub_domain::runs::RunTracker;
use evalhub_domain::sync::TrackingSync;
use evalhub_domain::tracking::TrackingClient;
use evalhub_shared::settings::Settings;
use integration_docker::DockerBackend;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let settings = Settings::load()?;

    let catalog = Arc::new(ProviderCatalog::load_dir(&settings.providers.config_dir)?);
    let tracker = Arc::new(RunTracker::new(catalog.clone()));
    let dispatcher = JobDispatcher::new(Arc::new(DockerBackend::new(settings.backend.clone())));

    let sync = if settings.tracking.enabled {
        let client = TrackingClient::new(
            &settings.tracking.base_url,
            Duration::from_secs(settings.tracking.request_timeout_secs),
        )?;
        tracing::info!(
            base_url = client.base_url(),
            experiment = %settings.tracking.experiment_name,
            "tracking enabled"
        );
        Some(Arc::new(TrackingSync::new(client, tracker.clone(), &settings.tracking)))
    } else {
        tracing::warn!("tracking disabled, runs will not be mirrored");
        None
    };

    let coordinator = Arc::new(RunCoordinator::new(catalog, tracker, dispatcher, sync));
    let app = build_router(AppState::new(coordinator));

    let listener = TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", settings.server.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
