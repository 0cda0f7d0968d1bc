use identity_service::{
    build_router,
    config::IdentityConfig,
    db::{self, PgConnectionManager},
    services::{
        EventSink, RbacPropagator, RedisEventSink, RedisService, RedisTaskQueue, TaskQueue,
        TenantResolver,
    },
    store::{postgres::PgWorkspaceDirectory, StoreProvider, WorkspaceDirectory},
    workers::WorkerPool,
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity provider"
    );

    let main_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&main_pool)
        .await
        .map_err(|e| AppError::InternalError(e.into()))?;

    let directory = Arc::new(PgWorkspaceDirectory::new(main_pool.clone()));
    let manager = Arc::new(PgConnectionManager::new(
        config.database.url.clone(),
        config.workspaces.clone(),
    ));

    // A workspace that fails to migrate stays unavailable; the rest still serve.
    let workspaces = directory
        .list()
        .await
        .map_err(|e| AppError::InternalError(e.into()))?;
    for workspace in &workspaces {
        if let Err(e) = manager.provision(workspace).await {
            tracing::error!(
                workspace_id = %workspace.workspace_id,
                error = %e,
                "Failed to provision workspace schema"
            );
        }
    }
    tracing::info!(workspaces = workspaces.len(), "Database initialized successfully");

    let redis = RedisService::new(&config.redis)
        .await
        .map_err(AppError::InternalError)?;
    let queue: Arc<dyn TaskQueue> = Arc::new(
        RedisTaskQueue::new(redis.clone())
            .await
            .map_err(AppError::InternalError)?,
    );
    let events: Arc<dyn EventSink> = Arc::new(RedisEventSink::new(redis));
    tracing::info!("Redis task queue initialized");

    let provider: Arc<dyn StoreProvider> = manager.clone();
    let resolver = TenantResolver::new(
        directory,
        provider.clone(),
        config.oidc.public_scheme.clone(),
    );

    let workers = WorkerPool::new(
        &config.worker,
        queue.clone(),
        resolver.clone(),
        RbacPropagator::new(events.clone()),
    );
    let worker_handles = workers.start().await;

    let state = AppState::new(config.clone(), resolver, queue, events);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    workers.shutdown();
    let grace = std::time::Duration::from_secs(config.common.shutdown_grace_seconds);
    let drained = tokio::time::timeout(grace, futures::future::join_all(worker_handles)).await;
    match drained {
        Ok(results) => {
            for e in results.into_iter().filter_map(Result::err) {
                tracing::warn!(error = %e, "Worker task ended abnormally");
            }
        }
        Err(_) => tracing::warn!("Workers did not stop within the shutdown grace period"),
    }
    provider.close_all().await;
    main_pool.close().await;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
