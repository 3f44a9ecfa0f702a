//! HTTP server hosting the admission layer
//!
//! Every route except the exempt ones passes through the admission
//! middleware before reaching the downstream handler.

use axum::{
    extract::{Request, State},
    middleware,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{GuardConfig, PolicyConfig};
use crate::error::Result;
use crate::security::ddos::{
    admission_middleware, open_store, AdmissionGuard, RecordSink, VerdictExt,
};

/// Router with the admission middleware in front of the downstream handlers
pub fn router(guard: Arc<AdmissionGuard>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(downstream)
        .layer(middleware::from_fn_with_state(
            guard.clone(),
            admission_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(guard)
}

async fn health(State(guard): State<Arc<AdmissionGuard>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "tracked_sources": guard.tracker().tracked_sources(),
        "records": guard.sink().stats(),
    }))
}

/// Minimal protected application: echoes the verdict it was admitted with
async fn downstream(request: Request) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "path": request.uri().path(),
        "verdict": request.verdict(),
    }))
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    guard: Arc<AdmissionGuard>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "ddos-guard listening");

    axum::serve(
        listener,
        router(guard).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

/// Wire every component from configuration and run until `shutdown` fires
pub async fn run(config: GuardConfig, shutdown: CancellationToken) -> Result<()> {
    let policy = PolicyConfig::from_config(&config)?;
    info!(
        window_secs = policy.window.as_secs(),
        threshold = policy.confidence_threshold,
        fail_mode = ?policy.fail_mode,
        endpoint = %policy.classifier_endpoint,
        timeout_ms = policy.classifier_timeout.as_millis() as u64,
        "Admission policy loaded"
    );

    let store = open_store(&config.storage).await?;
    let sink = Arc::new(RecordSink::spawn(store, config.storage.queue_capacity));
    let guard = Arc::new(AdmissionGuard::with_http_classifier(policy, sink.clone())?);

    let sweeper_cancel = shutdown.child_token();
    let sweeper = guard.spawn_sweeper(sweeper_cancel.clone());

    let listener = TcpListener::bind(config.server.bind_addr.as_str()).await?;
    let served = serve(listener, guard, shutdown).await;

    sweeper_cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task terminated abnormally");
    }
    sink.shutdown().await;

    served
}

/// Cancel `token` on Ctrl+C or SIGTERM
pub async fn shutdown_signal(token: CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }

    info!("Shutdown signal received, starting graceful shutdown");
    token.cancel();
}
