//! Health HTTP endpoint.
//!
//! Loopback-only axum server. `GET /health` is the cheap liveness probe;
//! `GET /status` is the full report the visualizer and operators poll.
//! Read-only, CORS-open for local tooling.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::scheduler::SchedulerStatus;

#[derive(Clone)]
struct HealthState {
    ctx: Arc<AppContext>,
    scheduler: SchedulerStatus,
}

/// Build the health router.
pub fn build_router(ctx: Arc<AppContext>, scheduler: SchedulerStatus) -> Router {
    let state = HealthState { ctx, scheduler };
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(
            ServiceBuilder::new()
                .concurrency_limit(16)
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve until the shutdown signal flips. A port already in use is logged
/// and tolerated: the daemon keeps running without its health endpoint.
pub async fn serve(
    ctx: Arc<AppContext>,
    scheduler: SchedulerStatus,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = build_router(ctx, scheduler);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("health endpoint could not bind port {}: {}", port, e);
            return;
        }
    };
    info!("health endpoint at http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    if let Err(e) = server.await {
        warn!("health endpoint error: {}", e);
    }
}

/// `GET /health`: minimal liveness summary.
async fn health(State(state): State<HealthState>) -> Json<Value> {
    let (status, entities) = match state.ctx.store.counts() {
        Ok(counts) => ("ok", counts.entities),
        Err(_) => ("degraded", 0),
    };
    Json(json!({ "status": status, "entities": entities }))
}

/// `GET /status`: comprehensive report.
async fn status(State(state): State<HealthState>) -> Json<Value> {
    Json(status_report(&state.ctx, &state.scheduler).await)
}

/// Full status document, shared with the `system_health` tool. Every
/// component check is independent; any failure downgrades the overall
/// status to "degraded".
pub async fn status_report(ctx: &AppContext, scheduler: &SchedulerStatus) -> Value {
    let mut degraded = false;

    let database = match ctx.store.ping() {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            degraded = true;
            format!("error: {}", e)
        }
    };

    let schema_version = match ctx.store.schema_version() {
        Ok(version) => Value::from(version),
        Err(e) => {
            degraded = true;
            Value::from(format!("error: {}", e))
        }
    };

    let embeddings = if ctx.embedder.is_available().await {
        "ok".to_string()
    } else {
        degraded = true;
        "unavailable".to_string()
    };

    let counts = match ctx.store.counts() {
        Ok(counts) => serde_json::to_value(counts).unwrap_or_else(|_| json!({})),
        Err(e) => {
            degraded = true;
            json!({ "error": e.to_string() })
        }
    };

    let jobs = scheduler.read().await;
    let scheduler_component = if jobs.is_empty() {
        "stopped"
    } else {
        "running"
    };
    let scheduled_jobs: Vec<Value> = jobs
        .iter()
        .map(|job| {
            json!({
                "id": job.id,
                "name": job.name,
                "nextRun": job.next_run,
                "lastRun": job.last_run,
                "running": job.running,
            })
        })
        .collect();
    drop(jobs);

    json!({
        "timestamp": Utc::now(),
        "status": if degraded { "degraded" } else { "ok" },
        "schemaVersion": schema_version,
        "components": {
            "database": database,
            "embeddings": embeddings,
            "embeddingModel": ctx.embedder.model(),
            "languageModel": ctx.language_model.model(),
            "scheduler": scheduler_component,
        },
        "scheduledJobs": scheduled_jobs,
        "counts": counts,
        "workspace": ctx.config.workspace.display().to_string(),
        "demo": ctx.config.demo,
    })
}
