use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use async_trait::async_trait;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::rpc::DependencyHealth;
use crate::utils::CircuitState;

/// Anything that can report per-dependency health for `/health`
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn dependencies(&self) -> Vec<DependencyHealth>;
}

struct ServerState {
    registry: Arc<Registry>,
    health: Arc<dyn HealthSource>,
}

/// Start the metrics HTTP server.
/// Must run inside an actix system, see `main`.
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    health: Arc<dyn HealthSource>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    let state = web::Data::new(ServerState { registry, health });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(state: web::Data<ServerState>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(state: web::Data<ServerState>) -> impl Responder {
    let dependencies = state.health.dependencies().await;

    let starting = dependencies.iter().any(|d| !d.ready);
    let degraded = dependencies
        .iter()
        .any(|d| d.circuit_state != CircuitState::Closed);

    let status = if starting {
        "starting"
    } else if degraded {
        "degraded"
    } else {
        "healthy"
    };

    let body = serde_json::json!({
        "status": status,
        "dependencies": dependencies,
    });

    if starting {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}
