use serde_json::{json, Value};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use service_reliability::config::Settings;
use service_reliability::messaging::{KafkaTransport, KafkaTransportConfig, Transport};
use service_reliability::metrics::{self, HealthSource, Metrics};
use service_reliability::outbox::{NewOutboxEvent, OutboxStore, TransactionalPublisher};
use service_reliability::persistence::{
    InMemoryStorage, OutboxRepository, PgStorage, TransactionRunner,
};
use service_reliability::rpc::{
    InvokeOptions, ProxyRegistry, ResilientServiceProxy, ServiceError,
};
use service_reliability::saga::SagaOrchestrator;

const CALLED_PATTERNS: [&str; 5] = [
    "users.get_user",
    "inventory.reserve",
    "inventory.release",
    "payments.charge",
    "payments.refund",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, override with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,service_reliability=debug")),
        )
        .init();

    tracing::info!("🚀 Starting service reliability demo");

    let settings = Settings::from_env()?;
    let resilience = settings.resilience();

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    // === 2. Broker transport and one proxy per dependency ===
    let transport: Arc<dyn Transport> = Arc::new(KafkaTransport::new(
        KafkaTransportConfig::new(&settings.broker_url, &settings.broker_client_id)
            .with_reply_patterns(CALLED_PATTERNS)
            .with_ready_grace(settings.broker_ready_grace()),
    )?);

    let mut registry = ProxyRegistry::new();
    for dependency in ["users", "inventory", "payments"] {
        registry.register(
            ResilientServiceProxy::new(dependency, transport.clone(), resilience.clone())
                .with_metrics(metrics.clone()),
        );
    }
    let registry = Arc::new(registry);

    // === 3. /metrics and /health on a dedicated actix system ===
    let metrics_registry = Arc::new(metrics.registry().clone());
    let health: Arc<dyn HealthSource> = registry.clone();
    let metrics_port = settings.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, health, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 4. Connect (sets each proxy ready) ===
    for (dependency, error) in registry.connect_all().await {
        tracing::warn!(dependency = %dependency, error = %error, "Dependency not ready, calls will fail fast");
    }

    // === 5. Storage ===
    match &settings.database_url {
        Some(url) => {
            let storage = PgStorage::connect(url).await?;
            storage.ensure_outbox_table().await?;
            run_demo(Arc::new(storage), &registry, transport.clone(), &settings, &metrics).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory storage");
            run_demo(Arc::new(InMemoryStorage::new()), &registry, transport.clone(), &settings, &metrics).await;
        }
    }

    tracing::info!("⏳ Serving /metrics and /health on port {}, Ctrl+C to stop", settings.metrics_port);
    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down");

    Ok(())
}

async fn run_demo<S: OutboxRepository>(
    storage: Arc<S>,
    registry: &ProxyRegistry,
    transport: Arc<dyn Transport>,
    settings: &Settings,
    metrics: &Arc<Metrics>,
) {
    let runner = TransactionRunner::new(storage.clone()).with_metrics(metrics.clone());
    let outbox = OutboxStore::new(storage).with_metrics(metrics.clone());

    // --- Resilient call ---
    if let Some(users) = registry.get("users") {
        match users
            .invoke::<_, Value>("users.get_user", &json!({"id": "u-1"}), InvokeOptions::default())
            .await
        {
            Ok(user) => tracing::info!(user = %user, "✅ Fetched user"),
            Err(e) => tracing::warn!(status = e.status_code(), error = %e, "User lookup failed"),
        }
    }

    // --- Outbox tier ---
    let order_id = uuid::Uuid::new_v4().to_string();
    let publisher = TransactionalPublisher::new(runner.clone(), outbox.clone(), transport);
    let new_order = order_id.clone();
    let placed = publisher
        .persist_with_outbox(
            move |_tx| Box::pin(async move { Ok(new_order) }),
            |order_id: &String| {
                vec![NewOutboxEvent::new(
                    "Order",
                    order_id.clone(),
                    "order.placed",
                    json!({"order_id": order_id}),
                )]
            },
        )
        .await;

    match placed {
        Ok(id) => tracing::info!(order_id = %id, "✅ Order placed with outbox event"),
        Err(e) => tracing::error!(error = %e, "Order placement failed"),
    }

    match outbox.get_pending_events(10).await {
        Ok(pending) => tracing::info!(count = pending.len(), "Outbox events awaiting dispatch"),
        Err(e) => tracing::warn!(error = %e, "Could not read outbox"),
    }

    // --- Retry variant ---
    let retried = runner
        .execute_with_retry(
            |_tx| Box::pin(async { Ok(()) }),
            settings.tx_retry_attempts,
            settings.tx_retry_base_delay(),
        )
        .await;
    if let Err(e) = retried {
        tracing::warn!(error = %e, "Transaction with retry failed");
    }

    // --- Saga across inventory and payments ---
    if let (Some(inventory), Some(payments)) = (registry.get("inventory"), registry.get("payments")) {
        let reserve_order = order_id.clone();
        let charge_order = order_id.clone();
        let release = inventory.clone();
        let refund = payments.clone();

        let saga = SagaOrchestrator::<Value, ServiceError>::new("checkout")
            .with_metrics(metrics.clone())
            .add_named_step(
                "reserve-inventory",
                move || async move {
                    inventory
                        .invoke_raw("inventory.reserve", json!({"order_id": reserve_order}), InvokeOptions::default())
                        .await
                },
                move |reservation| async move {
                    release
                        .invoke_raw("inventory.release", reservation, InvokeOptions::no_retry())
                        .await
                        .map(|_| ())
                },
            )
            .add_named_step(
                "charge-payment",
                move || async move {
                    payments
                        .invoke_raw("payments.charge", json!({"order_id": charge_order}), InvokeOptions::default())
                        .await
                },
                move |charge| async move {
                    refund
                        .invoke_raw("payments.refund", charge, InvokeOptions::no_retry())
                        .await
                        .map(|_| ())
                },
            );

        match saga.execute().await {
            Ok(results) => tracing::info!(steps = results.len(), "✅ Checkout saga completed"),
            Err(e) => tracing::warn!(status = e.status_code(), error = %e, "Checkout saga rolled back"),
        }
    }

    tracing::info!("🎉 Demo complete");
}
