use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use relayd::config::{Config, StoreBackend};
use relayd::engine::Engine;
use relayd::store::{make_pool, MemoryStore, PgStore, Store};
use relayd::{ingest, metrics, mqtt, rest, sweeper};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting relayd");
    info!("MQTT broker: {}:{} (prefix '{}')", config.mqtt_broker, config.mqtt_port, config.topic_prefix);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Sweeps: timers every {}ms, schedules every {}s at UTC{:+} min",
        config.timer_sweep_ms, config.schedule_sweep_secs, config.schedule_offset_minutes
    );

    if let Err(e) = metrics::init_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    match config.store_backend {
        StoreBackend::Postgres => {
            info!("Database: {}", config.database_host());
            let pool = match make_pool(&config.database_url).await {
                Ok(pool) => pool,
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };
            run(config, Arc::new(PgStore::new(pool))).await
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            run(config, Arc::new(MemoryStore::new())).await
        }
    }
}

async fn run<S: Store>(config: Config, store: Arc<S>) {
    let client_id = format!("relayd-{}", uuid::Uuid::new_v4());
    let (transport, session) = mqtt::connect(
        &config.mqtt_broker,
        config.mqtt_port,
        client_id,
        &config.topic_prefix,
        &config.default_device_id,
    );

    let engine = Arc::new(Engine::new(store, transport, config.schedule_offset()));

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = session.run(tx).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let ingest_handle = tokio::spawn(ingest::run_ingest(rx, engine.clone()));

    let timer_handle = tokio::spawn(sweeper::run_timer_sweep(
        engine.clone(),
        Duration::from_millis(config.timer_sweep_ms.max(1)),
    ));
    let schedule_handle = tokio::spawn(sweeper::run_schedule_sweep(
        engine.clone(),
        Duration::from_secs(config.schedule_sweep_secs.max(1)),
    ));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(engine, config.default_device_id.clone()));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = ingest_handle => {
            error!("Telemetry consumer terminated");
        }
        _ = timer_handle => {
            error!("Timer sweep terminated");
        }
        _ = schedule_handle => {
            error!("Schedule sweep terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
