mod api;
mod auth;
mod config;
mod fanout;
mod geometry;
mod ingest;
mod models;
mod providers;
mod services;
mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::JwtVerifier;
use config::Config;
use fanout::{ConnectionRegistry, FanoutWorker, UpdateEnricher};
use ingest::{IngestionPipeline, MqttIngestor};
use providers::SqliteRouteSource;
use services::engine::VehicleStateEngine;
use services::projection::RouteProjectionService;
use services::sweeper::StaleEntryReclaimer;
use store::MemoryStore;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn,rumqttc=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(bind_addr = %config.bind_addr, mqtt_host = %config.mqtt.host, "Loaded configuration");

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
            ])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Route geometry database
    let pool = SqlitePool::connect(&config.routes.db_url)
        .await
        .expect("Failed to connect to route database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!(db_url = %config.routes.db_url, "Route database ready");

    // Core components
    let store = Arc::new(MemoryStore::new());
    let projection = Arc::new(RouteProjectionService::new(
        SqliteRouteSource::new(pool),
        Duration::from_secs(config.routes.cache_ttl_secs),
    ));
    let engine = Arc::new(VehicleStateEngine::new(
        store.clone(),
        config.tracking.clone(),
    ));
    let enricher = Arc::new(UpdateEnricher::new(
        store.clone(),
        projection.clone(),
        config.fanout.neighbor_count,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let verifier = Arc::new(JwtVerifier::new(&config.auth.secret));

    // Background tasks: reclaimer, fan-out, ingestion
    let reclaimer = StaleEntryReclaimer::new(
        store.clone(),
        config.sweep_interval(),
        config.sweep.page_size,
    );
    let sweep_stats = reclaimer.stats_handle();
    tokio::spawn(reclaimer.run());

    let worker = FanoutWorker::new(store.clone(), enricher.clone(), registry.clone());
    tokio::spawn(worker.run());

    let pipeline = IngestionPipeline::new(
        engine.clone(),
        projection.clone(),
        &config.mqtt.topic_prefix,
        &config.tracking,
    );
    let ingestor = MqttIngestor::new(pipeline, config.mqtt.clone());
    let transport = ingestor.health_handle();
    tokio::spawn(ingestor.run());

    // Build the app
    let state = api::AppState {
        store,
        engine,
        enricher,
        registry,
        verifier,
        transport,
        sweep_stats,
        ws: config.ws.clone(),
        started_at: Instant::now(),
    };
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind server address");
    tracing::info!(addr = %config.bind_addr, "Server running");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
