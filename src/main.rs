mod admission;
mod db;
mod detection;
mod executor;
mod handlers;
mod models;
mod probes;
mod progress;
mod queue;
mod scheduler;
mod sync;
mod worker;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use detection::DetectionService;
use executor::ProbeExecutor;
use progress::ProgressBus;
use queue::JobQueue;
use scheduler::CronScheduler;
use worker::{ConfigCache, WorkerPool};

/// Global application state
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub detection: Arc<DetectionService>,
    pub scheduler: Arc<CronScheduler>,
    pub progress: Arc<ProgressBus>,
    pub worker_config: Arc<ConfigCache>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt::init();

    // ============================================================
    // Initialize Services
    // ============================================================

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost:5432/modelwatch".to_string());
    let broker_url = std::env::var("BROKER_URL").ok();
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    tracing::info!("Connecting to Postgres...");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    db::init_schema(&db_pool)
        .await
        .expect("Failed to initialize database schema");

    tracing::info!("Connected to Postgres");

    // Broker is optional: without BROKER_URL everything runs in-process
    let broker = match &broker_url {
        Some(url) => {
            tracing::info!("Connecting to broker...");
            let client = redis::Client::open(url.clone()).expect("Failed to create broker client");
            let manager = client
                .get_connection_manager()
                .await
                .expect("Failed to connect to broker");
            tracing::info!("Connected to broker");
            Some((client, manager))
        }
        None => {
            tracing::info!("No BROKER_URL set; using in-process queue and bus");
            None
        }
    };

    // ============================================================
    // Startup configuration (env wins once, at boot)
    // ============================================================

    let env = worker::WorkerEnv::from_env();
    let stored = db::load_scheduler_config(&db_pool)
        .await
        .unwrap_or_default();
    let boot_config = env.apply_to(stored);
    if let Err(e) = db::upsert_scheduler_config(&db_pool, &boot_config).await {
        tracing::warn!("Could not persist startup scheduler config: {}", e);
    }

    // ============================================================
    // Core components
    // ============================================================

    let queue = Arc::new(match &broker {
        Some((_, manager)) => JobQueue::broker(manager.clone()),
        None => JobQueue::in_memory(),
    });

    let admission = Arc::new(match &broker {
        Some((_, manager)) => admission::AdmissionController::broker(
            manager.clone(),
            boot_config.max_global_concurrency,
            boot_config.channel_concurrency,
        ),
        None => admission::AdmissionController::in_memory(
            boot_config.max_global_concurrency,
            boot_config.channel_concurrency,
        ),
    });

    let progress_bus = Arc::new(ProgressBus::new(broker.as_ref().map(|(_, m)| m.clone())));
    if let Some((client, _)) = &broker {
        let bus = progress_bus.clone();
        let client = client.clone();
        tokio::spawn(async move {
            progress::run_mirror(bus, client).await;
        });
    }

    let worker_config = Arc::new(ConfigCache::new(db_pool.clone()));
    let executor = Arc::new(ProbeExecutor::new());

    let detection_service = Arc::new(DetectionService::new(
        db_pool.clone(),
        queue.clone(),
        progress_bus.clone(),
        worker_config.clone(),
    ));

    let cron_scheduler = Arc::new(CronScheduler::new(
        db_pool.clone(),
        detection_service.clone(),
        worker_config.clone(),
    ));

    // ============================================================
    // Start Workers and Cron (Background)
    // ============================================================

    let worker_pool = WorkerPool {
        db: db_pool.clone(),
        queue: queue.clone(),
        admission: admission.clone(),
        progress: progress_bus.clone(),
        executor: executor.clone(),
        config: worker_config.clone(),
    };
    let fanout = if queue.is_broker() {
        worker::BROKER_WORKER_FANOUT
    } else {
        boot_config.max_global_concurrency as usize
    };
    worker_pool.spawn(fanout, CancellationToken::new());

    if let Err(e) = cron_scheduler.start_all().await {
        tracing::error!("Cron startup failed: {}", e);
    }

    let app_state = AppState {
        db: db_pool,
        detection: detection_service,
        scheduler: cron_scheduler,
        progress: progress_bus,
        worker_config,
    };

    // ============================================================
    // Build Axum Router
    // ============================================================

    let app = Router::new()
        // Detection control
        .route("/api/detection/trigger", post(handlers::trigger_full_detection))
        .route("/api/detection/channels/:id", post(handlers::trigger_channel_detection))
        .route("/api/detection/models/:id", post(handlers::trigger_model_detection))
        .route("/api/detection/selective", post(handlers::trigger_selective_detection))
        .route("/api/detection/stop", post(handlers::stop_detection))
        .route("/api/detection/progress", get(handlers::get_detection_progress))
        .route("/api/detection/stream", get(handlers::detection_stream))

        // Scheduler
        .route("/api/scheduler/status", get(handlers::scheduler_status))
        .route("/api/scheduler/start", post(handlers::scheduler_start))
        .route("/api/scheduler/stop", post(handlers::scheduler_stop))
        .route("/api/scheduler/cleanup", post(handlers::scheduler_cleanup_now))
        .route("/api/scheduler/config", get(handlers::get_scheduler_config))
        .route("/api/scheduler/config", put(handlers::update_scheduler_config))

        // Dashboard data
        .route("/api/channels", get(handlers::list_channels))
        .route("/api/models/:id/logs", get(handlers::get_model_logs))

        // Channel management
        .route("/api/channels", post(handlers::create_channel))
        .route("/api/channels/:id", put(handlers::update_channel))
        .route("/api/channels/:id", delete(handlers::delete_channel))
        .route("/api/channels/:id/keys/:key_id", delete(handlers::delete_channel_key))
        .route("/api/channels/:id/sync", post(handlers::sync_channel))

        // Health check
        .route("/health", get(handlers::health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state);

    tracing::info!("Listening on 0.0.0.0:{}", port);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("Failed to bind listener");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
