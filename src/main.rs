use std::path::Path;
use std::sync::Arc;

use fast_talk::config::Config;
use fast_talk::delivery::BroadcastDelivery;
use fast_talk::fast::FastResponder;
use fast_talk::jobs::{
    BatchOptions, BatchProcessor, DeepProcessingHandler, HandlerRegistry, spawn_maintenance_task,
};
use fast_talk::llm::{LlmConfig, create_provider};
use fast_talk::routing::Router;
use fast_talk::server::{AppState, routes};
use fast_talk::store::{Database, LibSqlBackend};
use tokio::sync::broadcast;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    let llm_config = LlmConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: FAST_TALK_API_KEY (or ANTHROPIC_API_KEY) not set");
        eprintln!("  export FAST_TALK_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let port = config.server.port;
    eprintln!("⚡ Fast Talk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Chat API: http://0.0.0.0:{}/api/chat", port);
    eprintln!("   Worker API: http://0.0.0.0:{}/api/worker/run", port);

    let llm = create_provider(&llm_config)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Job handlers ─────────────────────────────────────────────────────
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register(Arc::new(DeepProcessingHandler::new(llm.clone())))
        .await;

    // ── Dual-path core ───────────────────────────────────────────────────
    let router = Arc::new(Router::new(config.router.clone(), Some(llm.clone())));
    let responder = Arc::new(FastResponder::new(
        Arc::clone(&db),
        router,
        Arc::clone(&registry),
        Some(llm.clone()),
    ));

    let delivery = Arc::new(BroadcastDelivery::new());

    // Log follow-ups as they land; real consumers subscribe the same way.
    let mut follow_ups = delivery.subscribe();
    tokio::spawn(async move {
        loop {
            match follow_ups.recv().await {
                Ok(event) => {
                    tracing::info!(
                        job_id = %event.job_id,
                        job_type = %event.job_type,
                        status = %event.status,
                        "Follow-up ready"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Follow-up consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let processor = Arc::new(BatchProcessor::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        delivery,
    ));

    // ── Background tasks ─────────────────────────────────────────────────
    let _maintenance = spawn_maintenance_task(
        Arc::clone(&db),
        config.queue.maintenance_interval,
        config.queue.stale_threshold,
        config.queue.max_attempts,
    );

    if let Some(interval) = config.queue.worker_interval {
        let options = BatchOptions::for_worker(format!("local-{}", Uuid::new_v4()), &config.queue);
        let loop_processor = Arc::clone(&processor);
        tokio::spawn(async move {
            loop_processor.run_loop(options, interval).await;
        });
        eprintln!("   Worker loop: every {}s", interval.as_secs());
    } else {
        eprintln!("   Worker loop: disabled (trigger via POST /api/worker/run)");
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let state = AppState {
        responder,
        processor,
        db,
        server: config.server.clone(),
        queue: config.queue.clone(),
    };
    let app = routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!(port, "Fast Talk server started");
    axum::serve(listener, app).await?;

    Ok(())
}
