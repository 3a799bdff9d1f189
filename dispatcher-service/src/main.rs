//! Runnable binary wiring `dispatcher-core`/`dispatcher-common` behind an
//! axum health/metrics server, the way `hook-worker` wires `hook-common`
//! behind its own binary.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use dispatcher_common::clock::SystemClock;
use dispatcher_common::config::Config;
use dispatcher_common::health::HealthRegistry;
use dispatcher_common::job_queue::LoggingJobQueue;
use dispatcher_common::kv::RedisKv;
use dispatcher_common::metrics::{serve, setup_metrics_router};
use dispatcher_core::Dispatcher;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration");
    config.validate().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");
    let dispatcher_health = liveness
        .register("dispatcher".to_string(), time::Duration::seconds(30))
        .await;

    let kv = Arc::new(RedisKv::new(&config.redis_url)?);
    let job_queue = Arc::new(LoggingJobQueue::new());
    let process_id = uuid::Uuid::now_v7().to_string();

    let dispatcher = Arc::new(Dispatcher::new(config.clone(), kv, job_queue, Arc::new(SystemClock), process_id));
    dispatcher.start().await?;

    let health_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        loop {
            if health_dispatcher.state() == dispatcher_core::State::Stopped {
                dispatcher_health.report_status(dispatcher_common::health::ComponentStatus::Unhealthy).await;
            } else {
                dispatcher_health.report_healthy().await;
            }
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        }
    });

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());

    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            tracing::error!("metrics/health server exited: {e}");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight requests");
    dispatcher.stop(config.shutdown_timeout.get()).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn index() -> &'static str {
    "async-http dispatcher"
}
