// Inspector Server
// Exposes stored blocks, Prometheus metrics and health checks
// Run with: cargo run --bin inspector

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chatlog_capture::{
    config::Config,
    health::HealthChecker,
    inspector::Inspector,
    metrics::MetricsRegistry,
    storage::BlockStorage,
};
use dotenv::dotenv;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::http::StatusCode;
use warp::Filter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env()?;
    let storage = BlockStorage::open(&cfg.storage());
    let inspector = Arc::new(Inspector::new(storage.clone()));
    let metrics_registry = Arc::new(MetricsRegistry::new());
    let health_checker = Arc::new(HealthChecker::new(storage));

    info!("Starting Inspector Server on port {}...", cfg.port);

    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(with_shared(metrics_registry))
        .and_then(handle_metrics);

    let health_route = warp::path("health")
        .and(warp::get())
        .and(with_shared(health_checker))
        .and_then(handle_health);

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_shared(inspector.clone()))
        .and_then(handle_stats);

    let blocks_route = warp::path("blocks")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_shared(inspector.clone()))
        .and_then(handle_list_blocks);

    let block_route = warp::path!("blocks" / String)
        .and(warp::get())
        .and(with_shared(inspector.clone()))
        .and_then(handle_block);

    let sessions_route = warp::path("sessions")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_shared(inspector))
        .and_then(handle_session);

    let root_route = warp::path::end()
        .and(warp::get())
        .map(|| "Chatlog Inspector - /metrics, /health, /stats, /blocks, /blocks/{id}, /sessions?url=");

    let routes = metrics_route
        .or(health_route)
        .or(stats_route)
        .or(blocks_route)
        .or(block_route)
        .or(sessions_route)
        .or(root_route);

    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(([0, 0, 0, 0], cfg.port), async {
        let _ = tokio::signal::ctrl_c().await;
    });
    info!(%addr, "Inspector listening");
    server.await;
    info!("Inspector stopped");

    Ok(())
}

fn with_shared<T: Send + Sync + 'static>(
    value: Arc<T>,
) -> impl Filter<Extract = (Arc<T>,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(value), status)
}

fn storage_failure(e: impl std::fmt::Display) -> warp::reply::WithStatus<warp::reply::Json> {
    error!("Inspector storage query failed: {}", e);
    json_reply(
        &serde_json::json!({ "error": e.to_string() }),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

async fn handle_metrics(metrics: Arc<MetricsRegistry>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(warp::reply::with_header(
        metrics.gather_metrics(),
        "Content-Type",
        "text/plain; version=0.0.4; charset=utf-8",
    ))
}

async fn handle_health(health_checker: Arc<HealthChecker>) -> Result<impl warp::Reply, warp::Rejection> {
    let health_status = health_checker.get_overall_health().await;
    Ok(json_reply(&health_status, StatusCode::OK))
}

async fn handle_stats(inspector: Arc<Inspector>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match inspector.stats().await {
        Ok(stats) => json_reply(&stats, StatusCode::OK),
        Err(e) => storage_failure(e),
    })
}

async fn handle_list_blocks(inspector: Arc<Inspector>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match inspector.list_blocks().await {
        Ok(blocks) => json_reply(&blocks, StatusCode::OK),
        Err(e) => storage_failure(e),
    })
}

async fn handle_block(id: String, inspector: Arc<Inspector>) -> Result<impl warp::Reply, warp::Rejection> {
    Ok(match inspector.get_block_details(&id).await {
        Ok(Some(details)) => json_reply(&details, StatusCode::OK),
        Ok(None) => json_reply(
            &serde_json::json!({ "error": format!("block {} not found", id) }),
            StatusCode::NOT_FOUND,
        ),
        Err(e) => storage_failure(e),
    })
}

async fn handle_session(
    query: HashMap<String, String>,
    inspector: Arc<Inspector>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let Some(url) = query.get("url").filter(|url| !url.trim().is_empty()) else {
        return Ok(json_reply(
            &serde_json::json!({ "error": "missing url query parameter" }),
            StatusCode::BAD_REQUEST,
        ));
    };
    Ok(match inspector.get_session_blocks(url).await {
        Ok(blocks) => json_reply(&blocks, StatusCode::OK),
        Err(e) => storage_failure(e),
    })
}
