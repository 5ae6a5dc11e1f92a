// Import the things we need
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use moka::future::Cache;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use projection_engine::config::Config;
use projection_engine::{database, watcher};

// DRY helper types and functions
type ApiResult<T> = Result<Json<T>, (axum::http::StatusCode, Json<Value>)>;

// Common error response helper
fn internal_error(message: &str) -> (axum::http::StatusCode, Json<Value>) {
    eprintln!("{}", message);
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error"})),
    )
}

// Not found error
fn not_found_error(entity: &str) -> (axum::http::StatusCode, Json<Value>) {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{} not found", entity)})),
    )
}

// Cache helper with generic key and data
async fn get_or_cache<T, F, Fut>(
    cache: &Cache<String, String>,
    key: &str,
    fetch_fn: F,
) -> ApiResult<Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    T: serde::Serialize,
{
    // Check cache first
    if let Some(cached_result) = cache.get(key).await {
        if let Ok(cached_json) = serde_json::from_str::<Value>(&cached_result) {
            return Ok(Json(cached_json));
        }
    }

    // Fetch fresh data
    match fetch_fn().await {
        Ok(data) => {
            let result = json!(data);
            // Cache the result
            if let Ok(result_str) = serde_json::to_string(&result) {
                cache.insert(key.to_string(), result_str).await;
            }
            Ok(Json(result))
        }
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Global state shared by the read handlers
#[derive(Clone)]
struct AppState {
    db: SqlitePool,
    cache: Cache<String, String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("🦀 Starting Projection Engine...");

    let config = Config::from_env();
    println!(
        "🔌 Ledger database: {} | projection database: {}",
        config.storage.ledger_database, config.storage.api_database
    );

    // Bring the projection store up and start following the ledger
    let watcher_handle = watcher::start(&config).await?;

    // Separate read-only pool so API queries never contend with the watcher
    let reader = database::open_projection_reader(&config.storage.api_database_path()).await?;

    // Short-lived response cache
    let cache = Cache::builder()
        .max_capacity(1000)
        .time_to_live(Duration::from_secs(5))
        .build();

    let app_state = AppState { db: reader, cache };

    let app = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/blocks/last", get(last_block))
        .route("/events", get(recent_events))
        .route("/addresses/:address/balances", get(address_balances))
        .route("/addresses/:address/events", get(address_events))
        .route("/assets/:asset", get(asset_info))
        .route("/mempool", get(mempool_events))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    println!("🚀 Server running on http://{}", addr);
    println!("📊 Available endpoints:");
    println!("  GET /health - Health check");
    println!("  GET /blocks/last - Last block applied to the projection");
    println!("  GET /events?limit=N - Most recent ledger events");
    println!("  GET /addresses/:address/balances - Balances held by an address");
    println!("  GET /addresses/:address/events - Events touching an address");
    println!("  GET /assets/:asset - Asset info (name or longname)");
    println!("  GET /mempool?address=X - Unconfirmed events, optionally by address");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The server is down; wind the watcher down cleanly too.
    watcher_handle.stop().await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    println!("👋 Shutdown signal received");
}

// Service banner
async fn service_info() -> Json<Value> {
    Json(json!({
        "message": "Projection Engine 🦀",
        "status": "running"
    }))
}

// Health check endpoint
async fn health_check(State(app_state): State<AppState>) -> ApiResult<Value> {
    match database::get_last_parsed_message_index(&app_state.db).await {
        Ok(last_index) => Ok(Json(json!({
            "status": "healthy",
            "service": "projection-engine",
            "last_message_index": last_index
        }))),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Last block applied to the projection
async fn last_block(State(app_state): State<AppState>) -> ApiResult<Value> {
    match database::get_last_block(&app_state.db).await {
        Ok(Some(block)) => Ok(Json(block)),
        Ok(None) => Err(not_found_error("Block")),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Most recent events, newest first
async fn recent_events(
    State(app_state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100)
        .clamp(1, 1000);

    match database::get_recent_events(&app_state.db, limit).await {
        Ok(events) => Ok(Json(json!({ "events": events }))),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Balances held by an address
async fn address_balances(
    State(app_state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Value> {
    match database::get_address_balances(&app_state.db, &address).await {
        Ok(balances) => Ok(Json(json!({
            "address": address,
            "balances": balances
        }))),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Events touching an address, via the reverse index
async fn address_events(
    State(app_state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(100)
        .clamp(1, 1000);

    match database::get_address_events(&app_state.db, &address, limit).await {
        Ok(events) => Ok(Json(json!({
            "address": address,
            "events": events
        }))),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}

// Asset info by name or longname, cached briefly
async fn asset_info(
    State(app_state): State<AppState>,
    Path(asset): Path<String>,
) -> ApiResult<Value> {
    let cache_key = format!("asset_{}", asset);
    get_or_cache(&app_state.cache, &cache_key, || async {
        match database::get_asset_info(&app_state.db, &asset).await? {
            Some(info) => Ok(info),
            None => Ok(json!(null)),
        }
    })
    .await
}

// Unconfirmed events, optionally filtered by address
async fn mempool_events(
    State(app_state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let address = params.get("address").map(|s| s.as_str());
    match database::get_mempool_events(&app_state.db, address).await {
        Ok(events) => Ok(Json(json!({ "mempool": events }))),
        Err(e) => Err(internal_error(&format!("Database error: {}", e))),
    }
}
