//! Axum JSON API for RFF: the listing read surface plus sync admin
//! endpoints (progress polling, stats, logs, on-demand trigger).

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use rff_core::{GalleryImage, Listing};
use rff_sync::{trigger_detached, Reconciler, SyncConfig};

pub const CRATE_NAME: &str = "rff-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

/// Listing row shaped for the public front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebListing {
    pub source_id: String,
    pub title: Option<String>,
    pub price: Option<i64>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<f64>,
    pub address: Option<String>,
    pub availability_text: Option<String>,
    pub available_now: bool,
    pub detail_url: Option<String>,
    pub primary_image: Option<String>,
    pub gallery: Vec<WebGalleryImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebGalleryImage {
    pub source_url: String,
    pub blob_handle: String,
    pub is_primary: bool,
}

/// The source free-text marks immediate availability a few different
/// ways; recognize the common ones case-insensitively.
pub fn availability_is_now(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    normalized == "now" || normalized.contains("available now")
}

fn web_listing(listing: Listing, gallery: Vec<GalleryImage>) -> WebListing {
    let primary_image = gallery
        .iter()
        .find(|img| img.is_primary)
        .map(|img| img.blob_handle.clone());
    WebListing {
        source_id: listing.source_id,
        title: listing.title,
        price: listing.price,
        bedrooms: listing.bedrooms,
        bathrooms: listing.bathrooms,
        sqft: listing.sqft,
        address: listing.address,
        available_now: listing
            .availability_text
            .as_deref()
            .map(availability_is_now)
            .unwrap_or(false),
        availability_text: listing.availability_text,
        detail_url: listing.detail_url,
        primary_image,
        gallery: gallery
            .into_iter()
            .map(|img| WebGalleryImage {
                source_url: img.source_url,
                blob_handle: img.blob_handle,
                is_primary: img.is_primary,
            })
            .collect(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    n: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/listings", get(listings_handler))
        .route("/api/listings/{source_id}", get(listing_detail_handler))
        .route("/api/progress", get(progress_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/runs", get(runs_handler))
        .route("/api/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(reconciler: Arc<Reconciler>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving listing API");
    axum::serve(listener, app(AppState::new(reconciler))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RFF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env().with_settings_file("settings.yaml")?;
    let reconciler = Arc::new(Reconciler::from_config(config).await?);
    serve(reconciler, port).await
}

async fn listings_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.reconciler.store();
    let listings = match store.active_listings().await {
        Ok(listings) => listings,
        Err(err) => return server_error(err.into()),
    };
    let mut rows = Vec::with_capacity(listings.len());
    for listing in listings {
        let gallery = store.gallery(listing.local_id).await.unwrap_or_default();
        rows.push(web_listing(listing, gallery));
    }
    Json(rows).into_response()
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(source_id): AxumPath<String>,
) -> Response {
    let store = state.reconciler.store();
    match store.get_by_key(&source_id).await {
        Ok(Some(listing)) => {
            let gallery = store.gallery(listing.local_id).await.unwrap_or_default();
            Json(web_listing(listing, gallery)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "listing not found" })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn progress_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.reconciler.progress_channel().read()).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.reconciler.progress_channel().read_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let entries = state
        .reconciler
        .sync_log()
        .read_recent(query.n.unwrap_or(20))
        .await;
    Json(entries).into_response()
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let runs = state.reconciler.run_log().recent(query.n.unwrap_or(20)).await;
    Json(runs).into_response()
}

/// Start a sync and respond immediately; the run continues detached from
/// this request's lifecycle so proxy timeouts cannot interrupt it.
async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    state.reconciler.progress_channel().begin_run("Initializing...");
    trigger_detached(state.reconciler.clone());
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message": "Sync started" })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
