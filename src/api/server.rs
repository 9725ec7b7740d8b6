use std::collections::BTreeSet;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::HttpConfig;
use crate::storage::{clock, coarsen, CellRect, MotionStore, QueryError};
use crate::supervisor::TerminationSignal;

#[derive(Clone)]
pub struct AppState {
    pub store: MotionStore,
}

impl AppState {
    pub fn new(store: MotionStore) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
struct DayQuery {
    day: Option<String>,
}

#[derive(Deserialize)]
struct CameraQuery {
    camera_id: String,
    day: Option<String>,
}

/// Selection in fractions of the frame.
#[derive(Deserialize)]
struct FractionQuery {
    camera_id: String,
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    span_size: Option<u32>,
    day: Option<String>,
}

fn default_frame_width() -> i64 {
    640
}

fn default_frame_height() -> i64 {
    360
}

/// Selection in pixels of a reference frame, 640x360 unless given.
#[derive(Deserialize)]
struct PixelQuery {
    camera_id: String,
    x_pixels: i64,
    y_pixels: i64,
    width_pixels: i64,
    height_pixels: i64,
    #[serde(default = "default_frame_width")]
    frame_width: i64,
    #[serde(default = "default_frame_height")]
    frame_height: i64,
    span_size: Option<u32>,
    day: Option<String>,
}

/// Selection in grid cells.
#[derive(Deserialize)]
struct CellQuery {
    camera_id: String,
    x: i64,
    y: i64,
    width: i64,
    height: i64,
    span_size: Option<u32>,
    day: Option<String>,
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/cameras", get(cameras_handler))
        .route("/heatmap", get(heatmap_handler))
        .route("/motion_data", get(motion_data_handler))
        .route("/motion_data/cells", get(motion_cells_handler))
        .route("/motion_data/pixels", get(motion_pixels_handler))
        .route("/motion_timestamps", get(motion_timestamps_handler))
        .with_state(state);

    match cors_layer(cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    if origins.iter().any(|origin| origin == "*") {
        return Some(layer.allow_origin(Any));
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(allowed)))
}

pub async fn start_server(
    state: AppState,
    http: &HttpConfig,
    terminating: TerminationSignal,
) -> Result<(), std::io::Error> {
    let app = router(state, &http.cors_origins);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], http.port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { terminating.wait().await })
        .await
}

fn query_error(e: QueryError) -> Response {
    let status = match e {
        QueryError::OutOfBounds { .. } | QueryError::InvalidSelection(_) | QueryError::InvalidSpan => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        QueryError::NoData { .. } => StatusCode::NOT_FOUND,
    };
    (status, e.to_string()).into_response()
}

/// Requested day as a store key; today when absent.
fn resolve_day(day: Option<&str>) -> Result<String, Response> {
    match day {
        None => Ok(clock::today()),
        Some(day) => NaiveDate::parse_from_str(day, "%Y-%m-%d")
            .map(clock::day_key)
            .map_err(|_| (StatusCode::BAD_REQUEST, "day must be YYYY-MM-DD").into_response()),
    }
}

fn area_response(
    store: &MotionStore,
    day: Option<&str>,
    camera_id: &str,
    rect: Result<CellRect, QueryError>,
    span_size: Option<u32>,
) -> Response {
    let day = match resolve_day(day) {
        Ok(day) => day,
        Err(response) => return response,
    };
    let slots = rect
        .and_then(|rect| store.motions_in_area(&day, camera_id, rect))
        .and_then(|slots| match span_size {
            Some(span) => coarsen(&slots, span),
            None => Ok(slots),
        });
    match slots {
        Ok(slots) => Json::<BTreeSet<u32>>(slots).into_response(),
        Err(e) => query_error(e),
    }
}

async fn cameras_handler(State(state): State<AppState>, Query(query): Query<DayQuery>) -> Response {
    match resolve_day(query.day.as_deref()) {
        Ok(day) => Json(state.store.sources(&day)).into_response(),
        Err(response) => response,
    }
}

async fn heatmap_handler(State(state): State<AppState>, Query(query): Query<CameraQuery>) -> Response {
    let day = match resolve_day(query.day.as_deref()) {
        Ok(day) => day,
        Err(response) => return response,
    };
    match state.store.heatmap(&day, &query.camera_id) {
        Ok(counts) => Json(counts).into_response(),
        Err(e) => query_error(e),
    }
}

async fn motion_data_handler(
    State(state): State<AppState>,
    Query(query): Query<FractionQuery>,
) -> Response {
    let rect = CellRect::from_fractions(query.left, query.top, query.width, query.height);
    area_response(
        &state.store,
        query.day.as_deref(),
        &query.camera_id,
        rect,
        query.span_size,
    )
}

async fn motion_cells_handler(State(state): State<AppState>, Query(query): Query<CellQuery>) -> Response {
    let rect = CellRect::new(query.x, query.y, query.width, query.height);
    area_response(
        &state.store,
        query.day.as_deref(),
        &query.camera_id,
        rect,
        query.span_size,
    )
}

async fn motion_pixels_handler(State(state): State<AppState>, Query(query): Query<PixelQuery>) -> Response {
    let rect = CellRect::from_pixels(
        query.x_pixels,
        query.y_pixels,
        query.width_pixels,
        query.height_pixels,
        query.frame_width,
        query.frame_height,
    );
    area_response(
        &state.store,
        query.day.as_deref(),
        &query.camera_id,
        rect,
        query.span_size,
    )
}

async fn motion_timestamps_handler(
    State(state): State<AppState>,
    Query(query): Query<CameraQuery>,
) -> Response {
    let day = match resolve_day(query.day.as_deref()) {
        Ok(day) => day,
        Err(response) => return response,
    };
    match state.store.motion_timestamps(&day, &query.camera_id) {
        Ok(times) => {
            let times: Vec<String> = times
                .into_iter()
                .map(|t| t.format("%H:%M:%S").to_string())
                .collect();
            Json(times).into_response()
        }
        Err(e) => query_error(e),
    }
}
