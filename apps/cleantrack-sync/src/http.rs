use crate::error::RouteError;
use crate::model::{Category, LatLng};
use crate::projector::ReconcileStats;
use crate::session::{RouteSummary, SessionHandle, SessionStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Clone)]
pub struct HttpState {
    pub session: SessionHandle,
}

type HttpError = (StatusCode, String);

#[derive(Debug, Deserialize)]
struct LayerRequest {
    visible: bool,
}

#[derive(Debug, Serialize)]
struct LayerResponse {
    category: Category,
    visible: bool,
    stats: ReconcileStats,
}

#[derive(Debug, Default, Deserialize)]
struct RouteRequest {
    #[serde(default)]
    start: Option<LatLng>,
    #[serde(default)]
    end: Option<LatLng>,
}

async fn healthz() -> &'static str {
    "ok"
}

fn unavailable(err: anyhow::Error) -> HttpError {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

fn parse_category(raw: &str) -> Result<Category, HttpError> {
    Category::parse(raw).ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown layer {raw:?}")))
}

async fn get_status(State(state): State<HttpState>) -> Result<Json<SessionStatus>, HttpError> {
    let status = state.session.status().await.map_err(unavailable)?;
    Ok(Json(status))
}

async fn get_map(State(state): State<HttpState>) -> Result<Json<JsonValue>, HttpError> {
    let view = state.session.map_view().await.map_err(unavailable)?;
    Ok(Json(view.to_geojson()))
}

async fn put_layer(
    State(state): State<HttpState>,
    Path(layer): Path<String>,
    Json(payload): Json<LayerRequest>,
) -> Result<Json<LayerResponse>, HttpError> {
    let category = parse_category(&layer)?;
    let stats = state
        .session
        .set_visible(category, payload.visible)
        .await
        .map_err(unavailable)?;
    Ok(Json(LayerResponse {
        category,
        visible: payload.visible,
        stats,
    }))
}

async fn post_layer_solo(
    State(state): State<HttpState>,
    Path(layer): Path<String>,
) -> Result<Json<LayerResponse>, HttpError> {
    let category = parse_category(&layer)?;
    let stats = state.session.show_only(category).await.map_err(unavailable)?;
    Ok(Json(LayerResponse {
        category,
        visible: true,
        stats,
    }))
}

async fn post_route(
    State(state): State<HttpState>,
    payload: Option<Json<RouteRequest>>,
) -> Result<Json<RouteSummary>, HttpError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    state
        .session
        .show_route(request.start, request.end)
        .await
        .map(Json)
        .map_err(|err| (route_status(&err), err.to_string()))
}

fn route_status(err: &RouteError) -> StatusCode {
    match err {
        RouteError::InvalidEndpoints(_) => StatusCode::BAD_REQUEST,
        RouteError::Superseded => StatusCode::CONFLICT,
        RouteError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        RouteError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RouteError::Provider(_) | RouteError::NoRoute(_) => StatusCode::BAD_GATEWAY,
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/map", get(get_map))
        .route("/v1/layers/{category}", put(put_layer))
        .route("/v1/layers/{category}/solo", post(post_layer_solo))
        .route("/v1/route", post(post_route))
        .with_state(state)
}
