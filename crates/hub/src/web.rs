use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::Db;
use crate::options::{RawOptions, Settings};
use crate::scheduler::{OperatorCommand, OperatorError, Scheduler};
use crate::state::SharedState;
use crate::zone::LocalZone;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub scheduler: Scheduler,
    pub db: Db,
    /// Reads offset-less timestamps in requests.
    pub zone: LocalZone,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/boxes/{id}", get(get_box))
        .route("/api/boxes/{id}/config", get(get_config).patch(patch_config))
        .route("/api/boxes/{id}/phase", put(put_phase))
        .route("/api/boxes/{id}/master", put(put_master))
        .route("/api/boxes/{id}/pump", put(put_pump))
        .route("/api/boxes/{id}/commands", get(get_commands))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PhaseRequest {
    phase: String,
    /// RFC 3339, or a local `YYYY-MM-DD[THH:MM[:SS]]`.
    #[serde(default)]
    started_at: Option<String>,
}

#[derive(Deserialize)]
struct MasterRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct ConfigPatch {
    options: RawOptions,
}

#[derive(Deserialize)]
struct PumpRequest {
    on: bool,
}

#[derive(Deserialize)]
struct CommandsQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ConfigView {
    box_id: String,
    options: RawOptions,
    effective: Settings,
}

enum ApiError {
    Operator(OperatorError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::Operator(e) => {
                let status = match &e {
                    OperatorError::UnknownBox(_) => StatusCode::NOT_FOUND,
                    OperatorError::UnknownPhase(_) | OperatorError::Invalid(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    OperatorError::NoPump => StatusCode::CONFLICT,
                    OperatorError::Actuator(_) => StatusCode::BAD_GATEWAY,
                    OperatorError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
            ApiError::Internal(e) => {
                error!("api: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

impl From<OperatorError> for ApiError {
    fn from(e: OperatorError) -> Self {
        ApiError::Operator(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn get_box(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snap = state
        .scheduler
        .operator(&id, OperatorCommand::Describe)
        .await?;
    Ok(Json(snap))
}

async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snap = state
        .scheduler
        .operator(&id, OperatorCommand::Describe)
        .await?;
    Ok(Json(ConfigView {
        box_id: snap.box_id,
        options: snap.options,
        effective: snap.settings,
    }))
}

async fn patch_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let snap = state
        .scheduler
        .operator(&id, OperatorCommand::UpdateOptions(req.options))
        .await?;
    Ok(Json(ConfigView {
        box_id: snap.box_id,
        options: snap.options,
        effective: snap.settings,
    }))
}

async fn put_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PhaseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started_at = match req.started_at.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(
            state
                .zone
                .parse_timestamp(s)
                .map_err(|e| OperatorError::Invalid(format!("started_at: {e:#}")))?,
        ),
    };
    let cmd = OperatorCommand::SetPhase {
        phase: req.phase,
        started_at,
    };
    Ok(Json(state.scheduler.operator(&id, cmd).await?))
}

async fn put_master(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MasterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cmd = OperatorCommand::SetMaster(req.enabled);
    Ok(Json(state.scheduler.operator(&id, cmd).await?))
}

async fn put_pump(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PumpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cmd = OperatorCommand::Pump(req.on);
    Ok(Json(state.scheduler.operator(&id, cmd).await?))
}

/// Most recent actuator commands for a box, newest first.
async fn get_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<CommandsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.shared.read().await.boxes.contains_key(&id) {
        return Err(OperatorError::UnknownBox(id).into());
    }
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let rows = state.db.recent_commands(&id, limit).await?;
    Ok(Json(rows))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControllerState, GrowBox};
    use crate::db::Db;
    use crate::gateway::tests::FakeActuators;
    use crate::options::Options;
    use crate::phase::{GrowPhase, PhaseClock};
    use crate::scheduler::Runner;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use time::format_description::well_known::Rfc3339;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    fn test_box(id: &str, pump: Option<&str>) -> GrowBox {
        let mut raw = RawOptions::new();
        raw.insert("fan_entity".into(), json!("switch.fan"));
        if let Some(p) = pump {
            raw.insert("pump_entity".into(), json!(p));
        }
        let now = OffsetDateTime::now_utc();
        let state = ControllerState::new(PhaseClock::new(GrowPhase::Vegetative, now), now);
        GrowBox::new(id, id, Options::new(raw), state)
    }

    async fn app() -> Router {
        app_in(LocalZone::default()).await
    }

    async fn app_in(zone: LocalZone) -> Router {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = SystemState::shared();
        let (scheduler, rx) = Scheduler::channel();
        let runner = Runner::new(
            vec![test_box("tent-1", Some("switch.pump")), test_box("dry", None)],
            Box::new(FakeActuators::default()),
            db.clone(),
            shared.clone(),
            scheduler.clone(),
            zone,
        );
        tokio::spawn(runner.run(rx));
        router(AppState {
            shared,
            scheduler,
            db,
            zone,
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn get_box_returns_snapshot() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/api/boxes/tent-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "vegetative");
        assert_eq!(body["days_in_phase"], 0);
        assert_eq!(body["master_enabled"], true);
        assert_eq!(body["water"]["state"], "cooldown");
    }

    #[tokio::test]
    async fn unknown_box_is_404() {
        let app = app().await;
        let (status, body) = call(&app, Method::GET, "/api/boxes/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn status_lists_boxes() {
        let app = app().await;
        // Any operator round-trip guarantees the runner has published.
        call(&app, Method::GET, "/api/boxes/tent-1", None).await;
        let (status, body) = call(&app, Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["boxes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn put_phase_sets_and_rejects_unknown() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/phase",
            Some(json!({ "phase": "Flowering", "started_at": "2024-06-01T00:00:00Z" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "flowering");
        assert_eq!(body["phase_started_at"], "2024-06-01T00:00:00Z");

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/phase",
            Some(json!({ "phase": "harvest" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn started_at(body: &Value) -> OffsetDateTime {
        OffsetDateTime::parse(body["phase_started_at"].as_str().unwrap(), &Rfc3339).unwrap()
    }

    #[tokio::test]
    async fn put_phase_accepts_local_date() {
        let app = app_in(LocalZone::parse("Europe/Berlin").unwrap()).await;
        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/phase",
            Some(json!({ "phase": "seedling", "started_at": "2024-06-01" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started_at(&body), datetime!(2024-05-31 22:00 UTC));

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/phase",
            Some(json!({ "phase": "seedling", "started_at": "first of june" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_config_accepts_date_only_and_naive_start() {
        let app = app_in(LocalZone::parse("Europe/Berlin").unwrap()).await;
        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/boxes/tent-1/config",
            Some(json!({ "options": { "phase_start_date": "2024-06-01" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/boxes/tent-1", None).await;
        assert_eq!(started_at(&body), datetime!(2024-05-31 22:00 UTC));

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/boxes/tent-1/config",
            Some(json!({ "options": { "phase_start_date": "2024-06-01T12:00:00" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/boxes/tent-1", None).await;
        assert_eq!(started_at(&body), datetime!(2024-06-01 10:00 UTC));
    }

    #[tokio::test]
    async fn put_master_toggles() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/master",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["master_enabled"], false);
    }

    #[tokio::test]
    async fn patch_config_merges_and_resolves() {
        let app = app().await;
        let (status, body) = call(
            &app,
            Method::PATCH,
            "/api/boxes/tent-1/config",
            Some(json!({ "options": { "target_temp": 21.5, "fan_entity": null } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["effective"]["target_temp"], 21.5);
        assert_eq!(body["effective"]["fan_entity"], "switch.fan");

        let (_, body) = call(&app, Method::GET, "/api/boxes/tent-1/config", None).await;
        assert_eq!(body["options"]["target_temp"], 21.5);
    }

    #[tokio::test]
    async fn patch_config_rejects_unknown_option() {
        let app = app().await;
        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/boxes/tent-1/config",
            Some(json!({ "options": { "fan_speed": 3 } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pump_without_entity_is_conflict() {
        let app = app().await;
        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/boxes/dry/pump",
            Some(json!({ "on": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            Method::PUT,
            "/api/boxes/tent-1/pump",
            Some(json!({ "on": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, "/api/boxes/tent-1/commands", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["entity"], "switch.pump");
        assert_eq!(body[0]["action"], "ON");

        let (status, _) = call(&app, Method::GET, "/api/boxes/nope/commands", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
