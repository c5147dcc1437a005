//! The request/response surface: public game views, the polled timeout check,
//! the external uploader routes and the small operational endpoints.

use crate::config::reload_config;
use crate::events::{ExternalPly, FischerTimeControl, GameHeader, TimeControlKind};
use crate::orchestrator::{self, ProcessingError, json_body};
use crate::state::{AppState, GameHandle};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use engine::{Color, parse_sip};
use protocol::{ErrorBody, ErrorKind, OutcomeKind, OutcomeReport};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/game/current", get(current_games))
        .route("/game/recent", get(recent_games))
        .route("/game/external/create", post(external_create))
        .route("/game/{id}", get(game_view))
        .route("/game/{id}/check_timeout", get(check_timeout_handler))
        .route("/game/{id}/append_ply", post(external_append_ply))
        .route("/game/{id}/end", post(external_end_handler))
        .route("/game/{id}/rollback", post(external_rollback_handler))
        .route("/game/{id}/add_time", post(external_add_time))
        .route("/reload", get(reload_handler))
        .route("/admin/shutdown", post(shutdown_handler))
        .route("/admin/register_token", post(register_token))
}

/// How a domain rejection maps onto the HTTP surface.
fn status_of(err: &ProcessingError) -> StatusCode {
    match err {
        ProcessingError::UnknownGame => StatusCode::NOT_FOUND,
        ProcessingError::NotAPlayer | ProcessingError::UploaderMismatch => StatusCode::FORBIDDEN,
        ProcessingError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ProcessingError::CorruptPosition(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn reply_error(err: ProcessingError) -> Response {
    let kind = match err {
        ProcessingError::UploaderMismatch => ErrorKind::AuthError,
        _ => ErrorKind::ProcessingError,
    };
    let body = ErrorBody {
        error: kind,
        details: err.to_string(),
    };
    (status_of(&err), Json(body)).into_response()
}

fn validation_error(details: String) -> Response {
    let body = ErrorBody {
        error: ErrorKind::ValidationError,
        details,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ListingQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
    /// Keeps only games of the named player or of the named time control kind.
    #[serde(default)]
    filter: Option<String>,
}

impl ListingQuery {
    fn clamp(&self) -> (usize, usize) {
        (self.offset, self.limit.unwrap_or(50).min(200))
    }

    fn admits(&self, header: &GameHeader) -> bool {
        match &self.filter {
            Some(filter) => {
                header.white == *filter
                    || header.black == *filter
                    || header.time_control_kind.label() == filter
            }
            None => true,
        }
    }
}

async fn game_view(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.game_anywhere(&id).await {
        Some(handle) => Json(handle.log.lock().await.view()).into_response(),
        None => reply_error(ProcessingError::UnknownGame),
    }
}

async fn current_games(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let handles: Vec<Arc<GameHandle>> = state.games.lock().await.values().cloned().collect();
    let mut views = Vec::with_capacity(handles.len());
    for handle in handles {
        let view = handle.log.lock().await.view();
        if query.admits(&view.header) {
            views.push(view);
        }
    }
    // Youngest games first, the map itself has no order.
    views.sort_by(|a, b| b.header.started_at.cmp(&a.header.started_at));
    let (offset, limit) = query.clamp();
    let page: Vec<_> = views.into_iter().skip(offset).take(limit).collect();
    Json(page).into_response()
}

async fn recent_games(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    // The list is kept newest first, the filter runs before the page window.
    let handles: Vec<Arc<GameHandle>> = state.recent.lock().await.iter().cloned().collect();
    let mut views = Vec::new();
    for handle in handles {
        let view = handle.log.lock().await.view();
        if query.admits(&view.header) {
            views.push(view);
        }
    }
    let (offset, limit) = query.clamp();
    let page: Vec<_> = views.into_iter().skip(offset).take(limit).collect();
    Json(page).into_response()
}

async fn check_timeout_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(game) = state.game_anywhere(&id).await else {
        return reply_error(ProcessingError::UnknownGame);
    };
    match orchestrator::check_timeout(&state, &game).await {
        Ok(outcome) => Json(json!({ "outcome": outcome.map(report_of) })).into_response(),
        Err(err) => reply_error(err),
    }
}

fn report_of(outcome: crate::events::OutcomeRecord) -> OutcomeReport {
    OutcomeReport {
        kind: outcome.kind,
        winner: outcome.winner,
    }
}

fn uploader_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-uploader-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Checks that the caller presents the token the game was created under.
async fn authorize_uploader(
    game: &Arc<GameHandle>,
    headers: &HeaderMap,
) -> Result<(), ProcessingError> {
    let log = game.log.lock().await;
    let Some(expected) = &log.header.external_uploader else {
        return Err(ProcessingError::GameIsInternal);
    };
    match uploader_token(headers) {
        Some(token) if token == *expected => Ok(()),
        _ => Err(ProcessingError::UploaderMismatch),
    }
}

#[derive(Deserialize)]
struct CreateGameRequest {
    white: String,
    black: String,
    #[serde(default)]
    rated: bool,
    time_control_kind: TimeControlKind,
    #[serde(default)]
    custom_starting_sip: Option<String>,
    #[serde(default)]
    fischer: Option<FischerTimeControl>,
}

async fn external_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateGameRequest>,
) -> Response {
    let Some(token) = uploader_token(&headers) else {
        return reply_error(ProcessingError::UploaderMismatch);
    };
    if let Some(sip) = &request.custom_starting_sip
        && let Err(err) = parse_sip(sip)
    {
        return validation_error(format!("bad starting sip: {}", err));
    }
    let header = GameHeader {
        id: Uuid::new_v4(),
        started_at: Utc::now(),
        white: request.white,
        black: request.black,
        rated: request.rated,
        time_control_kind: request.time_control_kind,
        custom_starting_sip: request.custom_starting_sip,
        external_uploader: Some(token),
        fischer: request.fischer,
    };
    match orchestrator::create_game(&state, header).await {
        Ok(handle) => {
            (StatusCode::CREATED, Json(json!({ "game_id": handle.id }))).into_response()
        }
        Err(err) => reply_error(err),
    }
}

async fn external_append_ply(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ExternalPly>,
) -> Response {
    let Some(game) = state.game(&id).await else {
        return reply_error(ProcessingError::UnknownGame);
    };
    if let Err(err) = authorize_uploader(&game, &headers).await {
        return reply_error(err);
    }
    match orchestrator::append_ply(
        &state,
        &game,
        body.ply,
        body.original_sip,
        body.time_remainders,
        body.moving_color,
    )
    .await
    {
        Ok(outcome) => Json(json!({ "outcome": outcome.map(report_of) })).into_response(),
        Err(err) => reply_error(err),
    }
}

#[derive(Deserialize)]
struct EndRequest {
    kind: OutcomeKind,
    #[serde(default)]
    winner: Option<Color>,
}

async fn external_end_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<EndRequest>,
) -> Response {
    let Some(game) = state.game(&id).await else {
        return reply_error(ProcessingError::UnknownGame);
    };
    if let Err(err) = authorize_uploader(&game, &headers).await {
        return reply_error(err);
    }
    match orchestrator::external_end(&state, &game, request.kind, request.winner).await {
        Ok(outcome) => Json(json!({ "outcome": report_of(outcome) })).into_response(),
        Err(err) => reply_error(err),
    }
}

#[derive(Deserialize)]
struct RollbackRequest {
    requested_by: Color,
}

async fn external_rollback_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RollbackRequest>,
) -> Response {
    let Some(game) = state.game(&id).await else {
        return reply_error(ProcessingError::UnknownGame);
    };
    if let Err(err) = authorize_uploader(&game, &headers).await {
        return reply_error(err);
    }
    match orchestrator::external_rollback(&state, &game, request.requested_by).await {
        Ok(()) => Json(json_body(&game.log.lock().await.view())).into_response(),
        Err(err) => reply_error(err),
    }
}

#[derive(Deserialize)]
struct AddTimeRequest {
    giver: Color,
}

async fn external_add_time(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<AddTimeRequest>,
) -> Response {
    let Some(game) = state.game(&id).await else {
        return reply_error(ProcessingError::UnknownGame);
    };
    if let Err(err) = authorize_uploader(&game, &headers).await {
        return reply_error(err);
    }
    match orchestrator::add_time(&state, &game, request.giver).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => reply_error(err),
    }
}

/// Forces the reload of the config file and lists the important knobs. This
/// enables operational tuning without restarting the service.
async fn reload_handler(State(state): State<Arc<AppState>>) -> String {
    match reload_config(&state.config).await {
        Ok(_) => {
            let config = state.config.read().await;
            format!(
                "Server build: {}\nManual time gift: {} s\nKeep alive timeout: {} ms",
                config.server_build,
                config.rules.secs_added_manually,
                config.keep_alive.timeout_ms
            )
        }
        Err(e) => {
            format!("Config reload failed: {}", e)
        }
    }
}

async fn shutdown_handler(State(state): State<Arc<AppState>>) -> Response {
    orchestrator::begin_shutdown(&state).await;
    (StatusCode::ACCEPTED, "Server is draining now.\n").into_response()
}

#[derive(Deserialize)]
struct RegisterTokenRequest {
    token: String,
    user: String,
}

/// The seam for the external session issuer: makes a token known to the live
/// surface. Both sides of the pair must be fresh.
async fn register_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterTokenRequest>,
) -> Response {
    let inserted = state
        .tokens
        .lock()
        .await
        .insert(request.token, request.user);
    if inserted {
        StatusCode::NO_CONTENT.into_response()
    } else {
        let body = ErrorBody {
            error: ErrorKind::ValidationError,
            details: "token or user already registered".into(),
        };
        (StatusCode::CONFLICT, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_rejections_map_to_sensible_status_codes() {
        assert_eq!(status_of(&ProcessingError::UnknownGame), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&ProcessingError::UploaderMismatch),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(&ProcessingError::ShuttingDown),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(&ProcessingError::PlyInvalid {
                current_sip: "2!w!".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&ProcessingError::OfferTimingForbidden),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn paging_is_clamped_to_a_sane_window() {
        let query = ListingQuery {
            offset: 10,
            limit: Some(100_000),
            filter: None,
        };
        assert_eq!(query.clamp(), (10, 200));
        let query = ListingQuery {
            offset: 0,
            limit: None,
            filter: None,
        };
        assert_eq!(query.clamp(), (0, 50));
    }

    #[test]
    fn listing_filter_admits_players_and_time_control_kinds() {
        let header = GameHeader {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            white: "alice".into(),
            black: "bob".into(),
            rated: false,
            time_control_kind: TimeControlKind::Blitz,
            custom_starting_sip: None,
            external_uploader: None,
            fischer: None,
        };
        let query = |filter: Option<&str>| ListingQuery {
            offset: 0,
            limit: None,
            filter: filter.map(str::to_string),
        };
        assert!(query(None).admits(&header));
        assert!(query(Some("alice")).admits(&header));
        assert!(query(Some("bob")).admits(&header));
        assert!(query(Some("BLITZ")).admits(&header));
        assert!(!query(Some("carol")).admits(&header));
        assert!(!query(Some("RAPID")).admits(&header));
    }
}
