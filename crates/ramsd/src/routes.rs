//! API routes for ramsd
//!
//! Thin HTTP shell over the engines in rams_common: handlers parse, call
//! one engine method, and map `EngineError` onto status codes. The actor
//! recorded in the audit log comes from the `x-rams-actor` header.

use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use rams_common::{
    Animal, AssignedRequest, AssignmentUpdate, EngineError, EvacAssignment, EvacTeamMember,
    HealthResponse, Incident, NewAnimal, NewAssignment, NewPerson, NewServiceRequest,
    NewTeamMember, Person, ServiceRequest, ServiceRequestPatch, Shelter, SrStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

type AppStateArc = Arc<AppState>;
type HandlerError = (StatusCode, String);

/// Audit attribution; absent or unreadable headers fall back to "system".
fn actor(headers: &HeaderMap) -> String {
    headers
        .get("x-rams-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("system")
        .to_string()
}

fn http_error(e: EngineError) -> HandlerError {
    match &e {
        EngineError::Validation { message, ids } => {
            let body = serde_json::json!({ "error": message, "ids": ids });
            (StatusCode::BAD_REQUEST, body.to_string())
        }
        EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        EngineError::Conflict(_) => (StatusCode::CONFLICT, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Health
// ============================================================================

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/v1/health", get(health))
}

async fn health(State(state): State<AppStateArc>) -> Result<Json<HealthResponse>, HandlerError> {
    let counts = state.store.counts().map_err(http_error)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        counts,
    }))
}

// ============================================================================
// Reference data: incidents, persons, shelters
// ============================================================================

#[derive(Debug, Deserialize)]
struct NewIncident {
    slug: String,
    name: String,
}

pub fn reference_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/incidents", post(create_incident).get(list_incidents))
        .route("/v1/persons", post(create_person))
        .route("/v1/persons/:id", get(get_person))
        .route("/v1/shelters", post(create_shelter).get(list_shelters))
}

async fn create_incident(
    State(state): State<AppStateArc>,
    Json(req): Json<NewIncident>,
) -> Result<Json<Incident>, HandlerError> {
    info!("Creating incident '{}'", req.slug);
    let incident = state
        .store
        .create_incident(&req.slug, &req.name)
        .map_err(http_error)?;
    Ok(Json(incident))
}

async fn list_incidents(
    State(state): State<AppStateArc>,
) -> Result<Json<Vec<Incident>>, HandlerError> {
    Ok(Json(state.store.list_incidents().map_err(http_error)?))
}

async fn create_person(
    State(state): State<AppStateArc>,
    Json(req): Json<NewPerson>,
) -> Result<Json<Person>, HandlerError> {
    Ok(Json(state.store.create_person(req).map_err(http_error)?))
}

async fn get_person(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
) -> Result<Json<Person>, HandlerError> {
    Ok(Json(state.store.person(id).map_err(http_error)?))
}

#[derive(Debug, Deserialize)]
struct NewShelter {
    name: String,
    #[serde(default)]
    address: String,
}

async fn create_shelter(
    State(state): State<AppStateArc>,
    Json(req): Json<NewShelter>,
) -> Result<Json<Shelter>, HandlerError> {
    Ok(Json(
        state
            .store
            .create_shelter(&req.name, &req.address)
            .map_err(http_error)?,
    ))
}

async fn list_shelters(
    State(state): State<AppStateArc>,
) -> Result<Json<Vec<Shelter>>, HandlerError> {
    Ok(Json(state.store.list_shelters().map_err(http_error)?))
}

// ============================================================================
// Animals
// ============================================================================

pub fn animal_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/animals", post(create_animal))
        .route("/v1/animals/:id", get(get_animal))
}

async fn create_animal(
    State(state): State<AppStateArc>,
    Json(req): Json<NewAnimal>,
) -> Result<Json<Animal>, HandlerError> {
    Ok(Json(state.store.create_animal(req).map_err(http_error)?))
}

async fn get_animal(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
) -> Result<Json<Animal>, HandlerError> {
    Ok(Json(state.store.animal(id).map_err(http_error)?))
}

// ============================================================================
// Service requests
// ============================================================================

#[derive(Debug, Deserialize)]
struct SrListQuery {
    incident: Option<String>,
    status: Option<String>,
}

pub fn service_request_routes() -> Router<AppStateArc> {
    Router::new()
        .route(
            "/v1/service-requests",
            post(create_service_request).get(list_service_requests),
        )
        .route("/v1/service-requests/:id", get(get_service_request))
        .route("/v1/service-requests/:id/update", post(update_service_request))
}

async fn create_service_request(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(req): Json<NewServiceRequest>,
) -> Result<Json<ServiceRequest>, HandlerError> {
    let sr = state
        .ledger
        .create(&actor(&headers), req)
        .map_err(http_error)?;
    Ok(Json(sr))
}

async fn list_service_requests(
    State(state): State<AppStateArc>,
    Query(query): Query<SrListQuery>,
) -> Result<Json<Vec<ServiceRequest>>, HandlerError> {
    let status = query
        .status
        .as_deref()
        .map(SrStatus::parse)
        .transpose()
        .map_err(http_error)?;
    let srs = state
        .store
        .list_service_requests(query.incident.as_deref(), status)
        .map_err(http_error)?;
    Ok(Json(srs))
}

async fn get_service_request(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceRequest>, HandlerError> {
    Ok(Json(state.store.service_request(id).map_err(http_error)?))
}

async fn update_service_request(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(patch): Json<ServiceRequestPatch>,
) -> Result<Json<ServiceRequest>, HandlerError> {
    let actor = actor(&headers);
    let sr = if patch.reunite_animals {
        state.ledger.reunite_all(&actor, id).map_err(http_error)?
    } else {
        state.ledger.update(&actor, id, patch).map_err(http_error)?
    };
    Ok(Json(sr))
}

// ============================================================================
// Teams and members
// ============================================================================

#[derive(Debug, Deserialize)]
struct NewTeam {
    incident_slug: String,
    name: String,
    #[serde(default)]
    member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct MemberIds {
    member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct MemberId {
    member_id: i64,
}

#[derive(Debug, Deserialize)]
struct Visibility {
    show: bool,
}

pub fn team_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/teams", post(create_team).get(list_teams))
        .route("/v1/teams/:id", get(get_team))
        .route("/v1/teams/:id/members", post(add_team_members))
        .route("/v1/teams/:id/remove-member", post(remove_team_member))
        .route("/v1/teams/:id/visibility", post(set_team_visibility))
        .route(
            "/v1/team-members",
            post(create_team_member).get(list_team_members),
        )
}

async fn create_team(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(req): Json<NewTeam>,
) -> Result<Json<rams_common::DispatchTeam>, HandlerError> {
    let team = state
        .teams
        .create(&actor(&headers), &req.incident_slug, &req.name, &req.member_ids)
        .map_err(http_error)?;
    Ok(Json(team))
}

async fn list_teams(
    State(state): State<AppStateArc>,
) -> Result<Json<Vec<rams_common::teams::TeamView>>, HandlerError> {
    Ok(Json(state.teams.list(false).map_err(http_error)?))
}

async fn get_team(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
) -> Result<Json<rams_common::teams::TeamView>, HandlerError> {
    Ok(Json(state.teams.get(id).map_err(http_error)?))
}

async fn add_team_members(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<MemberIds>,
) -> Result<Json<rams_common::DispatchTeam>, HandlerError> {
    let team = state
        .teams
        .add_members(&actor(&headers), id, &req.member_ids)
        .map_err(http_error)?;
    Ok(Json(team))
}

async fn remove_team_member(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<MemberId>,
) -> Result<Json<rams_common::DispatchTeam>, HandlerError> {
    let team = state
        .teams
        .remove_member(&actor(&headers), id, req.member_id)
        .map_err(http_error)?;
    Ok(Json(team))
}

async fn set_team_visibility(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<Visibility>,
) -> Result<StatusCode, HandlerError> {
    state
        .teams
        .set_visibility(&actor(&headers), id, req.show)
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_team_member(
    State(state): State<AppStateArc>,
    Json(req): Json<NewTeamMember>,
) -> Result<Json<EvacTeamMember>, HandlerError> {
    Ok(Json(
        state.store.create_team_member(req).map_err(http_error)?,
    ))
}

async fn list_team_members(
    State(state): State<AppStateArc>,
) -> Result<Json<Vec<EvacTeamMember>>, HandlerError> {
    Ok(Json(state.store.list_team_members().map_err(http_error)?))
}

// ============================================================================
// Assignments
// ============================================================================

#[derive(Debug, Deserialize)]
struct AssignmentListQuery {
    status: Option<String>,
}

/// One assignment with its per-request rounds, as served by `GET
/// /v1/assignments/:id`.
#[derive(Debug, Serialize)]
struct AssignmentDetail {
    #[serde(flatten)]
    assignment: EvacAssignment,
    requests: Vec<AssignedRequest>,
}

pub fn assignment_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/assignments", post(create_assignment).get(list_assignments))
        .route("/v1/assignments/:id", get(get_assignment))
        .route("/v1/assignments/:id/update", post(update_assignment))
}

async fn create_assignment(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
    Json(req): Json<NewAssignment>,
) -> Result<Json<EvacAssignment>, HandlerError> {
    info!(
        "Creating assignment over {} request(s) for '{}'",
        req.service_requests.len(),
        req.incident_slug
    );
    let assignment = state
        .dispatch
        .create(&actor(&headers), req)
        .map_err(http_error)?;
    Ok(Json(assignment))
}

async fn list_assignments(
    State(state): State<AppStateArc>,
    Query(query): Query<AssignmentListQuery>,
) -> Result<Json<Vec<EvacAssignment>>, HandlerError> {
    let open = match query.status.as_deref() {
        Some("open") => Some(true),
        Some("closed") => Some(false),
        None => None,
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown assignment status filter '{}'", other),
            ))
        }
    };
    Ok(Json(state.store.list_assignments(open).map_err(http_error)?))
}

async fn get_assignment(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
) -> Result<Json<AssignmentDetail>, HandlerError> {
    let assignment = state.store.assignment(id).map_err(http_error)?;
    let requests = state
        .store
        .assigned_requests_for_assignment(id)
        .map_err(http_error)?;
    Ok(Json(AssignmentDetail {
        assignment,
        requests,
    }))
}

async fn update_assignment(
    State(state): State<AppStateArc>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(batch): Json<AssignmentUpdate>,
) -> Result<Json<EvacAssignment>, HandlerError> {
    let assignment = state
        .dispatch
        .update(&actor(&headers), id, batch)
        .map_err(http_error)?;
    Ok(Json(assignment))
}
