// REST surface of the relay.
//
// Public routes serve participants (registration, identity checks, read
// models). Host routes sit behind a webinar-scoped bearer token.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webinar_common::types::{
    Interaction, InteractionDraft, Participant, QuestionOrder, QuestionView, Tally, Webinar,
    WebinarStatus,
};

use crate::{
    auth::{jwt::JwtHostTokenService, middleware::require_host_auth},
    engine::{webinars::WebinarUpsert, LiveEngine},
    error::RelayError,
    idempotency::{idempotency_middleware, IdempotencyStore},
    metrics::RelayMetrics,
    validation::ValidatedJson,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LiveEngine>,
    pub jwt_service: Arc<JwtHostTokenService>,
    pub metrics: Arc<RelayMetrics>,
}

#[derive(Serialize, Deserialize)]
pub struct WebinarEnvelope {
    pub webinar: Webinar,
}

#[derive(Deserialize)]
struct StatusRequest {
    status: WebinarStatus,
}

#[derive(Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub webinar: Webinar,
    pub previous_status: WebinarStatus,
}

#[derive(Deserialize)]
struct RegisterRequest {
    phone: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct RegistrationEnvelope {
    pub participant: Participant,
    pub created: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ParticipantEnvelope {
    pub participant: Participant,
}

#[derive(Serialize, Deserialize)]
pub struct InteractionsEnvelope {
    pub active: Option<Interaction>,
    pub history: Vec<Interaction>,
}

#[derive(Deserialize)]
struct CreateInteractionRequest {
    #[serde(flatten)]
    draft: InteractionDraft,
    /// Publish immediately, closing whatever is active.
    #[serde(default)]
    activate: bool,
}

#[derive(Serialize, Deserialize)]
pub struct InteractionEnvelope {
    pub interaction: Interaction,
    /// The interaction closed by this activation, if any.
    #[serde(default)]
    pub closed: Option<Interaction>,
}

#[derive(Serialize, Deserialize)]
pub struct ClosedEnvelope {
    pub closed: Option<Interaction>,
}

#[derive(Serialize, Deserialize)]
pub struct TallyEnvelope {
    pub tally: Tally,
}

#[derive(Deserialize)]
struct QuestionsQuery {
    #[serde(default)]
    order: QuestionOrder,
}

#[derive(Serialize, Deserialize)]
pub struct QuestionsEnvelope {
    pub questions: Vec<QuestionView>,
}

#[derive(Serialize, Deserialize)]
pub struct QuestionEnvelope {
    pub question: QuestionView,
}

pub fn router(state: AppState) -> Router {
    // Host auth wraps idempotency on host routes.
    let host = || middleware::from_fn_with_state(Arc::clone(&state.jwt_service), require_host_auth);
    let idempotent = || middleware::from_fn(idempotency_middleware);

    Router::new()
        .route("/metrics", get(metrics))
        .route("/v1/webinars/{webinar_id}", get(get_webinar))
        .route("/v1/webinars/{webinar_id}", put(upsert_webinar).route_layer(host()))
        .route(
            "/v1/webinars/{webinar_id}/status",
            post(set_status).route_layer(idempotent()).route_layer(host()),
        )
        .route(
            "/v1/webinars/{webinar_id}/participants",
            post(register_participant).route_layer(idempotent()),
        )
        .route("/v1/webinars/{webinar_id}/participants/{participant_id}", get(get_participant))
        .route("/v1/webinars/{webinar_id}/interactions", get(list_interactions))
        .route(
            "/v1/webinars/{webinar_id}/interactions",
            post(create_interaction).route_layer(idempotent()).route_layer(host()),
        )
        .route(
            "/v1/webinars/{webinar_id}/interactions/{interaction_id}/activate",
            post(activate_interaction).route_layer(idempotent()).route_layer(host()),
        )
        .route(
            "/v1/webinars/{webinar_id}/interactions/close",
            post(close_interaction).route_layer(idempotent()).route_layer(host()),
        )
        .route("/v1/webinars/{webinar_id}/interactions/{interaction_id}/tally", get(get_tally))
        .route("/v1/webinars/{webinar_id}/questions", get(list_questions))
        .route(
            "/v1/webinars/{webinar_id}/questions/{question_id}/answer",
            post(answer_question).route_layer(idempotent()).route_layer(host()),
        )
        .layer(Extension(IdempotencyStore::new()))
        .with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.render_prometheus())
}

async fn get_webinar(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
) -> Result<Json<WebinarEnvelope>, RelayError> {
    let webinar = state.engine.webinar(webinar_id).await?;
    Ok(Json(WebinarEnvelope { webinar }))
}

async fn upsert_webinar(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<WebinarUpsert>,
) -> Result<(StatusCode, Json<WebinarEnvelope>), RelayError> {
    let (webinar, created) = state.engine.upsert_webinar(webinar_id, payload).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(WebinarEnvelope { webinar })))
}

async fn set_status(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<StatusRequest>,
) -> Result<Json<StatusEnvelope>, RelayError> {
    let change = state.engine.set_webinar_status(webinar_id, payload.status).await?;
    Ok(Json(StatusEnvelope { webinar: change.webinar, previous_status: change.previous }))
}

async fn register_participant(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> Result<(StatusCode, Json<RegistrationEnvelope>), RelayError> {
    let registration = state
        .engine
        .register_participant(webinar_id, &payload.phone, payload.display_name.as_deref())
        .await?;
    let status = if registration.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(RegistrationEnvelope {
            participant: registration.participant,
            created: registration.created,
        }),
    ))
}

async fn get_participant(
    State(state): State<AppState>,
    Path((webinar_id, participant_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ParticipantEnvelope>, RelayError> {
    let participant = state.engine.verify_participant(webinar_id, participant_id).await?;
    Ok(Json(ParticipantEnvelope { participant }))
}

async fn list_interactions(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
) -> Result<Json<InteractionsEnvelope>, RelayError> {
    state.engine.webinar(webinar_id).await?;
    let active = state.engine.active_interaction(webinar_id).await?;
    let history = state.engine.interaction_history(webinar_id).await?;
    Ok(Json(InteractionsEnvelope { active, history }))
}

async fn create_interaction(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
    ValidatedJson(payload): ValidatedJson<CreateInteractionRequest>,
) -> Result<(StatusCode, Json<InteractionEnvelope>), RelayError> {
    let envelope = if payload.activate {
        let activation = state.engine.publish_interaction(webinar_id, payload.draft).await?;
        InteractionEnvelope { interaction: activation.activated, closed: activation.closed }
    } else {
        let interaction = state.engine.create_interaction(webinar_id, payload.draft).await?;
        InteractionEnvelope { interaction, closed: None }
    };
    Ok((StatusCode::CREATED, Json(envelope)))
}

async fn activate_interaction(
    State(state): State<AppState>,
    Path((webinar_id, interaction_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<InteractionEnvelope>, RelayError> {
    let activation = state.engine.activate_interaction(webinar_id, interaction_id).await?;
    Ok(Json(InteractionEnvelope { interaction: activation.activated, closed: activation.closed }))
}

async fn close_interaction(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
) -> Result<Json<ClosedEnvelope>, RelayError> {
    let closed = state.engine.close_active_interaction(webinar_id).await?;
    Ok(Json(ClosedEnvelope { closed }))
}

async fn get_tally(
    State(state): State<AppState>,
    Path((webinar_id, interaction_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<TallyEnvelope>, RelayError> {
    let tally = state.engine.tally(webinar_id, interaction_id).await?;
    Ok(Json(TallyEnvelope { tally }))
}

async fn list_questions(
    State(state): State<AppState>,
    Path(webinar_id): Path<Uuid>,
    Query(query): Query<QuestionsQuery>,
) -> Result<Json<QuestionsEnvelope>, RelayError> {
    let questions = state.engine.questions(webinar_id, query.order).await?;
    Ok(Json(QuestionsEnvelope { questions }))
}

async fn answer_question(
    State(state): State<AppState>,
    Path((webinar_id, question_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<QuestionEnvelope>, RelayError> {
    let question = state.engine.mark_question_answered(webinar_id, question_id).await?;
    Ok(Json(QuestionEnvelope { question }))
}
