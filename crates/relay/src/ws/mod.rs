// Live session socket: `/v1/webinars/{webinar_id}/live`.
//
// One connection per participant view. The first frame must be `hello`;
// after the ack the server streams a snapshot followed by incremental
// frames derived from store change sets and presence changes.

use std::{collections::BTreeSet, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::{sync::broadcast::error::RecvError, time::Instant};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use webinar_common::{
    protocol::ws::{WsMessage, MAX_FRAME_BYTES},
    types::{
        Interaction, InteractionStatus, Participant, Question, QuestionVote, Response, Webinar,
    },
};

use crate::{
    engine::{presence::ConnectionHandle, snapshot::build_session_snapshot, EngineError, LiveEngine},
    error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError},
    metrics, protocol,
    store::{ChangeSet, ReactionTotals, StoreSnapshot, SubscriptionEvent, Table},
    validation::check_ws_frame_size,
};

pub fn router(engine: Arc<LiveEngine>) -> Router {
    Router::new().route("/v1/webinars/{webinar_id}/live", get(ws_upgrade)).with_state(engine)
}

pub async fn ws_upgrade(
    Path(webinar_id): Path<Uuid>,
    State(engine): State<Arc<LiveEngine>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(
                request_id.clone(),
                handle_socket(engine, webinar_id, socket)
                    .instrument(info_span!("ws.session", webinar_id = %webinar_id, request_id = %request_id)),
            )
            .await;
        },
    )
}

async fn handle_socket(engine: Arc<LiveEngine>, webinar_id: Uuid, mut socket: WebSocket) {
    let hello_started_at = Instant::now();
    let participant = match accept_hello(&engine, webinar_id, &mut socket).await {
        Ok(participant) => participant,
        Err(Some(error_message)) => {
            metrics::record_ws_request("hello", true, elapsed_ms(hello_started_at));
            let _ = send_ws_message(&mut socket, &error_message).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(None) => {
            metrics::record_ws_request("hello", true, elapsed_ms(hello_started_at));
            return;
        }
    };

    let participant_id = participant.id;
    let hello_ack = WsMessage::HelloAck {
        server_time: Utc::now().to_rfc3339(),
        participant,
        heartbeat_interval_ms: engine.heartbeat_interval().as_millis() as u64,
    };
    if send_ws_message(&mut socket, &hello_ack).await.is_err() {
        metrics::record_ws_request("hello", true, elapsed_ms(hello_started_at));
        return;
    }
    metrics::record_ws_request("hello", false, elapsed_ms(hello_started_at));

    metrics::adjust_live_connections(1);
    let handle = engine.presence().register(webinar_id, participant_id).await;
    debug!(participant_id = %participant_id, connection_id = %handle.connection_id, "live session opened");

    run_session(&engine, &handle, &mut socket).await;

    engine.presence().remove(&handle).await;
    metrics::adjust_live_connections(-1);
    debug!(participant_id = %participant_id, "live session closed");
}

/// `Err(None)` means the peer went away before saying hello.
async fn accept_hello(
    engine: &LiveEngine,
    webinar_id: Uuid,
    socket: &mut WebSocket,
) -> Result<Participant, Option<WsMessage>> {
    let first = match tokio::time::timeout(engine.heartbeat_timeout(), socket.recv()).await {
        Ok(Some(Ok(Message::Text(raw)))) => raw,
        Ok(Some(Ok(_))) => return Err(Some(hello_required())),
        Ok(_) => return Err(None),
        Err(_) => {
            return Err(Some(WsMessage::error(
                ErrorCode::ValidationFailed.as_str(),
                "timed out waiting for hello",
                true,
                None,
            )))
        }
    };

    let Ok(WsMessage::Hello { protocol_version, webinar_id: hello_webinar, participant_id }) =
        serde_json::from_str::<WsMessage>(&first)
    else {
        return Err(Some(hello_required()));
    };

    if let Err(error) = protocol::require_supported(&protocol_version) {
        return Err(Some(relay_error_frame(&error, None)));
    }
    if hello_webinar != webinar_id {
        return Err(Some(WsMessage::error(
            ErrorCode::ValidationFailed.as_str(),
            "hello webinar_id does not match the socket path",
            false,
            None,
        )));
    }

    engine
        .verify_participant(webinar_id, participant_id)
        .await
        .map_err(|error| Some(engine_error_frame(error, None)))
}

async fn run_session(engine: &LiveEngine, handle: &ConnectionHandle, socket: &mut WebSocket) {
    let webinar_id = handle.webinar_id;
    let mut subscription = engine.subscribe(webinar_id);
    let mut presence_changes = engine.presence().subscribe();

    let mut heartbeat_interval = tokio::time::interval(engine.heartbeat_interval());
    heartbeat_interval.reset();
    let heartbeat_timeout = engine.heartbeat_timeout();
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if awaiting_pong.is_none() {
                    if socket.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    awaiting_pong = Some(Instant::now() + heartbeat_timeout);
                }
            }
            _ = wait_for_deadline(awaiting_pong) => {
                warn!(
                    participant_id = %handle.participant_id,
                    connection_id = %handle.connection_id,
                    "heartbeat timeout, disconnecting"
                );
                break;
            }
            event = subscription.next() => {
                let event = match event {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(error) => {
                        warn!(error = %error, "live subscription failed");
                        let _ = send_ws_message(
                            socket,
                            &WsMessage::error(
                                ErrorCode::InternalError.as_str(),
                                "live subscription failed; reconnect to resync",
                                true,
                                None,
                            ),
                        )
                        .await;
                        break;
                    }
                };

                let frames = match frames_for_event(engine, handle, event).await {
                    Ok(frames) => frames,
                    Err(error) => vec![engine_error_frame(error, None)],
                };
                if send_all(socket, &frames).await.is_err() {
                    break;
                }
            }
            change = presence_changes.recv() => {
                let count = match change {
                    Ok(change) if change.webinar_id == webinar_id => change.count,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => engine.presence().count(webinar_id).await,
                    Err(RecvError::Closed) => break,
                };
                if send_ws_message(socket, &WsMessage::PresenceChanged { count }).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        engine.presence().touch(handle).await;
                        let replies = handle_text_frame(engine, handle, &raw_message).await;
                        if send_all(socket, &replies).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        engine.presence().touch(handle).await;
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        engine.presence().touch(handle).await;
                        awaiting_pong = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
}

async fn handle_text_frame(
    engine: &LiveEngine,
    handle: &ConnectionHandle,
    raw_message: &str,
) -> Vec<WsMessage> {
    if let Err(message) = check_ws_frame_size(raw_message) {
        return vec![WsMessage::error(ErrorCode::ValidationFailed.as_str(), message, false, None)];
    }

    let inbound = match serde_json::from_str::<WsMessage>(raw_message) {
        Ok(message) => message,
        Err(_) => {
            return vec![WsMessage::error(
                ErrorCode::ValidationFailed.as_str(),
                "invalid websocket frame payload",
                false,
                None,
            )]
        }
    };

    let frame_type = inbound.type_name();
    let started_at = Instant::now();
    let replies = handle_client_message(engine, handle, inbound).await;
    let is_error = replies.iter().any(|reply| matches!(reply, WsMessage::Error { .. }));
    metrics::record_ws_request(frame_type, is_error, elapsed_ms(started_at));
    replies
}

async fn handle_client_message(
    engine: &LiveEngine,
    handle: &ConnectionHandle,
    message: WsMessage,
) -> Vec<WsMessage> {
    let webinar_id = handle.webinar_id;
    let participant_id = handle.participant_id;

    match message {
        WsMessage::SubmitResponse { interaction_id, value, client_request_id } => {
            match engine.submit_response(webinar_id, interaction_id, participant_id, &value).await {
                Ok(receipt) => vec![WsMessage::ResponseAccepted {
                    response: receipt.response,
                    updated: receipt.updated,
                    late: receipt.late,
                    client_request_id,
                }],
                Err(error) => vec![engine_error_frame(error, Some(client_request_id))],
            }
        }
        WsMessage::FireReactions { kind, count } => {
            // Reactions are best-effort; failures never reach the participant.
            if let Err(error) = engine.fire_reactions(webinar_id, participant_id, &kind, count) {
                debug!(error = %error, kind = %kind, "reaction burst dropped");
            }
            Vec::new()
        }
        WsMessage::SubmitQuestion { text, client_request_id } => {
            match engine.submit_question(webinar_id, participant_id, &text).await {
                // The stored question arrives through the subscription.
                Ok(_) => Vec::new(),
                Err(error) => vec![engine_error_frame(error, Some(client_request_id))],
            }
        }
        WsMessage::UpvoteQuestion { question_id } => {
            match engine.upvote_question(webinar_id, question_id, participant_id).await {
                Ok(_) => Vec::new(),
                Err(error) => vec![engine_error_frame(error, None)],
            }
        }
        WsMessage::Resync {} => match engine.session_snapshot(webinar_id, participant_id).await {
            Ok(snapshot) => vec![WsMessage::Snapshot { snapshot: Box::new(snapshot) }],
            Err(error) => vec![engine_error_frame(error, None)],
        },
        WsMessage::Hello { .. } => vec![WsMessage::error(
            ErrorCode::ValidationFailed.as_str(),
            "hello was already received on this connection",
            false,
            None,
        )],
        other => vec![WsMessage::error(
            ErrorCode::ValidationFailed.as_str(),
            format!("`{}` frames are server-to-client only", other.type_name()),
            false,
            None,
        )],
    }
}

/// Translate one subscription event into the frames this participant sees.
async fn frames_for_event(
    engine: &LiveEngine,
    handle: &ConnectionHandle,
    event: SubscriptionEvent,
) -> Result<Vec<WsMessage>, EngineError> {
    match event {
        SubscriptionEvent::Snapshot(snapshot) | SubscriptionEvent::Resync(snapshot) => {
            Ok(vec![snapshot_frame(engine, handle, &snapshot).await?])
        }
        SubscriptionEvent::Change(change) => frames_for_change(engine, handle, &change).await,
    }
}

async fn snapshot_frame(
    engine: &LiveEngine,
    handle: &ConnectionHandle,
    snapshot: &StoreSnapshot,
) -> Result<WsMessage, EngineError> {
    let presence = engine.presence().count(handle.webinar_id).await;
    let snapshot = build_session_snapshot(snapshot, handle.participant_id, presence)?;
    Ok(WsMessage::Snapshot { snapshot: Box::new(snapshot) })
}

async fn frames_for_change(
    engine: &LiveEngine,
    handle: &ConnectionHandle,
    change: &ChangeSet,
) -> Result<Vec<WsMessage>, EngineError> {
    let webinar_id = handle.webinar_id;
    let frames = match change.table {
        Table::Interactions => {
            // Pending interactions stay host-side until activated.
            let interactions: Vec<Interaction> = change
                .decode::<Interaction>()?
                .into_iter()
                .filter(|interaction| interaction.status != InteractionStatus::Pending)
                .collect();
            if interactions.is_empty() {
                Vec::new()
            } else {
                vec![WsMessage::InteractionsChanged { interactions }]
            }
        }
        Table::Responses => {
            let interactions: BTreeSet<Uuid> = change
                .decode::<Response>()?
                .into_iter()
                .map(|response| response.interaction_id)
                .collect();
            let mut frames = Vec::with_capacity(interactions.len());
            for interaction_id in interactions {
                let tally = engine.tally(webinar_id, interaction_id).await?;
                frames.push(WsMessage::TallyUpdated { tally });
            }
            frames
        }
        Table::ReactionTotals => change
            .decode::<ReactionTotals>()?
            .into_iter()
            .map(|totals| WsMessage::ReactionCounts { counts: totals.counts })
            .collect(),
        Table::Questions | Table::QuestionVotes => {
            let questions: BTreeSet<Uuid> = if change.table == Table::Questions {
                change.decode::<Question>()?.into_iter().map(|question| question.id).collect()
            } else {
                change.decode::<QuestionVote>()?.into_iter().map(|vote| vote.question_id).collect()
            };
            let mut frames = Vec::with_capacity(questions.len());
            for question_id in questions {
                let question = engine.question(webinar_id, question_id).await?;
                frames.push(WsMessage::QuestionUpserted { question });
            }
            frames
        }
        Table::Webinars => change
            .decode::<Webinar>()?
            .into_iter()
            .map(|webinar| WsMessage::WebinarChanged { webinar })
            .collect(),
        Table::Participants => Vec::new(),
    };
    Ok(frames)
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn hello_required() -> WsMessage {
    WsMessage::error(
        ErrorCode::ValidationFailed.as_str(),
        "first WebSocket message must be a hello frame",
        false,
        None,
    )
}

fn engine_error_frame(error: EngineError, client_request_id: Option<Uuid>) -> WsMessage {
    relay_error_frame(&RelayError::from(error), client_request_id)
}

fn relay_error_frame(error: &RelayError, client_request_id: Option<Uuid>) -> WsMessage {
    let code = error.code();
    WsMessage::error(code.as_str(), error.message(), code.retryable(), client_request_id)
}

async fn send_all(socket: &mut WebSocket, messages: &[WsMessage]) -> Result<(), ()> {
    for message in messages {
        send_ws_message(socket, message).await?;
    }
    Ok(())
}

async fn send_ws_message(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let encoded = serde_json::to_string(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn elapsed_ms(started_at: Instant) -> u64 {
    started_at.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn engine_errors_become_error_frames_with_request_ids() {
        let request_id = Uuid::new_v4();
        let frame = engine_error_frame(EngineError::InteractionClosed(Uuid::new_v4()), Some(request_id));
        let WsMessage::Error { code, retryable, client_request_id, .. } = frame else {
            panic!("expected an error frame");
        };
        assert_eq!(code, "INTERACTION_CLOSED");
        assert!(!retryable);
        assert_eq!(client_request_id, Some(request_id));
    }

    #[test]
    fn stale_identity_maps_to_its_wire_code() {
        let frame = engine_error_frame(EngineError::StaleIdentity(Uuid::new_v4()), None);
        assert!(matches!(frame, WsMessage::Error { ref code, .. } if code == "STALE_IDENTITY"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_pending_ping_never_fires() {
        let fired = tokio::time::timeout(Duration::from_secs(60), wait_for_deadline(None)).await;
        assert!(fired.is_err());

        let deadline = Instant::now() + Duration::from_millis(10);
        tokio::time::timeout(Duration::from_secs(1), wait_for_deadline(Some(deadline)))
            .await
            .expect("deadline should elapse");
    }
}
