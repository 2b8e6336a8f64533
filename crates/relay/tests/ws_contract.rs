use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use webinar_common::{
    protocol::ws::{
        WsMessage, CURRENT_PROTOCOL_VERSION, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
        MAX_FRAME_BYTES,
    },
    types::{InteractionDraft, InteractionKind, WebinarStatus},
};
use webinar_relay::{
    api::AppState,
    auth::jwt::JwtHostTokenService,
    build_router,
    engine::{webinars::WebinarUpsert, EngineConfig, LiveEngine},
    metrics::RelayMetrics,
    store::LiveStore,
};

const RELAY_PROTOCOL_SOURCE: &str = include_str!("../src/protocol.rs");
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[test]
fn websocket_contract_heartbeat_and_frame_limits() {
    assert_eq!(HEARTBEAT_INTERVAL_MS, 15_000);
    assert_eq!(HEARTBEAT_TIMEOUT_MS, 10_000);
    assert_eq!(MAX_FRAME_BYTES, 65_536);
    assert!(
        HEARTBEAT_TIMEOUT_MS < HEARTBEAT_INTERVAL_MS,
        "pong timeout must be shorter than heartbeat interval",
    );
}

#[test]
fn websocket_contract_protocol_version_is_webinar_live_v1() {
    assert_eq!(CURRENT_PROTOCOL_VERSION, "webinar-live.v1");
    assert!(RELAY_PROTOCOL_SOURCE.contains("SUPPORTED_PROTOCOL_VERSIONS"));
    assert!(RELAY_PROTOCOL_SOURCE.contains("UpgradeRequired"));
}

#[test]
fn websocket_contract_message_shapes() {
    let webinar_id = Uuid::new_v4();
    let participant_id = Uuid::new_v4();
    let interaction_id = Uuid::new_v4();
    let client_request_id = Uuid::new_v4();

    let samples = [
        (
            WsMessage::Hello {
                protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
                webinar_id,
                participant_id,
            },
            "hello",
            &["type", "protocol_version", "webinar_id", "participant_id"][..],
        ),
        (
            WsMessage::SubmitResponse { interaction_id, value: "A".into(), client_request_id },
            "submit_response",
            &["type", "interaction_id", "value", "client_request_id"][..],
        ),
        (
            WsMessage::FireReactions { kind: "clap".into(), count: 3 },
            "fire_reactions",
            &["type", "kind", "count"][..],
        ),
        (
            WsMessage::SubmitQuestion { text: "When is the replay?".into(), client_request_id },
            "submit_question",
            &["type", "text", "client_request_id"][..],
        ),
        (
            WsMessage::UpvoteQuestion { question_id: Uuid::new_v4() },
            "upvote_question",
            &["type", "question_id"][..],
        ),
        (WsMessage::PresenceChanged { count: 4 }, "presence_changed", &["type", "count"][..]),
        (WsMessage::Resync {}, "resync", &["type"][..]),
        (
            WsMessage::error("INTERACTION_CLOSED", "closed", false, Some(client_request_id)),
            "error",
            &["type", "code", "message", "retryable", "client_request_id"][..],
        ),
    ];

    for (message, expected_type, expected_keys) in samples {
        let json = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(json["type"], expected_type);
        assert_eq!(message.type_name(), expected_type);

        let object = json.as_object().expect("message should be a json object");
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        let mut expected: Vec<&str> = expected_keys.to_vec();
        expected.sort_unstable();
        assert_eq!(keys, expected, "unexpected keys for {expected_type}");

        let parsed: WsMessage = serde_json::from_value(json).expect("message should round-trip");
        assert_eq!(parsed, message);
    }
}

struct LiveServer {
    engine: Arc<LiveEngine>,
    addr: std::net::SocketAddr,
    webinar_id: Uuid,
}

impl LiveServer {
    async fn start() -> Self {
        let engine = LiveEngine::init(LiveStore::memory(), EngineConfig::default())
            .expect("engine should start");
        let jwt_service = Arc::new(
            JwtHostTokenService::new("webinar_test_secret_that_is_definitely_long_enough")
                .expect("test jwt service should initialize"),
        );
        let app = build_router(
            AppState {
                engine: Arc::clone(&engine),
                jwt_service,
                metrics: Arc::new(RelayMetrics::default()),
            },
            None,
        );

        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server should run");
        });

        let webinar_id = Uuid::new_v4();
        engine
            .upsert_webinar(
                webinar_id,
                WebinarUpsert {
                    slug: "socket".into(),
                    title: "Socket test".into(),
                    starts_at: Utc::now(),
                    ends_at: None,
                    stream_url: "https://stream.example/embed/socket".into(),
                    allow_late_responses: false,
                },
            )
            .await
            .expect("webinar upsert should succeed");
        engine
            .set_webinar_status(webinar_id, WebinarStatus::Live)
            .await
            .expect("webinar should go live");

        Self { engine, addr, webinar_id }
    }

    async fn connect(&self) -> Socket {
        let url = format!("ws://{}/v1/webinars/{}/live", self.addr, self.webinar_id);
        let (socket, _) = connect_async(url).await.expect("socket should connect");
        socket
    }

    async fn participant(&self, phone: &str) -> Uuid {
        self.engine
            .register_participant(self.webinar_id, phone, None)
            .await
            .expect("registration should succeed")
            .participant
            .id
    }
}

async fn send(socket: &mut Socket, message: &WsMessage) {
    let text = serde_json::to_string(message).expect("message should serialize");
    socket.send(Message::Text(text.into())).await.expect("frame should send");
}

/// Next text frame, skipping control frames.
async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("frame should arrive in time")
            .expect("socket should stay open")
            .expect("frame should be readable");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("frame should be json");
        }
    }
}

async fn next_frame_of_type(socket: &mut Socket, frame_type: &str) -> Value {
    loop {
        let frame = next_frame(socket).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
}

async fn say_hello(server: &LiveServer, socket: &mut Socket, participant_id: Uuid) {
    send(
        socket,
        &WsMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            webinar_id: server.webinar_id,
            participant_id,
        },
    )
    .await;
}

#[tokio::test]
async fn hello_is_acknowledged_and_followed_by_a_snapshot() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;

    say_hello(&server, &mut socket, participant_id).await;

    let ack = next_frame(&mut socket).await;
    assert_eq!(ack["type"], "hello_ack");
    assert_eq!(ack["participant"]["id"], participant_id.to_string());
    assert_eq!(ack["participant"]["phone"], "+989123456789");
    assert_eq!(ack["heartbeat_interval_ms"], HEARTBEAT_INTERVAL_MS);

    let snapshot = next_frame_of_type(&mut socket, "snapshot").await;
    assert_eq!(snapshot["snapshot"]["webinar"]["id"], server.webinar_id.to_string());
    assert_eq!(snapshot["snapshot"]["webinar"]["status"], "live");
    assert!(snapshot["snapshot"]["active"].is_null());
}

#[tokio::test]
async fn stale_identity_is_reported_and_the_socket_closes() {
    let server = LiveServer::start().await;
    let mut socket = server.connect().await;

    say_hello(&server, &mut socket, Uuid::new_v4()).await;

    let error = next_frame(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "STALE_IDENTITY");

    let closed = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
        .await
        .expect("close should arrive in time");
    assert!(matches!(closed, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}

#[tokio::test]
async fn unsupported_protocol_version_is_rejected() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;

    send(
        &mut socket,
        &WsMessage::Hello {
            protocol_version: "webinar-live.v99".to_string(),
            webinar_id: server.webinar_id,
            participant_id,
        },
    )
    .await;

    let error = next_frame(&mut socket).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "UPGRADE_REQUIRED");
}

#[tokio::test]
async fn published_interactions_and_responses_flow_over_the_socket() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;
    say_hello(&server, &mut socket, participant_id).await;
    next_frame_of_type(&mut socket, "snapshot").await;

    let activation = server
        .engine
        .publish_interaction(
            server.webinar_id,
            InteractionDraft {
                kind: InteractionKind::Poll,
                prompt: "Pick one".into(),
                options: vec!["A".into(), "B".into()],
                scale: None,
            },
        )
        .await
        .expect("publish should succeed");
    let interaction_id = activation.activated.id;

    loop {
        let changed = next_frame_of_type(&mut socket, "interactions_changed").await;
        let interactions = changed["interactions"].as_array().expect("interactions array");
        if interactions
            .iter()
            .any(|row| row["id"] == interaction_id.to_string() && row["status"] == "active")
        {
            break;
        }
    }

    let client_request_id = Uuid::new_v4();
    send(
        &mut socket,
        &WsMessage::SubmitResponse { interaction_id, value: "B".into(), client_request_id },
    )
    .await;
    let accepted = next_frame_of_type(&mut socket, "response_accepted").await;
    assert_eq!(accepted["client_request_id"], client_request_id.to_string());
    assert_eq!(accepted["response"]["value"], "B");
    assert_eq!(accepted["updated"], false);

    let tally = server.engine.tally(server.webinar_id, interaction_id).await.expect("tally");
    assert_eq!(tally.count_for("B"), 1);
}

#[tokio::test]
async fn resync_returns_a_fresh_snapshot() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;
    say_hello(&server, &mut socket, participant_id).await;
    next_frame_of_type(&mut socket, "snapshot").await;

    send(&mut socket, &WsMessage::Resync {}).await;
    let snapshot = next_frame_of_type(&mut socket, "snapshot").await;
    assert_eq!(snapshot["snapshot"]["webinar"]["id"], server.webinar_id.to_string());
}

#[tokio::test]
async fn rejected_reaction_bursts_stay_silent() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;
    say_hello(&server, &mut socket, participant_id).await;
    next_frame_of_type(&mut socket, "snapshot").await;

    send(&mut socket, &WsMessage::FireReactions { kind: "pizza".into(), count: 2 }).await;
    send(&mut socket, &WsMessage::Resync {}).await;

    loop {
        let frame = next_frame(&mut socket).await;
        assert_ne!(frame["type"], "error", "reaction failures are not reported: {frame}");
        if frame["type"] == "snapshot" {
            break;
        }
    }
}

#[tokio::test]
async fn pending_interactions_are_not_streamed() {
    let server = LiveServer::start().await;
    let participant_id = server.participant("09123456789").await;
    let mut socket = server.connect().await;
    say_hello(&server, &mut socket, participant_id).await;
    next_frame_of_type(&mut socket, "snapshot").await;

    let draft = |prompt: &str| InteractionDraft {
        kind: InteractionKind::Poll,
        prompt: prompt.into(),
        options: vec!["A".into(), "B".into()],
        scale: None,
    };
    let queued = server
        .engine
        .create_interaction(server.webinar_id, draft("Later"))
        .await
        .expect("create should succeed");
    let published = server
        .engine
        .publish_interaction(server.webinar_id, draft("Now"))
        .await
        .expect("publish should succeed");

    let changed = next_frame_of_type(&mut socket, "interactions_changed").await;
    let rows = changed["interactions"].as_array().expect("interactions array");
    assert!(rows.iter().all(|row| row["id"] != queued.id.to_string()));
    assert!(rows.iter().any(|row| row["id"] == published.activated.id.to_string()));
}
