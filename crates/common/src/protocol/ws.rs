// WebSocket message types for the webinar-live.v1 protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    Interaction, Participant, QuestionView, ReactionCounts, Response, SessionSnapshot, Tally,
    Webinar,
};

pub const CURRENT_PROTOCOL_VERSION: &str = "webinar-live.v1";
pub const PREVIOUS_PROTOCOL_VERSION: &str = "webinar-live.v0";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[CURRENT_PROTOCOL_VERSION, PREVIOUS_PROTOCOL_VERSION];

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
pub const MAX_REACTION_BURST: u32 = 50;

pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// All message types in the webinar-live.v1 WebSocket protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: must be the first frame on a connection.
    Hello { protocol_version: String, webinar_id: Uuid, participant_id: Uuid },

    /// Server -> Client: handshake acknowledgement.
    HelloAck { server_time: String, participant: Participant, heartbeat_interval_ms: u64 },

    /// Server -> Client: full state; clients replace everything they hold.
    Snapshot { snapshot: Box<SessionSnapshot> },

    /// Server -> Client: one atomic change to the interaction set.
    InteractionsChanged { interactions: Vec<Interaction> },

    /// Client -> Server: answer the given interaction.
    SubmitResponse { interaction_id: Uuid, value: String, client_request_id: Uuid },

    /// Server -> Client: the sender's response was stored.
    ResponseAccepted { response: Response, updated: bool, late: bool, client_request_id: Uuid },

    /// Server -> Client: recomputed tally for one interaction.
    TallyUpdated { tally: Tally },

    /// Client -> Server: a locally batched burst of reactions.
    FireReactions { kind: String, count: u32 },

    /// Server -> Client: cumulative per-kind reaction counts.
    ReactionCounts { counts: ReactionCounts },

    /// Client -> Server: ask a question.
    SubmitQuestion { text: String, client_request_id: Uuid },

    /// Client -> Server: upvote a question.
    UpvoteQuestion { question_id: Uuid },

    /// Server -> Client: a question was created, answered or upvoted.
    QuestionUpserted { question: QuestionView },

    /// Server -> Client: distinct connected participants.
    PresenceChanged { count: u64 },

    /// Server -> Client: webinar metadata or status changed.
    WebinarChanged { webinar: Webinar },

    /// Client -> Server: request a fresh snapshot.
    Resync {},

    /// Server -> Client: error.
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_request_id: Option<Uuid>,
    },
}

impl WsMessage {
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        client_request_id: Option<Uuid>,
    ) -> Self {
        Self::Error { code: code.into(), message: message.into(), retryable, client_request_id }
    }

    /// Stable frame name for logs and metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::HelloAck { .. } => "hello_ack",
            Self::Snapshot { .. } => "snapshot",
            Self::InteractionsChanged { .. } => "interactions_changed",
            Self::SubmitResponse { .. } => "submit_response",
            Self::ResponseAccepted { .. } => "response_accepted",
            Self::TallyUpdated { .. } => "tally_updated",
            Self::FireReactions { .. } => "fire_reactions",
            Self::ReactionCounts { .. } => "reaction_counts",
            Self::SubmitQuestion { .. } => "submit_question",
            Self::UpvoteQuestion { .. } => "upvote_question",
            Self::QuestionUpserted { .. } => "question_upserted",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::WebinarChanged { .. } => "webinar_changed",
            Self::Resync {} => "resync",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_uses_snake_case_tag() {
        let message = WsMessage::Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            webinar_id: Uuid::nil(),
            participant_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["protocol_version"], "webinar-live.v1");
    }

    #[test]
    fn resync_parses_from_bare_type() {
        let parsed: WsMessage = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(parsed, WsMessage::Resync {});
    }

    #[test]
    fn error_omits_missing_request_id() {
        let json =
            serde_json::to_value(WsMessage::error("NOT_FOUND", "missing", false, None)).unwrap();
        assert!(json.get("client_request_id").is_none());
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn type_name_matches_serialized_tag() {
        let message = WsMessage::FireReactions { kind: "clap".into(), count: 3 };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], message.type_name());
    }

    #[test]
    fn previous_version_is_still_supported() {
        assert!(is_supported_protocol_version("webinar-live.v0"));
        assert!(!is_supported_protocol_version("webinar-live.v2"));
    }
}
