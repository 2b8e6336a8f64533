// Client-side error taxonomy.
//
// Server error codes (REST envelopes and websocket `error` frames) are folded
// into the variants the session orchestration reacts to; anything else is
// carried through as `Server`.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("participant registry is unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("interaction {0} is closed")]
    InteractionClosed(Uuid),

    #[error("live connection lost: {0}")]
    TransportDisconnected(String),

    #[error("cached participant {0} no longer exists")]
    StaleIdentity(Uuid),

    #[error("registration redirect requested twice in one mount")]
    RegistrationLoop,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("identity cache error: {0}")]
    Cache(String),

    #[error("{code}: {message}")]
    Server { code: String, message: String, retryable: bool },
}

impl ClientError {
    /// Map a server error code onto the client taxonomy.
    ///
    /// `subject` is the id the request was about: the participant for
    /// identity calls, the interaction for submissions.
    pub fn from_server(code: &str, message: &str, retryable: bool, subject: Option<Uuid>) -> Self {
        match (code, subject) {
            ("REGISTRY_UNAVAILABLE", _) => Self::RegistryUnavailable(message.to_string()),
            ("STALE_IDENTITY", Some(id)) => Self::StaleIdentity(id),
            ("INTERACTION_CLOSED", Some(id)) => Self::InteractionClosed(id),
            _ => Self::Server { code: code.to_string(), message: message.to_string(), retryable },
        }
    }

    /// Stable code for CLI output.
    pub fn code(&self) -> &str {
        match self {
            Self::RegistryUnavailable(_) => "REGISTRY_UNAVAILABLE",
            Self::InteractionClosed(_) => "INTERACTION_CLOSED",
            Self::TransportDisconnected(_) => "TRANSPORT_DISCONNECTED",
            Self::StaleIdentity(_) => "STALE_IDENTITY",
            Self::RegistrationLoop => "REGISTRATION_LOOP",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Server { code, .. } => code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RegistryUnavailable(_) | Self::TransportDisconnected(_) => true,
            Self::Server { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
