use uuid::Uuid;
use webinar_common::phone::PhoneError;

use crate::{
    error::{ErrorCode, RelayError},
    store::StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("participant registry is unavailable")]
    RegistryUnavailable(#[source] StoreError),

    #[error("interaction {0} is closed")]
    InteractionClosed(Uuid),

    #[error("participant {0} no longer exists")]
    StaleIdentity(Uuid),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid phone number: {0}")]
    InvalidPhone(#[from] PhoneError),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RegistryUnavailable(_) => ErrorCode::RegistryUnavailable,
            Self::InteractionClosed(_) => ErrorCode::InteractionClosed,
            Self::StaleIdentity(_) => ErrorCode::StaleIdentity,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidPhone(_) | Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::InvalidTransition(_) => ErrorCode::InvalidTransition,
            Self::Forbidden(_) => ErrorCode::AuthForbidden,
            Self::Store(_) => ErrorCode::InternalError,
        }
    }
}

impl From<EngineError> for RelayError {
    fn from(error: EngineError) -> Self {
        let code = error.code();
        match &error {
            // Backend details stay in the logs.
            EngineError::Store(_) | EngineError::RegistryUnavailable(_) => {
                tracing::error!(error = ?error, "engine store failure");
                RelayError::from_code(code)
            }
            _ => RelayError::new(code, error.to_string()),
        }
    }
}
