// REST calls against the relay's participant endpoints.

use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;
use webinar_common::types::{Participant, Webinar};

use crate::{error::ClientError, transport::validate_server_url};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Registry operations the mount flow depends on.
pub trait RegistryApi: Send + Sync {
    /// Resolve or create the participant for a phone number.
    fn register(
        &self,
        webinar_id: Uuid,
        phone: &str,
        display_name: Option<&str>,
    ) -> impl Future<Output = Result<Participant, ClientError>> + Send;

    /// Confirm a cached participant id still resolves.
    fn verify(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> impl Future<Output = Result<Participant, ClientError>> + Send;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    phone: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
}

#[derive(Deserialize)]
struct RegistrationEnvelope {
    participant: Participant,
}

#[derive(Deserialize)]
struct ParticipantEnvelope {
    participant: Participant,
}

#[derive(Deserialize)]
struct WebinarEnvelope {
    webinar: Webinar,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    retryable: bool,
}

#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        let base_url = validate_server_url(server_url)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("webinar-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| ClientError::Protocol(format!("failed to build http client: {error}")))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn webinar(&self, webinar_id: Uuid) -> Result<Webinar, ClientError> {
        let url = self.endpoint(&format!("v1/webinars/{webinar_id}"))?;
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        let envelope: WebinarEnvelope = decode(response, None).await?;
        Ok(envelope.webinar)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|error| ClientError::Protocol(format!("invalid endpoint `{path}`: {error}")))
    }
}

impl RegistryApi for HttpRegistry {
    async fn register(
        &self,
        webinar_id: Uuid,
        phone: &str,
        display_name: Option<&str>,
    ) -> Result<Participant, ClientError> {
        let url = self.endpoint(&format!("v1/webinars/{webinar_id}/participants"))?;
        let response = self
            .http
            .post(url)
            .header(IDEMPOTENCY_KEY_HEADER, Uuid::new_v4().to_string())
            .json(&RegisterRequest { phone, display_name })
            .send()
            .await
            .map_err(unavailable)?;
        let envelope: RegistrationEnvelope = decode(response, None).await?;
        debug!(participant_id = %envelope.participant.id, "participant registered");
        Ok(envelope.participant)
    }

    async fn verify(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<Participant, ClientError> {
        let url =
            self.endpoint(&format!("v1/webinars/{webinar_id}/participants/{participant_id}"))?;
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        let envelope: ParticipantEnvelope = decode(response, Some(participant_id)).await?;
        Ok(envelope.participant)
    }
}

fn unavailable(error: reqwest::Error) -> ClientError {
    ClientError::RegistryUnavailable(error.to_string())
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    subject: Option<Uuid>,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|error| ClientError::Protocol(format!("malformed response body: {error}")));
    }

    let body = response.text().await.unwrap_or_default();
    Err(error_from_body(status, &body, subject))
}

fn error_from_body(status: StatusCode, body: &str, subject: Option<Uuid>) -> ClientError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => {
            ClientError::from_server(&error.code, &error.message, error.retryable, subject)
        }
        Err(_) if status.is_server_error() => {
            ClientError::RegistryUnavailable(format!("server returned {status}"))
        }
        Err(_) => ClientError::Protocol(format!("unexpected {status} response")),
    }
}
