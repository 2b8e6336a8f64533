// Outbound webhook payloads and the closed-variable text template renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Interaction, Participant, Question, Webinar, WebinarStatus};

const COMMON_VARIABLES: &[&str] =
    &["event", "occurred_at", "webinar.id", "webinar.slug", "webinar.title"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookEventKind {
    ParticipantRegistered,
    InteractionActivated,
    QuestionSubmitted,
    WebinarStatusChanged,
}

impl WebhookEventKind {
    pub const ALL: [WebhookEventKind; 4] = [
        Self::ParticipantRegistered,
        Self::InteractionActivated,
        Self::QuestionSubmitted,
        Self::WebinarStatusChanged,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParticipantRegistered => "participant.registered",
            Self::InteractionActivated => "interaction.activated",
            Self::QuestionSubmitted => "question.submitted",
            Self::WebinarStatusChanged => "webinar.status_changed",
        }
    }

    /// Event-specific template variables, in addition to the common set.
    pub const fn variables(self) -> &'static [&'static str] {
        match self {
            Self::ParticipantRegistered => {
                &["participant.id", "participant.phone", "participant.display_name"]
            }
            Self::InteractionActivated => {
                &["interaction.id", "interaction.kind", "interaction.prompt"]
            }
            Self::QuestionSubmitted => &["question.id", "question.text", "participant.id"],
            Self::WebinarStatusChanged => &["webinar.status", "previous_status"],
        }
    }

    pub fn accepts(self, path: &str) -> bool {
        COMMON_VARIABLES.contains(&path) || self.variables().contains(&path)
    }
}

/// The subset of webinar fields carried by every payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebinarRef {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
}

impl From<&Webinar> for WebinarRef {
    fn from(webinar: &Webinar) -> Self {
        Self { id: webinar.id, slug: webinar.slug.clone(), title: webinar.title.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRegistered {
    pub webinar: WebinarRef,
    pub participant: Participant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionActivated {
    pub webinar: WebinarRef,
    pub interaction: Interaction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionSubmitted {
    pub webinar: WebinarRef,
    pub question: Question,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebinarStatusChanged {
    pub webinar: WebinarRef,
    pub previous_status: WebinarStatus,
    pub status: WebinarStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum WebhookEvent {
    #[serde(rename = "participant.registered")]
    ParticipantRegistered(ParticipantRegistered),
    #[serde(rename = "interaction.activated")]
    InteractionActivated(InteractionActivated),
    #[serde(rename = "question.submitted")]
    QuestionSubmitted(QuestionSubmitted),
    #[serde(rename = "webinar.status_changed")]
    WebinarStatusChanged(WebinarStatusChanged),
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookEventKind {
        match self {
            Self::ParticipantRegistered(_) => WebhookEventKind::ParticipantRegistered,
            Self::InteractionActivated(_) => WebhookEventKind::InteractionActivated,
            Self::QuestionSubmitted(_) => WebhookEventKind::QuestionSubmitted,
            Self::WebinarStatusChanged(_) => WebhookEventKind::WebinarStatusChanged,
        }
    }

    pub fn webinar(&self) -> &WebinarRef {
        match self {
            Self::ParticipantRegistered(payload) => &payload.webinar,
            Self::InteractionActivated(payload) => &payload.webinar,
            Self::QuestionSubmitted(payload) => &payload.webinar,
            Self::WebinarStatusChanged(payload) => &payload.webinar,
        }
    }

    /// Resolve one event-specific variable path. Common paths are handled by the renderer.
    fn variable(&self, path: &str) -> Option<String> {
        match (self, path) {
            (Self::ParticipantRegistered(p), "participant.id") => Some(p.participant.id.to_string()),
            (Self::ParticipantRegistered(p), "participant.phone") => Some(p.participant.phone.clone()),
            (Self::ParticipantRegistered(p), "participant.display_name") => {
                Some(p.participant.display_name.clone().unwrap_or_default())
            }
            (Self::InteractionActivated(p), "interaction.id") => Some(p.interaction.id.to_string()),
            (Self::InteractionActivated(p), "interaction.kind") => {
                serde_json::to_value(p.interaction.kind)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
            }
            (Self::InteractionActivated(p), "interaction.prompt") => Some(p.interaction.prompt.clone()),
            (Self::QuestionSubmitted(p), "question.id") => Some(p.question.id.to_string()),
            (Self::QuestionSubmitted(p), "question.text") => Some(p.question.text.clone()),
            (Self::QuestionSubmitted(p), "participant.id") => Some(p.question.participant_id.to_string()),
            (Self::WebinarStatusChanged(p), "webinar.status") => Some(p.status.as_str().to_string()),
            (Self::WebinarStatusChanged(p), "previous_status") => {
                Some(p.previous_status.as_str().to_string())
            }
            _ => None,
        }
    }
}

/// Wire body posted to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEnvelope {
    #[serde(flatten)]
    pub event: WebhookEvent,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template placeholder opened at byte {0} is never closed")]
    Unclosed(usize),

    #[error("template placeholder is empty")]
    EmptyPlaceholder,

    #[error("unknown template variable `{0}`")]
    UnknownVariable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A text template that may only reference known payload paths.
///
/// Validated once at configuration time; rendering cannot fail for an
/// event whose kind accepts every referenced path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRenderer {
    segments: Vec<Segment>,
}

impl TemplateRenderer {
    pub fn compile(template: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or(TemplateError::Unclosed(offset + open))?;
            let path = after_open[..close].trim();
            if path.is_empty() {
                return Err(TemplateError::EmptyPlaceholder);
            }
            if !WebhookEventKind::ALL.iter().any(|kind| kind.accepts(path)) {
                return Err(TemplateError::UnknownVariable(path.to_string()));
            }
            segments.push(Segment::Variable(path.to_string()));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Whether every referenced path exists on events of this kind.
    pub fn applies_to(&self, kind: WebhookEventKind) -> bool {
        self.segments.iter().all(|segment| match segment {
            Segment::Literal(_) => true,
            Segment::Variable(path) => kind.accepts(path),
        })
    }

    /// Render for one event, or `None` when the template does not apply to its kind.
    pub fn render(&self, event: &WebhookEvent, occurred_at: DateTime<Utc>) -> Option<String> {
        if !self.applies_to(event.kind()) {
            return None;
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(path) => {
                    let webinar = event.webinar();
                    let value = match path.as_str() {
                        "event" => event.kind().as_str().to_string(),
                        "occurred_at" => occurred_at.to_rfc3339(),
                        "webinar.id" => webinar.id.to_string(),
                        "webinar.slug" => webinar.slug.clone(),
                        "webinar.title" => webinar.title.clone(),
                        other => event.variable(other)?,
                    };
                    out.push_str(&value);
                }
            }
        }
        Some(out)
    }
}
