// Core domain types shared across all webinar-live crates.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cumulative reaction counts keyed by reaction kind.
pub type ReactionCounts = BTreeMap<String, u64>;

/// Lifecycle of a webinar. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WebinarStatus {
    Scheduled,
    Live,
    Ended,
}

impl WebinarStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }

    pub fn can_transition_to(self, next: WebinarStatus) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Live) | (Self::Scheduled, Self::Ended) | (Self::Live, Self::Ended)
        ) || self == next
    }
}

/// A scheduled live session. Created by the external scheduling flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webinar {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub status: WebinarStatus,
    /// Opaque embed reference for the third-party video stream.
    pub stream_url: String,
    #[serde(default)]
    pub allow_late_responses: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A phone-identified attendee of one specific webinar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub webinar_id: Uuid,
    /// Canonical international form, e.g. `+989123456789`.
    pub phone: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Poll,
    OpenText,
    Rating,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    /// Created ahead of time, never activated.
    Pending,
    Active,
    Closed,
}

/// A host-broadcast poll or prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interaction {
    pub id: Uuid,
    pub webinar_id: Uuid,
    pub kind: InteractionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Upper bound for `rating` interactions (1..=scale).
    #[serde(default)]
    pub scale: Option<u8>,
    /// Per-webinar creation order.
    pub seq: i64,
    pub status: InteractionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Interaction {
    pub fn is_active(&self) -> bool {
        self.status == InteractionStatus::Active
    }

    pub fn is_closed(&self) -> bool {
        self.status == InteractionStatus::Closed
    }
}

/// Host input for a new interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InteractionDraft {
    pub kind: InteractionKind,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub scale: Option<u8>,
}

/// A participant's answer to one interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: Uuid,
    pub interaction_id: Uuid,
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
    pub value: String,
    /// Accepted after the interaction closed.
    #[serde(default)]
    pub late: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyEntry {
    pub value: String,
    pub count: u64,
}

/// Live counts per value for one interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tally {
    pub interaction_id: Uuid,
    pub entries: Vec<TallyEntry>,
    pub total: u64,
}

impl Tally {
    pub fn count_for(&self, value: &str) -> u64 {
        self.entries.iter().find(|entry| entry.value == value).map(|entry| entry.count).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Open,
    Answered,
}

/// A participant-submitted question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: Uuid,
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
    pub text: String,
    pub status: QuestionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
}

/// One participant's upvote on one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionVote {
    pub question_id: Uuid,
    pub webinar_id: Uuid,
    pub participant_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A question together with its derived upvote count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionView {
    #[serde(flatten)]
    pub question: Question,
    pub upvotes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionOrder {
    #[default]
    Recent,
    Upvotes,
}

/// Full current state of a webinar as seen by one participant.
///
/// Sent on every (re)connect; clients replace their state with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub webinar: Webinar,
    #[serde(default)]
    pub active: Option<Interaction>,
    #[serde(default)]
    pub history: Vec<Interaction>,
    #[serde(default)]
    pub my_responses: Vec<Response>,
    #[serde(default)]
    pub tallies: Vec<Tally>,
    #[serde(default)]
    pub reaction_counts: ReactionCounts,
    #[serde(default)]
    pub questions: Vec<QuestionView>,
    pub presence: u64,
}

/// Orders closed interactions by the time they closed, oldest first.
pub fn sort_history(history: &mut [Interaction]) {
    history.sort_by(|left, right| {
        left.closed_at.cmp(&right.closed_at).then_with(|| left.seq.cmp(&right.seq))
    });
}

/// Stable display ordering for questions. Never keyed on a mutable status.
pub fn sort_questions(questions: &mut [QuestionView], order: QuestionOrder) {
    let recent = |left: &QuestionView, right: &QuestionView| -> Ordering {
        right
            .question
            .created_at
            .cmp(&left.question.created_at)
            .then_with(|| right.question.id.cmp(&left.question.id))
    };

    match order {
        QuestionOrder::Recent => questions.sort_by(recent),
        QuestionOrder::Upvotes => questions
            .sort_by(|left, right| right.upvotes.cmp(&left.upvotes).then_with(|| recent(left, right))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn question_at(offset_secs: i64, id: u128, upvotes: u64) -> QuestionView {
        let base = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp should parse")
            .with_timezone(&Utc);
        QuestionView {
            question: Question {
                id: Uuid::from_u128(id),
                webinar_id: Uuid::nil(),
                participant_id: Uuid::nil(),
                text: format!("q{id}"),
                status: QuestionStatus::Open,
                created_at: base + Duration::seconds(offset_secs),
                answered_at: None,
            },
            upvotes,
        }
    }

    #[test]
    fn webinar_status_only_moves_forward() {
        assert!(WebinarStatus::Scheduled.can_transition_to(WebinarStatus::Live));
        assert!(WebinarStatus::Live.can_transition_to(WebinarStatus::Ended));
        assert!(WebinarStatus::Scheduled.can_transition_to(WebinarStatus::Ended));
        assert!(WebinarStatus::Live.can_transition_to(WebinarStatus::Live));
        assert!(!WebinarStatus::Ended.can_transition_to(WebinarStatus::Live));
        assert!(!WebinarStatus::Live.can_transition_to(WebinarStatus::Scheduled));
    }

    #[test]
    fn recent_order_is_newest_first_with_id_tiebreak() {
        let mut questions =
            vec![question_at(0, 1, 0), question_at(10, 2, 0), question_at(10, 3, 0)];
        sort_questions(&mut questions, QuestionOrder::Recent);

        let ids: Vec<u128> = questions.iter().map(|q| q.question.id.as_u128()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn upvote_order_falls_back_to_recency() {
        let mut questions =
            vec![question_at(0, 1, 5), question_at(10, 2, 1), question_at(20, 3, 5)];
        sort_questions(&mut questions, QuestionOrder::Upvotes);

        let ids: Vec<u128> = questions.iter().map(|q| q.question.id.as_u128()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn answering_does_not_reshuffle_recent_order() {
        let mut questions =
            vec![question_at(0, 1, 0), question_at(10, 2, 0), question_at(20, 3, 0)];
        sort_questions(&mut questions, QuestionOrder::Recent);
        let before: Vec<Uuid> = questions.iter().map(|q| q.question.id).collect();

        questions[1].question.status = QuestionStatus::Answered;
        sort_questions(&mut questions, QuestionOrder::Recent);
        let after: Vec<Uuid> = questions.iter().map(|q| q.question.id).collect();

        assert_eq!(before, after);
    }

    #[test]
    fn question_view_flattens_question_fields() {
        let view = question_at(0, 7, 2);
        let json = serde_json::to_value(&view).expect("question view should serialize");
        assert_eq!(json["text"], "q7");
        assert_eq!(json["upvotes"], 2);
        assert_eq!(json["status"], "open");
    }

    #[test]
    fn tally_count_for_missing_value_is_zero() {
        let tally = Tally {
            interaction_id: Uuid::nil(),
            entries: vec![TallyEntry { value: "A".into(), count: 1 }],
            total: 1,
        };
        assert_eq!(tally.count_for("A"), 1);
        assert_eq!(tally.count_for("B"), 0);
    }
}
