use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use webinar_common::types::{
    Interaction, Participant, Question, QuestionVote, ReactionCounts, Response, Webinar,
};

use super::{Record, Table};

/// Cumulative per-kind reaction counts for one webinar. Counts never decrease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionTotals {
    pub webinar_id: Uuid,
    pub counts: ReactionCounts,
    pub updated_at: DateTime<Utc>,
}

impl Record for Webinar {
    const TABLE: Table = Table::Webinars;

    fn conflict_key(&self) -> String {
        self.id.to_string()
    }

    fn webinar_id(&self) -> Uuid {
        self.id
    }
}

impl Record for Participant {
    const TABLE: Table = Table::Participants;

    fn conflict_key(&self) -> String {
        participant_key(self.webinar_id, &self.phone)
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

impl Record for Interaction {
    const TABLE: Table = Table::Interactions;

    fn conflict_key(&self) -> String {
        self.id.to_string()
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

impl Record for Response {
    const TABLE: Table = Table::Responses;

    fn conflict_key(&self) -> String {
        format!("{}:{}", self.interaction_id, self.participant_id)
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

impl Record for ReactionTotals {
    const TABLE: Table = Table::ReactionTotals;

    fn conflict_key(&self) -> String {
        self.webinar_id.to_string()
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

impl Record for Question {
    const TABLE: Table = Table::Questions;

    fn conflict_key(&self) -> String {
        self.id.to_string()
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

impl Record for QuestionVote {
    const TABLE: Table = Table::QuestionVotes;

    fn conflict_key(&self) -> String {
        format!("{}:{}", self.question_id, self.participant_id)
    }

    fn webinar_id(&self) -> Uuid {
        self.webinar_id
    }
}

/// One participant per canonical phone per webinar.
pub fn participant_key(webinar_id: Uuid, canonical_phone: &str) -> String {
    format!("{webinar_id}:{canonical_phone}")
}
