// Q&A manager: append-only questions, host-driven answered status, and one
// upvote per participant per question.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info_span, Instrument};
use uuid::Uuid;
use webinar_common::types::{
    sort_questions, Participant, Question, QuestionOrder, QuestionStatus, QuestionView,
    QuestionVote, Webinar, WebinarStatus,
};

use super::EngineError;
use crate::{
    metrics,
    store::{Filter, LiveStore, OnConflict},
};

pub const MAX_QUESTION_CHARS: usize = 1_000;

#[derive(Clone)]
pub struct QaManager {
    store: LiveStore,
}

impl QaManager {
    pub fn new(store: LiveStore) -> Self {
        Self { store }
    }

    pub async fn submit_question(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
        text: &str,
    ) -> Result<Question, EngineError> {
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_QUESTION_CHARS {
            return Err(EngineError::validation(format!(
                "question must be 1-{MAX_QUESTION_CHARS} characters"
            )));
        }

        async {
            let webinar = self
                .store
                .get::<Webinar>(&webinar_id.to_string())
                .await?
                .ok_or(EngineError::NotFound("webinar"))?;
            if webinar.status == WebinarStatus::Ended {
                return Err(EngineError::invalid_transition("webinar has ended"));
            }
            self.require_participant(webinar_id, participant_id).await?;

            let question = Question {
                id: Uuid::new_v4(),
                webinar_id,
                participant_id,
                text: text.to_string(),
                status: QuestionStatus::Open,
                created_at: Utc::now(),
                answered_at: None,
            };
            let stored = self.store.upsert(&question, OnConflict::KeepExisting).await?;
            metrics::increment_questions_total();
            Ok(stored.row)
        }
        .instrument(info_span!("qa.submit", webinar_id = %webinar_id, participant_id = %participant_id))
        .await
    }

    /// Host-only. Marking an answered question again changes nothing.
    pub async fn mark_answered(
        &self,
        webinar_id: Uuid,
        question_id: Uuid,
    ) -> Result<QuestionView, EngineError> {
        let question = self.question(webinar_id, question_id).await?;
        let question = match question.status {
            QuestionStatus::Answered => question,
            QuestionStatus::Open => {
                let answered = Question {
                    status: QuestionStatus::Answered,
                    answered_at: Some(Utc::now()),
                    ..question
                };
                self.store.upsert(&answered, OnConflict::Replace).await?.row
            }
        };
        self.view(question).await
    }

    /// Record one participant's upvote. Repeat votes are absorbed by the unique key.
    pub async fn upvote(
        &self,
        webinar_id: Uuid,
        question_id: Uuid,
        participant_id: Uuid,
    ) -> Result<QuestionView, EngineError> {
        let question = self.question(webinar_id, question_id).await?;
        self.require_participant(webinar_id, participant_id).await?;

        let vote = QuestionVote { question_id, webinar_id, participant_id, created_at: Utc::now() };
        self.store.upsert(&vote, OnConflict::KeepExisting).await?;
        self.view(question).await
    }

    pub async fn list(
        &self,
        webinar_id: Uuid,
        order: QuestionOrder,
    ) -> Result<Vec<QuestionView>, EngineError> {
        let filter = Filter::webinar(webinar_id);
        let questions = self.store.query::<Question>(&filter).await?;
        let votes = self.store.query::<QuestionVote>(&filter).await?;
        Ok(question_views(questions, &votes, order))
    }

    /// Current view of one question, with its derived upvote count.
    pub async fn get(&self, webinar_id: Uuid, question_id: Uuid) -> Result<QuestionView, EngineError> {
        let question = self.question(webinar_id, question_id).await?;
        self.view(question).await
    }

    async fn view(&self, question: Question) -> Result<QuestionView, EngineError> {
        let filter =
            Filter::webinar(question.webinar_id).field("question_id", question.id.to_string());
        let upvotes = self.store.query::<QuestionVote>(&filter).await?.len() as u64;
        Ok(QuestionView { question, upvotes })
    }

    async fn question(&self, webinar_id: Uuid, question_id: Uuid) -> Result<Question, EngineError> {
        self.store
            .get::<Question>(&question_id.to_string())
            .await?
            .filter(|question| question.webinar_id == webinar_id)
            .ok_or(EngineError::NotFound("question"))
    }

    async fn require_participant(
        &self,
        webinar_id: Uuid,
        participant_id: Uuid,
    ) -> Result<(), EngineError> {
        let filter = Filter::webinar(webinar_id).field("id", participant_id.to_string());
        if self.store.query::<Participant>(&filter).await?.is_empty() {
            return Err(EngineError::StaleIdentity(participant_id));
        }
        Ok(())
    }
}

/// Join questions with their vote counts and apply the display order.
pub fn question_views(
    questions: Vec<Question>,
    votes: &[QuestionVote],
    order: QuestionOrder,
) -> Vec<QuestionView> {
    let mut counts: HashMap<Uuid, u64> = HashMap::new();
    for vote in votes {
        *counts.entry(vote.question_id).or_default() += 1;
    }

    let mut views: Vec<QuestionView> = questions
        .into_iter()
        .map(|question| {
            let upvotes = counts.get(&question.id).copied().unwrap_or(0);
            QuestionView { question, upvotes }
        })
        .collect();
    sort_questions(&mut views, order);
    views
}
